//! Turns a `SandboxConfig` into a pod manifest.
//!
//! The security context is not configurable: every sandbox runs as uid
//! 1000 with all capabilities dropped, no privilege escalation, and the
//! runtime's default seccomp profile.

use std::collections::BTreeMap;

use super::kube::models::*;
use super::types::{ProviderConfig, SandboxConfig, VolumeType};

pub const CONTAINER_NAME: &str = "agent";
pub const WORKSPACE_PATH: &str = "/workspace";
pub const SANDBOX_UID: i64 = 1000;

pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "agentpod";
pub const LABEL_PROJECT_ID: &str = "agentpod.io/project-id";
pub const LABEL_SANDBOX_ID: &str = "agentpod.io/sandbox-id";
pub const LABEL_POOL: &str = "agentpod.io/pool";
/// Unsanitized project id, kept so a rehydrated handle reports the id the
/// caller used.
pub const ANNOTATION_PROJECT_ID: &str = "agentpod.io/project-id";
pub const ANNOTATION_IMAGE: &str = "agentpod.io/image";

pub const POOL_WARM: &str = "warm";
pub const POOL_ALLOCATED: &str = "allocated";

const MAX_PROJECT_SEGMENT: usize = 40;
const MAX_LABEL_VALUE: usize = 63;

/// Lowercase, map anything outside `[a-z0-9-]` to `-`, collapse runs of
/// `-`, trim to `max` and strip leading/trailing `-`.
pub fn dns_safe(s: &str, max: usize) -> String {
    let mut out = String::with_capacity(s.len().min(max));
    for c in s.chars().flat_map(char::to_lowercase) {
        let c = if c.is_ascii_lowercase() || c.is_ascii_digit() { c } else { '-' };
        if c == '-' && out.ends_with('-') {
            continue;
        }
        out.push(c);
    }
    let trimmed: String = out.trim_matches('-').chars().take(max).collect();
    trimmed.trim_end_matches('-').to_string()
}

/// Label-value form of a project id.
pub fn project_label_value(project_id: &str) -> String {
    let v = dns_safe(project_id, MAX_LABEL_VALUE);
    if v.is_empty() { "unnamed".to_string() } else { v }
}

/// `sandbox-<project>-<first 8 of id>`.
pub fn pod_name(project_id: &str, sandbox_id: &str) -> String {
    let project = dns_safe(project_id, MAX_PROJECT_SEGMENT);
    let suffix = dns_safe(&sandbox_id.chars().take(8).collect::<String>(), 8);
    if project.is_empty() {
        format!("sandbox-{suffix}")
    } else {
        format!("sandbox-{project}-{suffix}")
    }
}

pub fn warm_pod_name(sandbox_id: &str) -> String {
    format!("warm-{}", dns_safe(&sandbox_id.chars().take(8).collect::<String>(), 8))
}

pub fn pvc_name(sandbox_id: &str) -> String {
    format!("workspace-{}", dns_safe(sandbox_id, MAX_LABEL_VALUE - 10))
}

pub fn managed_selector() -> String {
    format!("{LABEL_MANAGED_BY}={MANAGED_BY_VALUE}")
}

pub fn project_selector(project_id: &str) -> String {
    format!(
        "{},{LABEL_PROJECT_ID}={}",
        managed_selector(),
        project_label_value(project_id)
    )
}

pub fn warm_selector() -> String {
    format!("{},{LABEL_POOL}={POOL_WARM}", managed_selector())
}

fn cpu_millis(cores: f64) -> u64 {
    (cores.max(0.0) * 1000.0).round() as u64
}

/// Limits from the config; requests are half of each limit.
pub fn resources(memory_mb: u32, cpu_cores: f64) -> ResourceRequirements {
    let millis = cpu_millis(cpu_cores).max(1);
    let mut limits = BTreeMap::new();
    limits.insert("memory".to_string(), format!("{memory_mb}Mi"));
    limits.insert("cpu".to_string(), format!("{millis}m"));
    let mut requests = BTreeMap::new();
    requests.insert("memory".to_string(), format!("{}Mi", (memory_mb / 2).max(1)));
    requests.insert("cpu".to_string(), format!("{}m", (millis / 2).max(1)));
    ResourceRequirements { limits, requests }
}

fn pod_security_context() -> PodSecurityContext {
    PodSecurityContext {
        run_as_non_root: Some(true),
        run_as_user: Some(SANDBOX_UID),
        run_as_group: Some(SANDBOX_UID),
        fs_group: Some(SANDBOX_UID),
        seccomp_profile: Some(SeccompProfile {
            type_: "RuntimeDefault".into(),
            localhost_profile: None,
        }),
    }
}

fn container_security_context() -> SecurityContext {
    SecurityContext {
        privileged: Some(false),
        allow_privilege_escalation: Some(false),
        run_as_non_root: Some(true),
        run_as_user: Some(SANDBOX_UID),
        read_only_root_filesystem: Some(false),
        capabilities: Some(Capabilities {
            add: vec![],
            drop: vec!["ALL".into()],
        }),
        seccomp_profile: Some(SeccompProfile {
            type_: "RuntimeDefault".into(),
            localhost_profile: None,
        }),
    }
}

/// Builds pod manifests for one provider's settings.
pub struct PodSpecBuilder<'a> {
    config: &'a ProviderConfig,
}

impl<'a> PodSpecBuilder<'a> {
    pub fn new(config: &'a ProviderConfig) -> Self {
        Self { config }
    }

    /// Manifest for a project sandbox.
    pub fn build(&self, sandbox_id: &str, pod_name: &str, sandbox: &SandboxConfig) -> Pod {
        let mut labels = self.base_labels(sandbox_id);
        labels.insert(
            LABEL_PROJECT_ID.to_string(),
            project_label_value(&sandbox.project_id),
        );

        let mut annotations = BTreeMap::new();
        annotations.insert(ANNOTATION_PROJECT_ID.to_string(), sandbox.project_id.clone());
        annotations.insert(ANNOTATION_IMAGE.to_string(), sandbox.image.clone());

        let mut env: Vec<EnvVar> = sandbox
            .env
            .iter()
            .map(|(k, v)| EnvVar {
                name: k.clone(),
                value: v.clone(),
            })
            .collect();
        env.push(EnvVar {
            name: "PROJECT_ID".into(),
            value: sandbox.project_id.clone(),
        });
        env.push(EnvVar {
            name: "SANDBOX_ID".into(),
            value: sandbox_id.to_string(),
        });
        env.push(EnvVar {
            name: "WORKSPACE".into(),
            value: WORKSPACE_PATH.into(),
        });

        let mut volumes = vec![self.workspace_volume(sandbox_id, &sandbox.project_path)];
        let mut mounts = vec![VolumeMount {
            name: "workspace".into(),
            mount_path: WORKSPACE_PATH.into(),
            read_only: false,
        }];
        for (i, m) in sandbox.mounts.iter().enumerate() {
            let name = match dns_safe(&m.name, 40) {
                n if n.is_empty() => format!("scratch-{i}"),
                n => format!("scratch-{n}"),
            };
            volumes.push(Volume {
                name: name.clone(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            });
            mounts.push(VolumeMount {
                name,
                mount_path: m.mount_path.clone(),
                read_only: m.read_only,
            });
        }

        self.assemble(
            pod_name,
            labels,
            annotations,
            &sandbox.image,
            env,
            resources(sandbox.memory_mb, sandbox.cpu_cores),
            volumes,
            mounts,
        )
    }

    /// Manifest for an unassigned warm-pool pod, built from provider
    /// defaults. Always ephemeral: a warm pod has no project yet.
    pub fn build_warm(&self, sandbox_id: &str, pod_name: &str) -> Pod {
        let mut labels = self.base_labels(sandbox_id);
        labels.insert(LABEL_POOL.to_string(), POOL_WARM.to_string());
        let mut annotations = BTreeMap::new();
        annotations.insert(ANNOTATION_IMAGE.to_string(), self.config.default_image.clone());

        let defaults = SandboxConfig::new("", self.config.default_image.clone());
        let volumes = vec![Volume {
            name: "workspace".into(),
            empty_dir: Some(EmptyDirVolumeSource {
                size_limit: self.config.ephemeral_size_limit.clone(),
            }),
            ..Default::default()
        }];
        let mounts = vec![VolumeMount {
            name: "workspace".into(),
            mount_path: WORKSPACE_PATH.into(),
            read_only: false,
        }];
        self.assemble(
            pod_name,
            labels,
            annotations,
            &defaults.image,
            vec![EnvVar {
                name: "WORKSPACE".into(),
                value: WORKSPACE_PATH.into(),
            }],
            resources(defaults.memory_mb, defaults.cpu_cores),
            volumes,
            mounts,
        )
    }

    /// Claim backing a `PersistentClaim` workspace.
    pub fn pvc(&self, sandbox_id: &str, project_id: &str) -> PersistentVolumeClaim {
        let mut labels = self.base_labels(sandbox_id);
        labels.insert(LABEL_PROJECT_ID.to_string(), project_label_value(project_id));
        let mut requests = BTreeMap::new();
        requests.insert("storage".to_string(), self.config.storage_size.clone());
        PersistentVolumeClaim {
            api_version: "v1".into(),
            kind: "PersistentVolumeClaim".into(),
            metadata: ObjectMeta {
                name: Some(pvc_name(sandbox_id)),
                labels,
                ..Default::default()
            },
            spec: PvcSpec {
                access_modes: vec!["ReadWriteOnce".into()],
                storage_class_name: self.config.storage_class.clone(),
                resources: ResourceRequirements {
                    limits: BTreeMap::new(),
                    requests,
                },
            },
        }
    }

    fn base_labels(&self, sandbox_id: &str) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string());
        labels.insert(LABEL_SANDBOX_ID.to_string(), dns_safe(sandbox_id, MAX_LABEL_VALUE));
        labels
    }

    fn workspace_volume(&self, sandbox_id: &str, project_path: &str) -> Volume {
        let mut volume = Volume {
            name: "workspace".into(),
            ..Default::default()
        };
        match self.config.volume_type {
            VolumeType::Ephemeral => {
                volume.empty_dir = Some(EmptyDirVolumeSource {
                    size_limit: self.config.ephemeral_size_limit.clone(),
                });
            }
            VolumeType::HostPath => {
                volume.host_path = Some(HostPathVolumeSource {
                    path: project_path.to_string(),
                    type_: Some("DirectoryOrCreate".into()),
                });
            }
            VolumeType::PersistentClaim => {
                volume.persistent_volume_claim = Some(PvcVolumeSource {
                    claim_name: pvc_name(sandbox_id),
                });
            }
        }
        volume
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        &self,
        pod_name: &str,
        labels: BTreeMap<String, String>,
        annotations: BTreeMap<String, String>,
        image: &str,
        env: Vec<EnvVar>,
        resources: ResourceRequirements,
        volumes: Vec<Volume>,
        volume_mounts: Vec<VolumeMount>,
    ) -> Pod {
        let service_account_name = self
            .config
            .enable_rbac
            .then(|| self.config.service_account.clone());

        Pod {
            api_version: "v1".into(),
            kind: "Pod".into(),
            metadata: ObjectMeta {
                name: Some(pod_name.to_string()),
                namespace: Some(self.config.namespace.clone()),
                labels,
                annotations,
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: CONTAINER_NAME.into(),
                    image: image.to_string(),
                    command: vec!["sleep".into(), "infinity".into()],
                    args: vec![],
                    working_dir: Some(WORKSPACE_PATH.into()),
                    env,
                    resources: Some(resources),
                    volume_mounts,
                    security_context: Some(container_security_context()),
                    image_pull_policy: Some("IfNotPresent".into()),
                }],
                volumes,
                security_context: Some(pod_security_context()),
                restart_policy: Some("Never".into()),
                service_account_name,
                automount_service_account_token: Some(false),
                host_network: Some(false),
                host_pid: Some(false),
                host_ipc: Some(false),
                termination_grace_period_seconds: Some(10),
            }),
            status: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::types::MountSpec;

    fn sandbox() -> SandboxConfig {
        SandboxConfig::new("p1", "node:22")
            .with_resources(1024, 2.0)
            .with_env("FOO", "bar")
    }

    fn container(pod: &Pod) -> &Container {
        &pod.spec.as_ref().unwrap().containers[0]
    }

    #[test]
    fn dns_safe_sanitizes() {
        assert_eq!(dns_safe("My_Project!!Name", 63), "my-project-name");
        assert_eq!(dns_safe("--abc--", 63), "abc");
        assert_eq!(dns_safe("ÄBC", 63), "bc");
        assert_eq!(dns_safe("abcdef-ghij", 7), "abcdef");
        assert_eq!(dns_safe("___", 63), "");
    }

    #[test]
    fn pod_name_is_dns_safe_and_bounded() {
        let id = "0f3c9a7e-1111-2222-3333-444455556666";
        assert_eq!(pod_name("My Project", id), "sandbox-my-project-0f3c9a7e");
        let long = "x".repeat(200);
        let name = pod_name(&long, id);
        assert!(name.len() <= 63, "{name}");
        assert!(name.ends_with("-0f3c9a7e"));
        assert_eq!(pod_name("!!!", id), "sandbox-0f3c9a7e");
    }

    #[test]
    fn selectors() {
        assert_eq!(
            project_selector("P1"),
            "app.kubernetes.io/managed-by=agentpod,agentpod.io/project-id=p1"
        );
        assert!(warm_selector().ends_with("agentpod.io/pool=warm"));
    }

    #[test]
    fn requests_are_half_of_limits() {
        let r = resources(1024, 2.0);
        assert_eq!(r.limits["memory"], "1024Mi");
        assert_eq!(r.limits["cpu"], "2000m");
        assert_eq!(r.requests["memory"], "512Mi");
        assert_eq!(r.requests["cpu"], "1000m");

        let small = resources(1, 0.001);
        assert_eq!(small.requests["memory"], "1Mi");
        assert_eq!(small.requests["cpu"], "1m");
    }

    #[test]
    fn security_context_is_locked_down() {
        let config = ProviderConfig::default();
        let pod = PodSpecBuilder::new(&config).build("id-1", "sandbox-p1-id1", &sandbox());
        let spec = pod.spec.as_ref().unwrap();
        let psc = spec.security_context.as_ref().unwrap();
        assert_eq!(psc.run_as_non_root, Some(true));
        assert_eq!(psc.run_as_user, Some(1000));
        let csc = container(&pod).security_context.as_ref().unwrap();
        assert_eq!(csc.allow_privilege_escalation, Some(false));
        assert_eq!(csc.capabilities.as_ref().unwrap().drop, vec!["ALL"]);
        assert_eq!(csc.seccomp_profile.as_ref().unwrap().type_, "RuntimeDefault");
        assert_eq!(spec.automount_service_account_token, Some(false));
    }

    #[test]
    fn labels_env_and_annotations() {
        let config = ProviderConfig::default();
        let pod = PodSpecBuilder::new(&config).build("id-1", "sandbox-p1-id1", &sandbox());
        assert_eq!(pod.label(LABEL_PROJECT_ID), Some("p1"));
        assert_eq!(pod.label(LABEL_SANDBOX_ID), Some("id-1"));
        assert_eq!(pod.label(LABEL_MANAGED_BY), Some("agentpod"));
        assert_eq!(pod.metadata.annotations[ANNOTATION_IMAGE], "node:22");
        assert_eq!(pod.metadata.namespace.as_deref(), Some("agentpod-sandboxes"));
        let names: Vec<&str> = container(&pod).env.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["FOO", "PROJECT_ID", "SANDBOX_ID", "WORKSPACE"]);
    }

    #[test]
    fn ephemeral_workspace_by_default() {
        let config = ProviderConfig::default();
        let pod = PodSpecBuilder::new(&config).build("id-1", "n", &sandbox());
        let ws = &pod.spec.as_ref().unwrap().volumes[0];
        assert_eq!(ws.name, "workspace");
        assert_eq!(ws.empty_dir.as_ref().unwrap().size_limit.as_deref(), Some("10Gi"));
        assert!(ws.host_path.is_none());
    }

    #[test]
    fn host_path_workspace() {
        let config = ProviderConfig {
            volume_type: VolumeType::HostPath,
            ..Default::default()
        };
        let cfg = sandbox().with_project_path("/srv/projects/p1");
        let pod = PodSpecBuilder::new(&config).build("id-1", "n", &cfg);
        let hp = pod.spec.as_ref().unwrap().volumes[0].host_path.clone().unwrap();
        assert_eq!(hp.path, "/srv/projects/p1");
        assert_eq!(hp.type_.as_deref(), Some("DirectoryOrCreate"));
    }

    #[test]
    fn persistent_claim_workspace() {
        let config = ProviderConfig {
            volume_type: VolumeType::PersistentClaim,
            storage_class: Some("fast".into()),
            ..Default::default()
        };
        let builder = PodSpecBuilder::new(&config);
        let pod = builder.build("abc", "n", &sandbox());
        let pvc_src = pod.spec.as_ref().unwrap().volumes[0]
            .persistent_volume_claim
            .clone()
            .unwrap();
        assert_eq!(pvc_src.claim_name, "workspace-abc");

        let pvc = builder.pvc("abc", "p1");
        assert_eq!(pvc.metadata.name.as_deref(), Some("workspace-abc"));
        assert_eq!(pvc.spec.storage_class_name.as_deref(), Some("fast"));
        assert_eq!(pvc.spec.resources.requests["storage"], "10Gi");
    }

    #[test]
    fn extra_mounts_get_scratch_volumes() {
        let config = ProviderConfig::default();
        let cfg = sandbox()
            .with_mount(MountSpec {
                name: "Cache".into(),
                mount_path: "/home/agent/.cache".into(),
                read_only: false,
            })
            .with_mount(MountSpec {
                name: "??".into(),
                mount_path: "/data".into(),
                read_only: true,
            });
        let pod = PodSpecBuilder::new(&config).build("id", "n", &cfg);
        let spec = pod.spec.as_ref().unwrap();
        assert_eq!(spec.volumes.len(), 3);
        assert_eq!(spec.volumes[1].name, "scratch-cache");
        assert_eq!(spec.volumes[2].name, "scratch-1");
        assert!(spec.volumes[2].empty_dir.is_some());
        let mounts = &spec.containers[0].volume_mounts;
        assert_eq!(mounts[2].mount_path, "/data");
        assert!(mounts[2].read_only);
    }

    #[test]
    fn service_account_only_with_rbac() {
        let with = ProviderConfig::default();
        let pod = PodSpecBuilder::new(&with).build("id", "n", &sandbox());
        assert_eq!(
            pod.spec.unwrap().service_account_name.as_deref(),
            Some("agentpod-sandbox")
        );

        let without = ProviderConfig {
            enable_rbac: false,
            ..Default::default()
        };
        let pod = PodSpecBuilder::new(&without).build("id", "n", &sandbox());
        assert!(pod.spec.unwrap().service_account_name.is_none());
    }

    #[test]
    fn warm_pod_has_pool_label_and_no_project() {
        let config = ProviderConfig::default();
        let pod = PodSpecBuilder::new(&config).build_warm("w-1", &warm_pod_name("w-1abcdefgh"));
        assert_eq!(pod.metadata.name.as_deref(), Some("warm-w-1abcde"));
        assert_eq!(pod.label(LABEL_POOL), Some(POOL_WARM));
        assert!(pod.label(LABEL_PROJECT_ID).is_none());
        assert_eq!(container(&pod).image, config.default_image);
    }
}
