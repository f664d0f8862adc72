//! Pod security validation and cluster-side isolation resources.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use super::audit::{AuditEvent, AuditSink};
use super::backend::PodBackend;
use super::error::{BackendError, SandboxError};
use super::kube::models::*;
use super::pod_spec::{LABEL_MANAGED_BY, LABEL_SANDBOX_ID, MANAGED_BY_VALUE, dns_safe};
use super::types::ProviderConfig;

pub const ANNOTATION_ALLOWED_HOSTS: &str = "agentpod.io/allowed-hosts";
pub const DEFAULT_DENY_POLICY: &str = "agentpod-default-deny-egress";
const ROLE_NAME: &str = "agentpod-sandbox";
const RBAC_V1: &str = "rbac.authorization.k8s.io/v1";

// ── Validation ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub violations: Vec<String>,
}

impl ValidationResult {
    fn from_violations(violations: Vec<String>) -> Self {
        Self {
            valid: violations.is_empty(),
            violations,
        }
    }
}

/// Checks a manifest against a fixed profile before it is submitted.
pub trait PodSecurityValidator: Send + Sync {
    fn validate(&self, pod: &Pod) -> ValidationResult;
}

/// The Kubernetes "restricted" pod security profile, with an opt-in for
/// hostPath workspaces.
#[derive(Debug, Clone, Copy, Default)]
pub struct RestrictedProfile {
    pub allow_host_path: bool,
}

impl PodSecurityValidator for RestrictedProfile {
    fn validate(&self, pod: &Pod) -> ValidationResult {
        validate_pod(pod, self.allow_host_path)
    }
}

fn is_allowed_seccomp(profile: Option<&SeccompProfile>) -> bool {
    matches!(
        profile.map(|p| p.type_.as_str()),
        Some("RuntimeDefault") | Some("Localhost")
    )
}

pub fn validate_pod(pod: &Pod, allow_host_path: bool) -> ValidationResult {
    let Some(spec) = pod.spec.as_ref() else {
        return ValidationResult::from_violations(vec!["pod has no spec".into()]);
    };
    let mut violations = Vec::new();
    let pod_sc = spec.security_context.as_ref();

    if spec.host_network == Some(true) {
        violations.push("hostNetwork is not allowed".into());
    }
    if spec.host_pid == Some(true) {
        violations.push("hostPID is not allowed".into());
    }
    if spec.host_ipc == Some(true) {
        violations.push("hostIPC is not allowed".into());
    }
    if !allow_host_path {
        for v in spec.volumes.iter().filter(|v| v.host_path.is_some()) {
            violations.push(format!("volume {}: hostPath volumes are not allowed", v.name));
        }
    }

    for c in &spec.containers {
        let sc = c.security_context.as_ref();
        let name = &c.name;

        if sc.and_then(|s| s.privileged) == Some(true) {
            violations.push(format!("container {name}: privileged"));
        }
        if sc.and_then(|s| s.allow_privilege_escalation) != Some(false) {
            violations.push(format!(
                "container {name}: allowPrivilegeEscalation must be false"
            ));
        }

        let non_root = sc
            .and_then(|s| s.run_as_non_root)
            .or_else(|| pod_sc.and_then(|s| s.run_as_non_root));
        if non_root != Some(true) {
            violations.push(format!("container {name}: runAsNonRoot must be true"));
        }
        let uid = sc
            .and_then(|s| s.run_as_user)
            .or_else(|| pod_sc.and_then(|s| s.run_as_user));
        if uid == Some(0) {
            violations.push(format!("container {name}: runAsUser must not be 0"));
        }

        match sc.and_then(|s| s.capabilities.as_ref()) {
            Some(caps) => {
                if !caps.drop.iter().any(|d| d == "ALL") {
                    violations.push(format!("container {name}: must drop ALL capabilities"));
                }
                if !caps.add.is_empty() {
                    violations.push(format!(
                        "container {name}: adding capabilities is not allowed ({})",
                        caps.add.join(", ")
                    ));
                }
            }
            None => violations.push(format!("container {name}: must drop ALL capabilities")),
        }

        let seccomp = sc
            .and_then(|s| s.seccomp_profile.as_ref())
            .or_else(|| pod_sc.and_then(|s| s.seccomp_profile.as_ref()));
        if !is_allowed_seccomp(seccomp) {
            violations.push(format!(
                "container {name}: seccompProfile must be RuntimeDefault or Localhost"
            ));
        }
    }

    ValidationResult::from_violations(violations)
}

// ── Provisioning ────────────────────────────────────────────────────

/// Outcome of the once-per-provider security setup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SecurityProvisionResult {
    /// Every enabled step succeeded (or already existed).
    pub initialized: bool,
    pub warnings: Vec<String>,
}

#[async_trait]
pub trait SecurityProvisioner: Send + Sync {
    /// Set up RBAC and the namespace's default egress policy. Never fails;
    /// each step that could not be completed becomes a warning.
    async fn provision_security(&self) -> SecurityProvisionResult;

    async fn create_sandbox_egress_policy(
        &self,
        sandbox_id: &str,
        pod_name: &str,
    ) -> Result<(), SandboxError>;

    async fn delete_sandbox_egress_policy(&self, sandbox_id: &str) -> Result<(), SandboxError>;
}

pub fn egress_policy_name(sandbox_id: &str) -> String {
    format!("egress-{}", dns_safe(sandbox_id, 56))
}

fn is_cidr(entry: &str) -> bool {
    let Some((addr, prefix)) = entry.split_once('/') else {
        return false;
    };
    let Ok(addr) = addr.parse::<IpAddr>() else {
        return false;
    };
    let max = if addr.is_ipv4() { 32 } else { 128 };
    prefix.parse::<u8>().map(|p| p <= max).unwrap_or(false)
}

fn dns_rule() -> EgressRule {
    EgressRule {
        to: vec![],
        ports: vec![
            PolicyPort {
                protocol: "UDP".into(),
                port: 53,
            },
            PolicyPort {
                protocol: "TCP".into(),
                port: 53,
            },
        ],
    }
}

fn managed_labels() -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string());
    labels
}

/// Deny all egress from managed pods except DNS.
pub fn default_deny_policy() -> NetworkPolicy {
    NetworkPolicy {
        api_version: "networking.k8s.io/v1".into(),
        kind: "NetworkPolicy".into(),
        metadata: ObjectMeta {
            name: Some(DEFAULT_DENY_POLICY.into()),
            labels: managed_labels(),
            ..Default::default()
        },
        spec: NetworkPolicySpec {
            pod_selector: LabelSelector {
                match_labels: managed_labels(),
            },
            policy_types: vec!["Egress".into()],
            egress: vec![dns_rule()],
        },
    }
}

/// Egress for one sandbox: DNS, every CIDR in the allow-list, and HTTPS
/// for the host-name entries (recorded on the policy for FQDN-aware CNIs).
pub fn sandbox_egress_policy(sandbox_id: &str, pod_name: &str, allowlist: &[String]) -> NetworkPolicy {
    let (cidrs, hosts): (Vec<&String>, Vec<&String>) = allowlist.iter().partition(|e| is_cidr(e));

    let mut selector = BTreeMap::new();
    selector.insert(LABEL_SANDBOX_ID.to_string(), dns_safe(sandbox_id, 63));

    let mut egress = vec![dns_rule()];
    if !cidrs.is_empty() {
        egress.push(EgressRule {
            to: cidrs
                .iter()
                .map(|c| PolicyPeer {
                    ip_block: Some(IpBlock {
                        cidr: c.to_string(),
                    }),
                    namespace_selector: None,
                })
                .collect(),
            ports: vec![],
        });
    }
    if !hosts.is_empty() {
        egress.push(EgressRule {
            to: vec![],
            ports: vec![PolicyPort {
                protocol: "TCP".into(),
                port: 443,
            }],
        });
    }

    let mut labels = managed_labels();
    labels.insert(LABEL_SANDBOX_ID.to_string(), dns_safe(sandbox_id, 63));
    let mut annotations = BTreeMap::new();
    annotations.insert(
        ANNOTATION_ALLOWED_HOSTS.to_string(),
        hosts.iter().map(|h| h.as_str()).collect::<Vec<_>>().join(","),
    );
    annotations.insert("agentpod.io/pod".to_string(), pod_name.to_string());

    NetworkPolicy {
        api_version: "networking.k8s.io/v1".into(),
        kind: "NetworkPolicy".into(),
        metadata: ObjectMeta {
            name: Some(egress_policy_name(sandbox_id)),
            labels,
            annotations,
            ..Default::default()
        },
        spec: NetworkPolicySpec {
            pod_selector: LabelSelector {
                match_labels: selector,
            },
            policy_types: vec!["Egress".into()],
            egress,
        },
    }
}

fn service_account(name: &str) -> ServiceAccount {
    ServiceAccount {
        api_version: "v1".into(),
        kind: "ServiceAccount".into(),
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: managed_labels(),
            ..Default::default()
        },
        automount_service_account_token: Some(false),
    }
}

fn role() -> Role {
    Role {
        api_version: RBAC_V1.into(),
        kind: "Role".into(),
        metadata: ObjectMeta {
            name: Some(ROLE_NAME.into()),
            labels: managed_labels(),
            ..Default::default()
        },
        rules: vec![PolicyRule {
            api_groups: vec![String::new()],
            resources: vec!["pods".into()],
            verbs: vec!["get".into()],
        }],
    }
}

fn role_binding(namespace: &str, account: &str) -> RoleBinding {
    RoleBinding {
        api_version: RBAC_V1.into(),
        kind: "RoleBinding".into(),
        metadata: ObjectMeta {
            name: Some(ROLE_NAME.into()),
            labels: managed_labels(),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".into(),
            kind: "Role".into(),
            name: ROLE_NAME.into(),
        },
        subjects: vec![Subject {
            kind: "ServiceAccount".into(),
            name: account.to_string(),
            namespace: Some(namespace.to_string()),
        }],
    }
}

/// Treat "already exists" as success.
fn tolerate_conflict(result: Result<(), BackendError>) -> Result<bool, BackendError> {
    match result {
        Ok(()) => Ok(true),
        Err(BackendError::Conflict(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Creates RBAC objects and network policies through a [`PodBackend`].
pub struct KubeSecurityProvisioner {
    backend: Arc<dyn PodBackend>,
    audit: Arc<dyn AuditSink>,
    namespace: String,
    service_account: String,
    egress_allowlist: Vec<String>,
    enable_rbac: bool,
    enable_network_policy: bool,
}

impl KubeSecurityProvisioner {
    pub fn new(backend: Arc<dyn PodBackend>, audit: Arc<dyn AuditSink>, config: &ProviderConfig) -> Self {
        Self {
            backend,
            audit,
            namespace: config.namespace.clone(),
            service_account: config.service_account.clone(),
            egress_allowlist: config.egress_allowlist.clone(),
            enable_rbac: config.enable_rbac,
            enable_network_policy: config.enable_network_policy,
        }
    }

    fn step(&self, warnings: &mut Vec<String>, what: &str, kind: &str, name: &str, result: Result<(), BackendError>) {
        match tolerate_conflict(result) {
            Ok(true) => {
                tracing::info!(namespace = %self.namespace, kind, name, "created {what}");
                let event = if kind == "NetworkPolicy" {
                    AuditEvent::PolicyCreated {
                        name: name.to_string(),
                    }
                } else {
                    AuditEvent::RbacCreated {
                        kind: kind.to_string(),
                        name: name.to_string(),
                    }
                };
                self.audit.record(event);
            }
            Ok(false) => tracing::debug!(kind, name, "{what} already exists"),
            Err(e) => {
                tracing::warn!(kind, name, error = %e, "failed to create {what}");
                warnings.push(format!("{what} {name}: {e}"));
            }
        }
    }
}

#[async_trait]
impl SecurityProvisioner for KubeSecurityProvisioner {
    async fn provision_security(&self) -> SecurityProvisionResult {
        let mut warnings = Vec::new();
        let ns = self.namespace.as_str();

        if self.enable_rbac {
            let sa = service_account(&self.service_account);
            let r = self.backend.create_service_account(ns, &sa).await;
            self.step(&mut warnings, "service account", "ServiceAccount", &self.service_account, r);

            let r = self.backend.create_role(ns, &role()).await;
            self.step(&mut warnings, "role", "Role", ROLE_NAME, r);

            let binding = role_binding(ns, &self.service_account);
            let r = self.backend.create_role_binding(ns, &binding).await;
            self.step(&mut warnings, "role binding", "RoleBinding", ROLE_NAME, r);
        }

        if self.enable_network_policy {
            let r = self
                .backend
                .create_network_policy(ns, &default_deny_policy())
                .await;
            self.step(&mut warnings, "default egress policy", "NetworkPolicy", DEFAULT_DENY_POLICY, r);
        }

        SecurityProvisionResult {
            initialized: warnings.is_empty(),
            warnings,
        }
    }

    async fn create_sandbox_egress_policy(
        &self,
        sandbox_id: &str,
        pod_name: &str,
    ) -> Result<(), SandboxError> {
        if !self.enable_network_policy {
            return Ok(());
        }
        let policy = sandbox_egress_policy(sandbox_id, pod_name, &self.egress_allowlist);
        let name = policy.metadata.name_or_empty().to_string();
        if tolerate_conflict(self.backend.create_network_policy(&self.namespace, &policy).await)? {
            tracing::debug!(sandbox_id = %sandbox_id, policy = %name, "created egress policy");
            self.audit.record(AuditEvent::PolicyCreated { name });
        }
        Ok(())
    }

    async fn delete_sandbox_egress_policy(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        if !self.enable_network_policy {
            return Ok(());
        }
        match self
            .backend
            .delete_network_policy(&self.namespace, &egress_policy_name(sandbox_id))
            .await
        {
            Ok(()) | Err(BackendError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
