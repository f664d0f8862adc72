//! Sandbox orchestration: create, look up, list, clean up, health.
//!
//! The provider owns the in-memory registries (by sandbox id and by
//! project id). Everything else lives in the cluster and is re-queried on a
//! registry miss.
//!
//! The one-active-sandbox-per-project rule is a check-then-register against
//! the registry. Two `create` calls racing for the same project can both
//! pass the check; callers that need a hard guarantee serialize `create`
//! per project themselves.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, RwLock, broadcast};
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use super::audit::{AuditEvent, AuditSink, NoopAuditSink, TracingAuditSink};
use super::backend::PodBackend;
use super::error::{BackendError, SandboxError};
use super::events::{EventBus, ListenerId};
use super::handle::{Sandbox, SandboxParts};
use super::kube::KubeClient;
use super::kube::models::{Namespace, ObjectMeta};
use super::pod_spec::{
    ANNOTATION_PROJECT_ID, LABEL_POOL, LABEL_PROJECT_ID, POOL_ALLOCATED, POOL_WARM, PodSpecBuilder,
    managed_selector, pod_name, project_label_value, project_selector, pvc_name, warm_selector,
};
use super::readiness::{Clock, ReadinessWaiter, SystemClock};
use super::security::{
    KubeSecurityProvisioner, PodSecurityValidator, RestrictedProfile, SecurityProvisionResult,
    SecurityProvisioner,
};
use super::types::*;
use super::warm_pool::{PodWarmPool, WarmPod, WarmPoolController};

/// Group/version whose presence means network policies can be enforced.
const NETWORKING_API: &str = "networking.k8s.io/v1";

const PSA_LEVEL: &str = "restricted";
const PSA_LABELS: [&str; 3] = [
    "pod-security.kubernetes.io/enforce",
    "pod-security.kubernetes.io/audit",
    "pod-security.kubernetes.io/warn",
];

/// Assembles a [`SandboxProvider`]. Anything not supplied gets the
/// production implementation for the given config.
pub struct SandboxProviderBuilder {
    config: ProviderConfig,
    backend: Arc<dyn PodBackend>,
    audit: Option<Arc<dyn AuditSink>>,
    validator: Option<Arc<dyn PodSecurityValidator>>,
    clock: Option<Arc<dyn Clock>>,
    security: Option<Arc<dyn SecurityProvisioner>>,
    warm_pool: Option<Arc<dyn WarmPoolController>>,
}

impl SandboxProviderBuilder {
    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn validator(mut self, validator: Arc<dyn PodSecurityValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn security(mut self, security: Arc<dyn SecurityProvisioner>) -> Self {
        self.security = Some(security);
        self
    }

    /// Use `pool` regardless of `warm_pool.enabled`.
    pub fn warm_pool(mut self, pool: Arc<dyn WarmPoolController>) -> Self {
        self.warm_pool = Some(pool);
        self
    }

    pub fn build(self) -> SandboxProvider {
        let config = self.config;
        let backend = self.backend;
        let audit = self.audit.unwrap_or_else(|| {
            if config.enable_audit {
                Arc::new(TracingAuditSink)
            } else {
                Arc::new(NoopAuditSink)
            }
        });
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let validator = self.validator.unwrap_or_else(|| {
            Arc::new(RestrictedProfile {
                allow_host_path: config.allow_host_path,
            })
        });
        let security = self.security.unwrap_or_else(|| {
            Arc::new(KubeSecurityProvisioner::new(
                backend.clone(),
                audit.clone(),
                &config,
            ))
        });
        let warm_pool = self.warm_pool.or_else(|| {
            config.warm_pool.enabled.then(|| {
                Arc::new(PodWarmPool::new(
                    backend.clone(),
                    clock.clone(),
                    audit.clone(),
                    validator.clone(),
                    config.clone(),
                )) as Arc<dyn WarmPoolController>
            })
        });

        SandboxProvider {
            config,
            backend,
            audit,
            validator,
            clock,
            security,
            warm_pool,
            sandboxes: RwLock::new(BTreeMap::new()),
            by_project: RwLock::new(BTreeMap::new()),
            security_state: Mutex::new(None),
            namespace_ready: AtomicBool::new(false),
            events: EventBus::default(),
        }
    }
}

pub struct SandboxProvider {
    config: ProviderConfig,
    backend: Arc<dyn PodBackend>,
    audit: Arc<dyn AuditSink>,
    validator: Arc<dyn PodSecurityValidator>,
    clock: Arc<dyn Clock>,
    security: Arc<dyn SecurityProvisioner>,
    warm_pool: Option<Arc<dyn WarmPoolController>>,
    sandboxes: RwLock<BTreeMap<SandboxId, Arc<Sandbox>>>,
    by_project: RwLock<BTreeMap<ProjectId, SandboxId>>,
    /// Result of the once-per-provider security setup, once it has run.
    security_state: Mutex<Option<SecurityProvisionResult>>,
    namespace_ready: AtomicBool,
    events: EventBus,
}

impl SandboxProvider {
    pub fn builder(config: ProviderConfig, backend: Arc<dyn PodBackend>) -> SandboxProviderBuilder {
        SandboxProviderBuilder {
            config,
            backend,
            audit: None,
            validator: None,
            clock: None,
            security: None,
            warm_pool: None,
        }
    }

    /// Provider talking to a real cluster with the default collaborators.
    pub fn connect(config: ProviderConfig, kube: &KubeConfig) -> Result<Self, SandboxError> {
        let client = KubeClient::new(kube)?;
        tracing::info!(api = %client.base_url(), namespace = %config.namespace, "sandbox provider ready");
        Ok(Self::builder(config, Arc::new(client)).build())
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    // ── Create ──────────────────────────────────────────────────────

    /// Create a sandbox for `config.project_id` and wait until it is ready.
    pub async fn create(&self, config: SandboxConfig) -> Result<Arc<Sandbox>, SandboxError> {
        // 1. One active sandbox per project.
        if self.active_for_project(&config.project_id).await.is_some() {
            let err = SandboxError::AlreadyExists {
                project_id: config.project_id.clone(),
            };
            self.events.emit(SandboxProviderEvent::Error {
                sandbox_id: String::new(),
                project_id: config.project_id.clone(),
                error: err.to_string(),
            });
            return Err(err);
        }

        // 2. Warm pool fast path. Never fails the call.
        if let Some(sandbox) = self.try_warm(&config).await {
            return Ok(sandbox);
        }

        // 3. Identity.
        let id = Uuid::new_v4().to_string();
        let pod = pod_name(&config.project_id, &id);

        // 4.
        self.events.emit(SandboxProviderEvent::Creating {
            sandbox_id: id.clone(),
            project_id: config.project_id.clone(),
        });
        tracing::info!(
            sandbox_id = %id,
            project_id = %config.project_id,
            pod = %pod,
            image = %config.image,
            "creating sandbox"
        );

        match self.provision(&id, &pod, &config).await {
            Ok(sandbox) => Ok(sandbox),
            Err(e) => {
                tracing::error!(sandbox_id = %id, project_id = %config.project_id, error = %e, "sandbox creation failed");
                self.audit.record(AuditEvent::PodFailed {
                    sandbox_id: id.clone(),
                    project_id: config.project_id.clone(),
                    pod: pod.clone(),
                    error: e.to_string(),
                });
                self.events.emit(SandboxProviderEvent::Error {
                    sandbox_id: id,
                    project_id: config.project_id.clone(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Steps 5 to 12 of `create`.
    async fn provision(
        &self,
        id: &str,
        pod: &str,
        config: &SandboxConfig,
    ) -> Result<Arc<Sandbox>, SandboxError> {
        // 5.
        self.ensure_namespace().await?;

        // 6. Best-effort; warnings are retained, never fatal.
        self.ensure_security().await;

        // 7.
        if self.config.volume_type == VolumeType::PersistentClaim {
            self.create_pvc(id, &config.project_id).await?;
        }

        // 8.
        let manifest = PodSpecBuilder::new(&self.config).build(id, pod, config);
        let validation = self.validator.validate(&manifest);
        if !validation.valid {
            self.audit.record(AuditEvent::SecurityViolation {
                project_id: config.project_id.clone(),
                pod: pod.to_string(),
                violations: validation.violations.clone(),
            });
            return Err(SandboxError::SecurityViolation {
                violations: validation.violations,
            });
        }

        // 9.
        let submitted_at = self.clock.now();
        let created = self
            .backend
            .create_pod(self.namespace(), &manifest)
            .await
            .map_err(|e| SandboxError::creation(&config.project_id, e))?;
        self.audit.record(AuditEvent::PodCreated {
            sandbox_id: id.to_string(),
            project_id: config.project_id.clone(),
            pod: pod.to_string(),
            image: config.image.clone(),
        });

        // 10. No rollback on failure; the pod stays as the cluster has it.
        let ready = ReadinessWaiter::new(
            &*self.backend,
            &*self.clock,
            self.config.readiness_timeout,
            self.config.readiness_poll_interval,
        )
        .wait(self.namespace(), pod)
        .await?;
        let now = self.clock.now();
        self.audit.record(AuditEvent::PodStarted {
            sandbox_id: id.to_string(),
            pod: pod.to_string(),
            startup_ms: (now - submitted_at).num_milliseconds(),
        });

        // 11.
        if let Err(e) = self.security.create_sandbox_egress_policy(id, pod).await {
            tracing::warn!(sandbox_id = %id, error = %e, "egress policy not applied");
        }

        // 12.
        let sandbox = Arc::new(Sandbox::new(SandboxParts {
            id: id.to_string(),
            project_id: config.project_id.clone(),
            pod_name: pod.to_string(),
            namespace: self.namespace().to_string(),
            image: config.image.clone(),
            memory_mb: config.memory_mb,
            cpu_cores: config.cpu_cores,
            created_at: created.metadata.creation_timestamp.unwrap_or(submitted_at),
            started_at: ready.status.as_ref().and_then(|s| s.start_time).or(Some(now)),
            status: SandboxStatus::Running,
            backend: self.backend.clone(),
            clock: self.clock.clone(),
            audit: self.audit.clone(),
            exec_stream_timeout: self.config.exec_stream_timeout,
        }));
        self.register(sandbox.clone()).await;
        self.announce_ready(&sandbox);
        Ok(sandbox)
    }

    fn announce_ready(&self, sandbox: &Sandbox) {
        tracing::info!(
            sandbox_id = %sandbox.id(),
            project_id = %sandbox.project_id(),
            pod = %sandbox.container_id(),
            "sandbox running"
        );
        self.events.emit(SandboxProviderEvent::Created {
            sandbox_id: sandbox.id().to_string(),
            project_id: sandbox.project_id().to_string(),
        });
        self.events.emit(SandboxProviderEvent::Started {
            sandbox_id: sandbox.id().to_string(),
            project_id: sandbox.project_id().to_string(),
        });
    }

    /// Warm pods are built from provider defaults, so only requests that
    /// match those defaults can use one.
    fn warm_eligible(&self, config: &SandboxConfig) -> bool {
        config.image == self.config.default_image
            && config.mounts.is_empty()
            && config.env.is_empty()
            && self.config.volume_type == VolumeType::Ephemeral
    }

    async fn try_warm(&self, config: &SandboxConfig) -> Option<Arc<Sandbox>> {
        let pool = self.warm_pool.as_ref()?;
        if !self.warm_eligible(config) {
            return None;
        }
        let warm = pool.get_warm(&config.project_id).await?;
        match self.adopt_warm(&warm, config).await {
            Ok(sandbox) => {
                pool.forget(&warm.pod_name).await;
                let pool = pool.clone();
                tokio::spawn(async move {
                    if let Err(e) = pool.maintain().await {
                        tracing::warn!(error = %e, "warm pool top-up failed");
                    }
                });
                Some(sandbox)
            }
            Err(e) => {
                tracing::warn!(
                    pod = %warm.pod_name,
                    project_id = %config.project_id,
                    error = %e,
                    "warm pod reconfiguration failed, falling back to a fresh pod"
                );
                pool.release(&warm.pod_name).await;
                None
            }
        }
    }

    /// Point a warm pod at a project: relabel and annotate it, then give it
    /// its egress policy.
    async fn adopt_warm(&self, warm: &WarmPod, config: &SandboxConfig) -> Result<Arc<Sandbox>, SandboxError> {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_PROJECT_ID.to_string(), project_label_value(&config.project_id));
        labels.insert(LABEL_POOL.to_string(), POOL_ALLOCATED.to_string());
        let mut annotations = BTreeMap::new();
        annotations.insert(ANNOTATION_PROJECT_ID.to_string(), config.project_id.clone());
        self.backend
            .patch_pod_metadata(self.namespace(), &warm.pod_name, &labels, &annotations)
            .await?;

        self.ensure_security().await;
        self.security
            .create_sandbox_egress_policy(&warm.sandbox_id, &warm.pod_name)
            .await?;

        let defaults = SandboxConfig::new(config.project_id.clone(), self.config.default_image.clone());
        let sandbox = Arc::new(Sandbox::new(SandboxParts {
            id: warm.sandbox_id.clone(),
            project_id: config.project_id.clone(),
            pod_name: warm.pod_name.clone(),
            namespace: self.namespace().to_string(),
            image: defaults.image,
            memory_mb: defaults.memory_mb,
            cpu_cores: defaults.cpu_cores,
            created_at: warm.created_at,
            started_at: Some(warm.created_at),
            status: SandboxStatus::Running,
            backend: self.backend.clone(),
            clock: self.clock.clone(),
            audit: self.audit.clone(),
            exec_stream_timeout: self.config.exec_stream_timeout,
        }));
        self.register(sandbox.clone()).await;
        tracing::info!(sandbox_id = %sandbox.id(), pod = %warm.pod_name, "sandbox served from warm pool");
        self.announce_ready(&sandbox);
        Ok(sandbox)
    }

    /// Create the namespace with restricted pod-security labels unless it
    /// already exists. Checked once per provider.
    async fn ensure_namespace(&self) -> Result<(), SandboxError> {
        if self.namespace_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        let name = self.namespace();
        let failed = |e: BackendError| SandboxError::NamespaceFailed {
            namespace: name.to_string(),
            message: e.to_string(),
        };

        match self.backend.get_namespace(name).await {
            Ok(_) => {}
            Err(BackendError::NotFound(_)) => {
                let labels = PSA_LABELS
                    .iter()
                    .map(|k| (k.to_string(), PSA_LEVEL.to_string()))
                    .collect();
                let namespace = Namespace {
                    api_version: "v1".into(),
                    kind: "Namespace".into(),
                    metadata: ObjectMeta {
                        name: Some(name.to_string()),
                        labels,
                        ..Default::default()
                    },
                };
                match self.backend.create_namespace(&namespace).await {
                    Ok(_) => {
                        tracing::info!(namespace = %name, "created sandbox namespace");
                        self.audit.record(AuditEvent::NamespaceCreated {
                            namespace: name.to_string(),
                        });
                    }
                    Err(BackendError::Conflict(_)) => {}
                    Err(e) => return Err(failed(e)),
                }
            }
            Err(e) => return Err(failed(e)),
        }
        self.namespace_ready.store(true, Ordering::Release);
        Ok(())
    }

    async fn ensure_security(&self) {
        let mut state = self.security_state.lock().await;
        if state.is_some() {
            return;
        }
        let result = self.security.provision_security().await;
        for warning in &result.warnings {
            tracing::warn!(warning = %warning, "security setup incomplete");
        }
        tracing::info!(
            initialized = result.initialized,
            warnings = result.warnings.len(),
            "security provisioning finished"
        );
        *state = Some(result);
    }

    async fn create_pvc(&self, id: &str, project_id: &str) -> Result<(), SandboxError> {
        let pvc = PodSpecBuilder::new(&self.config).pvc(id, project_id);
        let name = pvc.metadata.name_or_empty().to_string();
        match self.backend.create_pvc(self.namespace(), &pvc).await {
            Ok(()) => {
                tracing::debug!(sandbox_id = %id, pvc = %name, "created workspace claim");
                self.audit.record(AuditEvent::PvcCreated {
                    sandbox_id: id.to_string(),
                    pvc: name,
                });
                Ok(())
            }
            Err(BackendError::Conflict(_)) => Ok(()),
            Err(e) => Err(SandboxError::CreationFailed(format!(
                "workspace claim {name}: {e}"
            ))),
        }
    }

    // ── Registry ────────────────────────────────────────────────────

    async fn register(&self, sandbox: Arc<Sandbox>) {
        let id = sandbox.id().to_string();
        let project = sandbox.project_id().to_string();
        self.sandboxes.write().await.insert(id.clone(), sandbox);
        self.by_project.write().await.insert(project, id);
    }

    async fn evict(&self, sandbox: &Sandbox) {
        self.sandboxes.write().await.remove(sandbox.id());
        let mut by_project = self.by_project.write().await;
        if by_project.get(sandbox.project_id()).map(String::as_str) == Some(sandbox.id()) {
            by_project.remove(sandbox.project_id());
        }
    }

    async fn registered_for_project(&self, project_id: &str) -> Option<Arc<Sandbox>> {
        let id = self.by_project.read().await.get(project_id).cloned()?;
        self.sandboxes.read().await.get(&id).cloned()
    }

    async fn active_for_project(&self, project_id: &str) -> Option<Arc<Sandbox>> {
        self.registered_for_project(project_id)
            .await
            .filter(|s| s.is_active())
    }

    // ── Lookup ──────────────────────────────────────────────────────

    /// The project's sandbox. Falls back to the cluster on a registry miss
    /// and remembers what it finds. Backend errors read as "none".
    pub async fn get(&self, project_id: &str) -> Option<Arc<Sandbox>> {
        if let Some(sandbox) = self.registered_for_project(project_id).await {
            return Some(sandbox);
        }

        let pods = match self
            .backend
            .list_pods(self.namespace(), &project_selector(project_id))
            .await
        {
            Ok(pods) => pods,
            Err(e) => {
                tracing::warn!(project_id = %project_id, error = %e, "sandbox lookup failed");
                return None;
            }
        };

        // The label is sanitized and may be shared; the annotation is exact.
        let pod = pods.iter().find(|p| {
            !p.is_terminating()
                && p.metadata.annotations.get(ANNOTATION_PROJECT_ID).map(String::as_str) == Some(project_id)
        })?;
        let sandbox = Arc::new(Sandbox::from_pod(
            pod,
            self.namespace(),
            self.backend.clone(),
            self.clock.clone(),
            self.audit.clone(),
            self.config.exec_stream_timeout,
        )?);
        tracing::debug!(sandbox_id = %sandbox.id(), project_id = %project_id, "rehydrated sandbox from cluster");
        self.register(sandbox.clone()).await;
        Some(sandbox)
    }

    pub async fn get_by_id(&self, sandbox_id: &str) -> Option<Arc<Sandbox>> {
        self.sandboxes.read().await.get(sandbox_id).cloned()
    }

    /// Every sandbox pod in the namespace, as the cluster reports it.
    pub async fn list(&self) -> Vec<SandboxInfo> {
        let pods = match self.backend.list_pods(self.namespace(), &managed_selector()).await {
            Ok(pods) => pods,
            Err(e) => {
                tracing::warn!(error = %e, "listing sandboxes failed");
                return Vec::new();
            }
        };
        pods.iter()
            .filter(|p| p.label(LABEL_POOL) != Some(POOL_WARM))
            .filter_map(|p| {
                Sandbox::from_pod(
                    p,
                    self.namespace(),
                    self.backend.clone(),
                    self.clock.clone(),
                    self.audit.clone(),
                    self.config.exec_stream_timeout,
                )
            })
            .map(|s| s.info())
            .collect()
    }

    /// Snapshot of the registry.
    pub async fn registered(&self) -> Vec<Arc<Sandbox>> {
        self.sandboxes.read().await.values().cloned().collect()
    }

    /// Register every sandbox pod in the cluster that this provider does
    /// not know yet. Returns how many were added.
    pub async fn rehydrate(&self) -> usize {
        let pods = match self.backend.list_pods(self.namespace(), &managed_selector()).await {
            Ok(pods) => pods,
            Err(e) => {
                tracing::warn!(error = %e, "rehydrate failed");
                return 0;
            }
        };

        let mut added = 0;
        for pod in pods.iter().filter(|p| p.label(LABEL_POOL) != Some(POOL_WARM)) {
            let Some(sandbox) = Sandbox::from_pod(
                pod,
                self.namespace(),
                self.backend.clone(),
                self.clock.clone(),
                self.audit.clone(),
                self.config.exec_stream_timeout,
            ) else {
                continue;
            };
            if self.get_by_id(sandbox.id()).await.is_some() {
                continue;
            }
            self.register(Arc::new(sandbox)).await;
            added += 1;
        }
        tracing::info!(added, "rehydrated sandboxes from cluster");
        added
    }

    // ── Cleanup ─────────────────────────────────────────────────────

    /// Stop and forget registered sandboxes matching `options`. Returns how
    /// many were removed; failures are logged and skipped.
    pub async fn cleanup(&self, options: CleanupOptions) -> usize {
        let statuses = options
            .status
            .unwrap_or_else(|| vec![SandboxStatus::Stopped]);
        let mut removed = 0;

        for sandbox in self.registered().await {
            if !statuses.contains(&sandbox.status()) {
                continue;
            }
            if options
                .older_than
                .is_some_and(|cutoff| sandbox.last_activity() >= cutoff)
            {
                continue;
            }
            match self.teardown(&sandbox).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    tracing::warn!(sandbox_id = %sandbox.id(), error = %e, "cleanup skipped sandbox");
                }
            }
        }

        tracing::info!(removed, "sandbox cleanup finished");
        removed
    }

    /// Stop and forget one sandbox whatever its status. Returns false if
    /// the id is not registered.
    pub async fn destroy(&self, sandbox_id: &str) -> Result<bool, SandboxError> {
        let Some(sandbox) = self.get_by_id(sandbox_id).await else {
            return Ok(false);
        };
        self.teardown(&sandbox).await?;
        Ok(true)
    }

    async fn teardown(&self, sandbox: &Sandbox) -> Result<(), SandboxError> {
        if sandbox.status() != SandboxStatus::Stopped {
            sandbox.stop().await?;
        } else {
            // A pod that completed on its own is stopped but still present.
            match self.backend.delete_pod(self.namespace(), sandbox.container_id()).await {
                Ok(()) | Err(BackendError::NotFound(_)) => {}
                Err(e) => {
                    tracing::debug!(sandbox_id = %sandbox.id(), error = %e, "leftover pod not deleted");
                }
            }
        }

        if let Err(e) = self.security.delete_sandbox_egress_policy(sandbox.id()).await {
            tracing::warn!(sandbox_id = %sandbox.id(), error = %e, "failed to delete egress policy");
        }

        if self.config.volume_type == VolumeType::PersistentClaim {
            let pvc = pvc_name(sandbox.id());
            match self.backend.delete_pvc(self.namespace(), &pvc).await {
                Ok(()) => self.audit.record(AuditEvent::PvcDeleted {
                    sandbox_id: sandbox.id().to_string(),
                    pvc,
                }),
                Err(BackendError::NotFound(_)) => {}
                Err(e) => {
                    tracing::warn!(sandbox_id = %sandbox.id(), pvc = %pvc, error = %e, "failed to delete workspace claim");
                }
            }
        }

        self.evict(sandbox).await;
        Ok(())
    }

    /// Stop every registered sandbox and drain the warm pool. Returns how
    /// many sandboxes were stopped.
    pub async fn shutdown(&self) -> usize {
        let mut stopped = 0;
        for sandbox in self.registered().await {
            if !sandbox.is_active() {
                continue;
            }
            match sandbox.stop().await {
                Ok(()) => stopped += 1,
                Err(e) => tracing::warn!(sandbox_id = %sandbox.id(), error = %e, "failed to stop sandbox on shutdown"),
            }
        }
        if let Some(pool) = &self.warm_pool {
            pool.drain().await;
        }
        tracing::info!(stopped, "sandbox provider shut down");
        stopped
    }

    // ── Health ──────────────────────────────────────────────────────

    /// Never fails. Anything that could not be checked makes the provider
    /// unhealthy and is named in `message`.
    pub async fn health_check(&self) -> HealthStatus {
        let mut health = HealthStatus::default();
        let mut problems = Vec::new();

        match self.backend.server_version().await {
            Ok(v) => {
                health.api_reachable = true;
                health.server_version = Some(v.git_version);
            }
            Err(e) => problems.push(format!("api unreachable: {e}")),
        }

        if health.api_reachable {
            match self.backend.get_namespace(self.namespace()).await {
                Ok(_) => health.namespace_exists = true,
                Err(BackendError::NotFound(_)) => {
                    problems.push(format!("namespace {} does not exist", self.namespace()))
                }
                Err(e) => problems.push(format!("namespace check failed: {e}")),
            }

            health.schema_registered = match self.backend.api_group_available(NETWORKING_API).await {
                Ok(true) => true,
                Ok(false) => {
                    problems.push(format!("{NETWORKING_API} is not served"));
                    false
                }
                Err(e) => {
                    problems.push(format!("api discovery failed: {e}"));
                    false
                }
            };
            if health.schema_registered && self.warm_pool.is_some() {
                if let Err(e) = self.backend.list_pods(self.namespace(), &warm_selector()).await {
                    problems.push(format!("warm pool query failed: {e}"));
                    health.schema_registered = false;
                }
            }

            match self.backend.list_pods(self.namespace(), &managed_selector()).await {
                Ok(pods) => {
                    let counts = &mut health.pod_counts;
                    counts.total = pods.len();
                    for pod in &pods {
                        match pod.phase() {
                            Some("Running") => counts.running += 1,
                            Some("Pending") => counts.pending += 1,
                            Some("Failed") => counts.failed += 1,
                            _ => {}
                        }
                    }
                }
                Err(e) => problems.push(format!("pod listing failed: {e}")),
            }
        }

        if let Some(pool) = &self.warm_pool {
            if health.api_reachable {
                if let Err(e) = pool.maintain().await {
                    tracing::warn!(error = %e, "warm pool top-up failed");
                }
            }
            health.warm_pool = Some(pool.metrics().await);
        }

        health.healthy = health.api_reachable && health.namespace_exists && health.schema_registered;
        health.message = if problems.is_empty() {
            "ok".to_string()
        } else {
            problems.join("; ")
        };
        if !health.healthy {
            tracing::warn!(message = %health.message, "sandbox provider unhealthy");
        }
        health
    }

    // ── Events ──────────────────────────────────────────────────────

    pub fn on(&self, listener: impl Fn(&SandboxProviderEvent) + Send + Sync + 'static) -> ListenerId {
        self.events.on(listener)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.events.off(id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SandboxProviderEvent> {
        self.events.subscribe()
    }

    /// `subscribe` as a `Stream`. Lagging consumers see a `Lagged` item
    /// instead of the events they missed.
    pub fn event_stream(&self) -> BroadcastStream<SandboxProviderEvent> {
        BroadcastStream::new(self.events.subscribe())
    }

    // ── Security / warm pool ────────────────────────────────────────

    /// Warnings from security provisioning. Empty until the first
    /// `create`.
    pub async fn security_warnings(&self) -> Vec<String> {
        self.security_state
            .lock()
            .await
            .as_ref()
            .map(|r| r.warnings.clone())
            .unwrap_or_default()
    }

    /// Run security provisioning now instead of on the first `create`.
    pub async fn provision_security(&self) -> SecurityProvisionResult {
        self.ensure_security().await;
        self.security_state
            .lock()
            .await
            .clone()
            .unwrap_or_default()
    }

    pub fn warm_pool(&self) -> Option<&Arc<dyn WarmPoolController>> {
        self.warm_pool.as_ref()
    }

    /// Fill the warm pool with up to `count` pods.
    pub async fn prewarm(&self, count: usize) -> Result<usize, SandboxError> {
        let pool = self.warm_pool.as_ref().ok_or(SandboxError::WarmPoolNotEnabled)?;
        self.ensure_namespace().await?;
        pool.prewarm(count).await
    }
}
