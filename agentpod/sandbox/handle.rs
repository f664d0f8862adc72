//! The live handle for one sandbox pod.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, TimeZone, Utc};

use super::audit::{AuditEvent, AuditSink};
use super::backend::{BackendExecOutput, PodBackend};
use super::error::{BackendError, SandboxError};
use super::kube::models::{Pod, parse_cpu_millicores, parse_memory_bytes};
use super::pod_spec::{ANNOTATION_IMAGE, ANNOTATION_PROJECT_ID, CONTAINER_NAME, LABEL_PROJECT_ID, LABEL_SANDBOX_ID};
use super::readiness::Clock;
use super::shell::{display_command, read_file_command, write_file_command};
use super::types::*;

/// Everything a handle is built from.
pub(crate) struct SandboxParts {
    pub id: SandboxId,
    pub project_id: ProjectId,
    pub pod_name: String,
    pub namespace: String,
    pub image: String,
    pub memory_mb: u32,
    pub cpu_cores: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub status: SandboxStatus,
    pub backend: Arc<dyn PodBackend>,
    pub clock: Arc<dyn Clock>,
    pub audit: Arc<dyn AuditSink>,
    pub exec_stream_timeout: Duration,
}

/// A running (or once-running) sandbox.
///
/// `id` and `container_id` never change. Status only moves along the edges
/// allowed by [`SandboxStatus::can_transition_to`], and `last_activity`
/// never goes backwards, even under concurrent callers.
pub struct Sandbox {
    id: SandboxId,
    project_id: ProjectId,
    container_id: String,
    namespace: String,
    image: String,
    memory_mb: u32,
    cpu_cores: f64,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    status: AtomicU8,
    last_activity_ms: AtomicI64,
    pub(crate) backend: Arc<dyn PodBackend>,
    pub(crate) clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
    pub(crate) exec_stream_timeout: Duration,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("id", &self.id)
            .field("project_id", &self.project_id)
            .field("container_id", &self.container_id)
            .field("status", &self.status())
            .finish()
    }
}

impl Sandbox {
    pub(crate) fn new(parts: SandboxParts) -> Self {
        let now_ms = parts.clock.now().timestamp_millis();
        Self {
            id: parts.id,
            project_id: parts.project_id,
            container_id: parts.pod_name,
            namespace: parts.namespace,
            image: parts.image,
            memory_mb: parts.memory_mb,
            cpu_cores: parts.cpu_cores,
            created_at: parts.created_at,
            started_at: parts.started_at,
            status: AtomicU8::new(parts.status.to_u8()),
            last_activity_ms: AtomicI64::new(now_ms),
            backend: parts.backend,
            clock: parts.clock,
            audit: parts.audit,
            exec_stream_timeout: parts.exec_stream_timeout,
        }
    }

    /// Rebuild a handle for a pod found in the cluster. Returns `None` for
    /// pods that carry no sandbox id label.
    pub(crate) fn from_pod(
        pod: &Pod,
        namespace: &str,
        backend: Arc<dyn PodBackend>,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
        exec_stream_timeout: Duration,
    ) -> Option<Self> {
        let id = pod.label(LABEL_SANDBOX_ID)?.to_string();
        let pod_name = pod.metadata.name.clone()?;
        let project_id = pod
            .metadata
            .annotations
            .get(ANNOTATION_PROJECT_ID)
            .cloned()
            .or_else(|| pod.label(LABEL_PROJECT_ID).map(str::to_string))
            .unwrap_or_default();

        let container = pod
            .spec
            .as_ref()
            .and_then(|s| s.containers.iter().find(|c| c.name == CONTAINER_NAME));
        let image = pod
            .metadata
            .annotations
            .get(ANNOTATION_IMAGE)
            .cloned()
            .or_else(|| container.map(|c| c.image.clone()))
            .unwrap_or_default();
        let limits = container.and_then(|c| c.resources.as_ref()).map(|r| &r.limits);
        let memory_mb = limits
            .and_then(|l| l.get("memory"))
            .and_then(|m| parse_memory_bytes(m))
            .map(|b| (b / (1024 * 1024)) as u32)
            .unwrap_or(0);
        let cpu_cores = limits
            .and_then(|l| l.get("cpu"))
            .and_then(|c| parse_cpu_millicores(c))
            .map(|m| m as f64 / 1000.0)
            .unwrap_or(0.0);

        let created_at = pod
            .metadata
            .creation_timestamp
            .unwrap_or_else(|| clock.now());
        let started_at = pod.status.as_ref().and_then(|s| s.start_time);

        Some(Self::new(SandboxParts {
            id,
            project_id,
            pod_name,
            namespace: namespace.to_string(),
            image,
            memory_mb,
            cpu_cores,
            created_at,
            started_at,
            status: SandboxStatus::from_phase(pod.phase()),
            backend,
            clock,
            audit,
            exec_stream_timeout,
        }))
    }

    // ── Identity / state ────────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Name of the backing pod.
    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn status(&self) -> SandboxStatus {
        SandboxStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        !self.status().is_terminal()
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        let ms = self.last_activity_ms.load(Ordering::Acquire);
        Utc.timestamp_millis_opt(ms).single().unwrap_or(self.created_at)
    }

    pub fn info(&self) -> SandboxInfo {
        SandboxInfo {
            id: self.id.clone(),
            project_id: self.project_id.clone(),
            container_id: self.container_id.clone(),
            status: self.status(),
            image: self.image.clone(),
            created_at: self.created_at,
            last_activity_at: self.last_activity(),
            memory_mb: self.memory_mb,
            cpu_cores: self.cpu_cores,
        }
    }

    /// Move to `next` if the lifecycle allows it from the current state.
    pub(crate) fn transition(&self, next: SandboxStatus) -> bool {
        let mut current = self.status.load(Ordering::Acquire);
        loop {
            let from = SandboxStatus::from_u8(current);
            if from == next {
                return true;
            }
            if !from.can_transition_to(next) {
                return false;
            }
            match self.status.compare_exchange(
                current,
                next.to_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    tracing::debug!(sandbox_id = %self.id, from = %from, to = %next, "status changed");
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Record activity now. Wakes an idle sandbox back to running.
    pub fn touch(&self) {
        let now = self.clock.now().timestamp_millis();
        self.last_activity_ms.fetch_max(now, Ordering::AcqRel);
        if self.status() == SandboxStatus::Idle {
            self.transition(SandboxStatus::Running);
        }
    }

    /// Mark a running sandbox idle. No-op in any other state.
    pub fn mark_idle(&self) -> bool {
        self.status() == SandboxStatus::Running && self.transition(SandboxStatus::Idle)
    }

    pub(crate) fn ensure_active(&self) -> Result<(), SandboxError> {
        let status = self.status();
        if status.is_terminal() {
            return Err(SandboxError::SandboxTerminated {
                id: self.id.clone(),
                status,
            });
        }
        Ok(())
    }

    // ── Exec ────────────────────────────────────────────────────────

    pub(crate) async fn exec_argv(&self, argv: &[String]) -> Result<BackendExecOutput, SandboxError> {
        self.ensure_active()?;
        self.touch();
        let out = self
            .backend
            .exec(&self.namespace, &self.container_id, CONTAINER_NAME, argv)
            .await
            .map_err(|e| {
                tracing::warn!(sandbox_id = %self.id, error = %e, "exec failed");
                SandboxError::exec(&display_command(argv), e)
            })?;
        if !out.is_complete() {
            tracing::warn!(sandbox_id = %self.id, "exec ended without an exit status");
            return Err(SandboxError::ExecFailed {
                command: display_command(argv),
                message: "connection closed before the process reported an exit status".into(),
            });
        }
        Ok(out)
    }

    /// Run a command to completion. Output is trimmed; a non-zero exit
    /// is reported in the result, not as an error.
    pub async fn exec(&self, command: &str, args: &[&str]) -> Result<ExecResult, SandboxError> {
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(command.to_string());
        argv.extend(args.iter().map(|a| a.to_string()));
        self.run(&argv).await
    }

    pub(crate) async fn run(&self, argv: &[String]) -> Result<ExecResult, SandboxError> {
        let out = self.exec_argv(argv).await?;
        let result = ExecResult {
            exit_code: out.normalized_exit_code(),
            stdout: String::from_utf8_lossy(&out.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
        };
        tracing::debug!(
            sandbox_id = %self.id,
            command = %argv.first().map(String::as_str).unwrap_or(""),
            exit_code = result.exit_code,
            "exec finished"
        );
        Ok(result)
    }

    /// Sandboxes always run as the unprivileged sandbox user; this runs the
    /// command as that user and says so.
    pub async fn exec_as_root(&self, command: &str, args: &[&str]) -> Result<ExecResult, SandboxError> {
        tracing::warn!(
            sandbox_id = %self.id,
            command = %command,
            "root exec requested; running as the sandbox user instead"
        );
        self.exec(command, args).await
    }

    // ── Files ───────────────────────────────────────────────────────

    pub async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), SandboxError> {
        let argv = write_file_command(path, &BASE64.encode(contents));
        let out = self.exec_argv(&argv).await?;
        let code = out.normalized_exit_code();
        if code != 0 {
            return Err(SandboxError::ExecFailed {
                command: format!("write {path}"),
                message: format!(
                    "exit code {code}: {}",
                    String::from_utf8_lossy(&out.stderr).trim()
                ),
            });
        }
        Ok(())
    }

    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>, SandboxError> {
        let out = self.exec_argv(&read_file_command(path)).await?;
        let code = out.normalized_exit_code();
        if code != 0 {
            return Err(SandboxError::ExecFailed {
                command: format!("read {path}"),
                message: format!(
                    "exit code {code}: {}",
                    String::from_utf8_lossy(&out.stderr).trim()
                ),
            });
        }
        let encoded: Vec<u8> = out
            .stdout
            .into_iter()
            .filter(|b| !b.is_ascii_whitespace())
            .collect();
        BASE64.decode(encoded).map_err(|e| SandboxError::ExecFailed {
            command: format!("read {path}"),
            message: format!("invalid base64 from sandbox: {e}"),
        })
    }

    // ── Metrics ─────────────────────────────────────────────────────

    /// Best-effort usage snapshot. Never fails; unknown figures are zero.
    pub async fn get_metrics(&self) -> SandboxMetrics {
        let now = self.clock.now();
        let reported_start = match self.backend.get_pod(&self.namespace, &self.container_id).await {
            Ok(pod) => pod.status.and_then(|s| s.start_time),
            Err(e) => {
                tracing::debug!(sandbox_id = %self.id, error = %e, "pod lookup for metrics failed");
                None
            }
        };
        let since = reported_start
            .or(self.started_at)
            .unwrap_or_else(|| self.last_activity());
        let uptime_secs = (now - since).num_seconds().max(0) as u64;

        let (mut cpu_millicores, mut memory_bytes) = (0, 0);
        match self
            .backend
            .pod_metrics(&self.namespace, &self.container_id)
            .await
        {
            Ok(Some(m)) => {
                for c in &m.containers {
                    cpu_millicores += c.usage.get("cpu").and_then(|q| parse_cpu_millicores(q)).unwrap_or(0);
                    memory_bytes += c.usage.get("memory").and_then(|q| parse_memory_bytes(q)).unwrap_or(0);
                }
            }
            Ok(None) => {}
            Err(e) => tracing::debug!(sandbox_id = %self.id, error = %e, "pod metrics unavailable"),
        }

        SandboxMetrics {
            sandbox_id: self.id.clone(),
            uptime_secs,
            cpu_millicores,
            memory_bytes,
            last_activity_at: self.last_activity(),
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Delete the pod. `Stopping` is visible to other readers before the
    /// delete is issued; a pod that is already gone counts as stopped.
    pub async fn stop(&self) -> Result<(), SandboxError> {
        let from = self.status();
        if from == SandboxStatus::Stopped {
            return Ok(());
        }
        self.transition(SandboxStatus::Stopping);
        tracing::info!(sandbox_id = %self.id, pod = %self.container_id, from = %from, "stopping sandbox");

        match self
            .backend
            .delete_pod(&self.namespace, &self.container_id)
            .await
        {
            Ok(()) | Err(BackendError::NotFound(_)) => {
                // A creation that never reached `running` can only end in
                // `error`; everything else lands on `stopped`.
                if !self.transition(SandboxStatus::Stopped) {
                    self.transition(SandboxStatus::Error);
                }
                self.audit.record(AuditEvent::PodDeleted {
                    sandbox_id: self.id.clone(),
                    pod: self.container_id.clone(),
                });
                Ok(())
            }
            Err(e) => {
                tracing::error!(sandbox_id = %self.id, pod = %self.container_id, error = %e, "failed to delete pod");
                self.transition(SandboxStatus::Error);
                Err(SandboxError::PodDeletionFailed {
                    pod: self.container_id.clone(),
                    message: e.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::sandbox::audit::NoopAuditSink;
    use crate::sandbox::kube::models::{ContainerMetrics, PodMetrics};
    use crate::sandbox::mock::{MockBackend, exec_output, pod_with_status};
    use crate::sandbox::readiness::ManualClock;

    pub(crate) const NS: &str = "agentpod-sandboxes";

    pub(crate) fn sandbox_with(backend: Arc<MockBackend>, clock: Arc<ManualClock>) -> Sandbox {
        backend.insert_pod(NS, pod_with_status("sandbox-p1-abc", "Running", true));
        Sandbox::new(SandboxParts {
            id: "abc".into(),
            project_id: "p1".into(),
            pod_name: "sandbox-p1-abc".into(),
            namespace: NS.into(),
            image: "img".into(),
            memory_mb: 512,
            cpu_cores: 1.0,
            created_at: clock.now(),
            started_at: None,
            status: SandboxStatus::Running,
            backend,
            clock,
            audit: Arc::new(NoopAuditSink),
            exec_stream_timeout: Duration::from_secs(5),
        })
    }

    fn setup() -> (Arc<MockBackend>, Arc<ManualClock>, Sandbox) {
        let backend = Arc::new(MockBackend::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let sb = sandbox_with(backend.clone(), clock.clone());
        (backend, clock, sb)
    }

    #[tokio::test]
    async fn exec_trims_and_normalizes_exit_code() {
        let (backend, _, sb) = setup();
        backend.on_exec(|argv| {
            assert_eq!(argv, ["ls", "-la"]);
            let mut out = exec_output("  a\nb \n", 2);
            out.stderr = b"warn\n".to_vec();
            Ok(out)
        });
        let result = sb.exec("ls", &["-la"]).await.unwrap();
        assert_eq!(result.exit_code, 2);
        assert_eq!(result.stdout, "a\nb");
        assert_eq!(result.stderr, "warn");
        assert!(!result.success());
    }

    #[tokio::test]
    async fn exec_transport_error_carries_command() {
        let (backend, _, sb) = setup();
        backend.fail("exec", BackendError::Transport("reset".into()));
        let err = sb.exec("echo", &["hi there"]).await.unwrap_err();
        match err {
            SandboxError::ExecFailed { command, message } => {
                assert_eq!(command, "echo 'hi there'");
                assert!(message.contains("reset"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn exec_without_exit_status_is_a_failure() {
        let (backend, _, sb) = setup();
        backend.on_exec(|_| {
            Ok(BackendExecOutput {
                stdout: b"half".to_vec(),
                ..Default::default()
            })
        });
        let err = sb.exec("make", &[]).await.unwrap_err();
        match err {
            SandboxError::ExecFailed { command, message } => {
                assert_eq!(command, "make");
                assert!(message.contains("exit status"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn exec_as_root_runs_as_default_user() {
        let (backend, _, sb) = setup();
        let result = sb.exec_as_root("id", &["-u"]).await.unwrap();
        assert!(result.success());
        assert_eq!(backend.exec_calls(), vec![vec!["id".to_string(), "-u".to_string()]]);
    }

    #[tokio::test]
    async fn exec_touches_last_activity() {
        let (_, clock, sb) = setup();
        let before = sb.last_activity();
        clock.advance(Duration::from_secs(30));
        sb.exec("true", &[]).await.unwrap();
        assert_eq!((sb.last_activity() - before).num_seconds(), 30);
    }

    #[test]
    fn last_activity_never_goes_backwards() {
        let backend = Arc::new(MockBackend::new());
        let start = Utc::now();
        let clock = Arc::new(ManualClock::new(start));
        let sb = sandbox_with(backend, clock.clone());
        clock.advance(Duration::from_secs(60));
        sb.touch();
        let later = sb.last_activity();

        // A stale timestamp (e.g. from a slow concurrent caller) loses.
        sb.last_activity_ms
            .fetch_max(start.timestamp_millis(), Ordering::AcqRel);
        assert_eq!(sb.last_activity(), later);
    }

    #[test]
    fn idle_and_touch() {
        let (_, _, sb) = setup();
        assert!(sb.mark_idle());
        assert_eq!(sb.status(), SandboxStatus::Idle);
        assert!(!sb.mark_idle());
        sb.touch();
        assert_eq!(sb.status(), SandboxStatus::Running);
    }

    #[tokio::test]
    async fn stop_moves_through_stopping_to_stopped() {
        let (backend, _, sb) = setup();
        sb.stop().await.unwrap();
        assert_eq!(sb.status(), SandboxStatus::Stopped);
        assert_eq!(backend.deleted_pods(), vec!["sandbox-p1-abc".to_string()]);
        // Idempotent.
        sb.stop().await.unwrap();
        assert_eq!(backend.deleted_pods().len(), 1);
    }

    #[tokio::test]
    async fn stop_treats_missing_pod_as_stopped() {
        let (backend, _, sb) = setup();
        backend.fail("delete_pod", BackendError::NotFound("gone".into()));
        sb.stop().await.unwrap();
        assert_eq!(sb.status(), SandboxStatus::Stopped);
    }

    #[tokio::test]
    async fn failed_stop_is_error_not_running() {
        let (backend, _, sb) = setup();
        backend.fail("delete_pod", BackendError::Forbidden("nope".into()));
        let err = sb.stop().await.unwrap_err();
        assert!(matches!(err, SandboxError::PodDeletionFailed { .. }));
        assert_eq!(sb.status(), SandboxStatus::Error);
    }

    #[tokio::test]
    async fn exec_refused_after_stop() {
        let (backend, _, sb) = setup();
        sb.stop().await.unwrap();
        let err = sb.exec("ls", &[]).await.unwrap_err();
        assert!(matches!(
            err,
            SandboxError::SandboxTerminated {
                status: SandboxStatus::Stopped,
                ..
            }
        ));
        assert!(backend.exec_calls().is_empty());
    }

    #[test]
    fn terminal_states_are_sticky() {
        let (_, _, sb) = setup();
        assert!(sb.transition(SandboxStatus::Error));
        assert!(!sb.transition(SandboxStatus::Running));
        assert!(!sb.transition(SandboxStatus::Stopped));
        assert_eq!(sb.status(), SandboxStatus::Error);
    }

    #[tokio::test]
    async fn metrics_from_backend_when_available() {
        let (backend, clock, sb) = setup();
        let mut usage = std::collections::BTreeMap::new();
        usage.insert("cpu".to_string(), "250m".to_string());
        usage.insert("memory".to_string(), "64Mi".to_string());
        backend.set_metrics(
            NS,
            "sandbox-p1-abc",
            PodMetrics {
                containers: vec![ContainerMetrics {
                    name: "agent".into(),
                    usage,
                }],
            },
        );
        clock.advance(Duration::from_secs(90));
        let m = sb.get_metrics().await;
        assert_eq!(m.cpu_millicores, 250);
        assert_eq!(m.memory_bytes, 64 * 1024 * 1024);
        assert_eq!(m.sandbox_id, "abc");
    }

    #[tokio::test]
    async fn metrics_default_to_zero() {
        let (backend, clock, sb) = setup();
        backend.fail("get_pod", BackendError::Unavailable("down".into()));
        clock.advance(Duration::from_secs(10));
        let m = sb.get_metrics().await;
        assert_eq!(m.cpu_millicores, 0);
        assert_eq!(m.memory_bytes, 0);
        // Falls back to last activity, which was at creation.
        assert_eq!(m.uptime_secs, 10);
    }

    #[tokio::test]
    async fn files_round_trip_through_base64() {
        let (backend, _, sb) = setup();
        let stored = Arc::new(std::sync::Mutex::new(String::new()));
        let s = stored.clone();
        backend.on_exec(move |argv| {
            if argv[0] == "sh" {
                *s.lock().unwrap() = argv[5].clone();
                Ok(exec_output("", 0))
            } else {
                // `base64` wraps long output; the reader must cope.
                let encoded = s.lock().unwrap().clone();
                let (a, b) = encoded.split_at(encoded.len() / 2);
                Ok(exec_output(&format!("{a}\n{b}\n"), 0))
            }
        });
        sb.write_file("/workspace/a.txt", b"hello\nworld").await.unwrap();
        assert_eq!(sb.read_file("/workspace/a.txt").await.unwrap(), b"hello\nworld");
    }

    #[tokio::test]
    async fn read_missing_file_fails() {
        let (backend, _, sb) = setup();
        backend.on_exec(|_| {
            let mut out = exec_output("", 1);
            out.stderr = b"base64: /nope: No such file or directory".to_vec();
            Ok(out)
        });
        let err = sb.read_file("/nope").await.unwrap_err();
        assert!(matches!(err, SandboxError::ExecFailed { ref message, .. } if message.contains("No such file")));
    }

    #[test]
    fn rehydrates_from_pod() {
        let backend = Arc::new(MockBackend::new());
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        let config = ProviderConfig::default();
        let mut pod = crate::sandbox::pod_spec::PodSpecBuilder::new(&config).build(
            "id-9",
            "sandbox-my-proj-id-9",
            &SandboxConfig::new("My_Proj", "node:22").with_resources(1024, 0.5),
        );
        pod.status = Some(crate::sandbox::mock::status("Pending", false));

        let sb = Sandbox::from_pod(&pod, NS, backend, clock, Arc::new(NoopAuditSink), Duration::from_secs(1)).unwrap();
        assert_eq!(sb.id(), "id-9");
        assert_eq!(sb.project_id(), "My_Proj");
        assert_eq!(sb.container_id(), "sandbox-my-proj-id-9");
        assert_eq!(sb.status(), SandboxStatus::Creating);
        let info = sb.info();
        assert_eq!(info.image, "node:22");
        assert_eq!(info.memory_mb, 1024);
        assert_eq!(info.cpu_cores, 0.5);
    }

    #[test]
    fn pods_without_sandbox_label_are_skipped() {
        let pod = pod_with_status("random", "Running", true);
        let sb = Sandbox::from_pod(
            &pod,
            NS,
            Arc::new(MockBackend::new()),
            Arc::new(ManualClock::new(Utc::now())),
            Arc::new(NoopAuditSink),
            Duration::from_secs(1),
        );
        assert!(sb.is_none());
    }
}
