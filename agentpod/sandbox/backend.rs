use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use super::error::BackendError;
use super::kube::models::{
    ExecStatus, Namespace, NetworkPolicy, PersistentVolumeClaim, Pod, PodMetrics, Role,
    RoleBinding, ServiceAccount, VersionInfo,
};

/// Everything the provider needs from a cluster.
///
/// One instance is constructed per `SandboxProvider` and injected into it;
/// the production implementation is [`KubeClient`](super::kube::KubeClient).
/// Implementations return [`BackendError`] only, never transport-specific
/// error types.
#[async_trait]
pub trait PodBackend: Send + Sync {
    // ── Pods ────────────────────────────────────────────────────────

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, BackendError>;
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, BackendError>;
    async fn list_pods(&self, namespace: &str, label_selector: &str)
    -> Result<Vec<Pod>, BackendError>;
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), BackendError>;
    /// Merge `labels` and `annotations` into the pod's metadata.
    async fn patch_pod_metadata(
        &self,
        namespace: &str,
        name: &str,
        labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
    ) -> Result<Pod, BackendError>;

    // ── Exec ────────────────────────────────────────────────────────

    /// Run `argv` to completion in `container`.
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        argv: &[String],
    ) -> Result<BackendExecOutput, BackendError>;

    /// Start `argv` in `container` and hand back live output channels.
    async fn exec_stream(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        argv: &[String],
    ) -> Result<BackendExecStream, BackendError>;

    // ── Namespaces / storage / policy ───────────────────────────────

    async fn get_namespace(&self, name: &str) -> Result<Namespace, BackendError>;
    async fn create_namespace(&self, namespace: &Namespace) -> Result<Namespace, BackendError>;

    async fn create_pvc(
        &self,
        namespace: &str,
        pvc: &PersistentVolumeClaim,
    ) -> Result<(), BackendError>;
    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<(), BackendError>;

    async fn create_network_policy(
        &self,
        namespace: &str,
        policy: &NetworkPolicy,
    ) -> Result<(), BackendError>;
    async fn delete_network_policy(&self, namespace: &str, name: &str)
    -> Result<(), BackendError>;

    async fn create_service_account(
        &self,
        namespace: &str,
        account: &ServiceAccount,
    ) -> Result<(), BackendError>;
    async fn create_role(&self, namespace: &str, role: &Role) -> Result<(), BackendError>;
    async fn create_role_binding(
        &self,
        namespace: &str,
        binding: &RoleBinding,
    ) -> Result<(), BackendError>;

    // ── Discovery ───────────────────────────────────────────────────

    async fn server_version(&self) -> Result<VersionInfo, BackendError>;

    /// Whether the API server serves `group_version` (e.g. "networking.k8s.io/v1").
    async fn api_group_available(&self, group_version: &str) -> Result<bool, BackendError>;

    /// Live usage for a pod. `Ok(None)` when no metrics server is installed.
    async fn pod_metrics(
        &self,
        _namespace: &str,
        _name: &str,
    ) -> Result<Option<PodMetrics>, BackendError> {
        Ok(None)
    }
}

/// Captured result of a one-shot exec.
///
/// `exit_code` is set when the backend reports one directly; otherwise the
/// out-of-band `status` carries success/failure and the exit code cause.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i32>,
    pub status: Option<ExecStatus>,
}

impl BackendExecOutput {
    /// Whether the process reported how it ended.
    pub fn is_complete(&self) -> bool {
        self.exit_code.is_some() || self.status.is_some()
    }

    pub fn normalized_exit_code(&self) -> i32 {
        match (self.exit_code, &self.status) {
            (Some(code), _) => code,
            (None, Some(status)) => status.normalized_exit_code(),
            // An outcome nobody reported is not a success.
            (None, None) => 1,
        }
    }
}

/// Live output of a streaming exec.
pub struct BackendExecStream {
    pub stdout: mpsc::Receiver<Vec<u8>>,
    pub stderr: mpsc::Receiver<Vec<u8>>,
    /// Resolves once with the out-of-band status when the process exits.
    /// Dropped without a value if the connection is lost.
    pub status: oneshot::Receiver<ExecStatus>,
    pub terminator: Box<dyn RemoteTerminator>,
}

/// Asks the backend to end a streaming exec's remote process.
#[async_trait]
pub trait RemoteTerminator: Send + Sync {
    async fn terminate(&self) -> Result<(), BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_exit_code_wins() {
        let out = BackendExecOutput {
            exit_code: Some(7),
            status: Some(ExecStatus::success()),
            ..Default::default()
        };
        assert_eq!(out.normalized_exit_code(), 7);
    }

    #[test]
    fn exit_code_from_out_of_band_status() {
        let out = BackendExecOutput {
            status: Some(ExecStatus::exit_code(127)),
            ..Default::default()
        };
        assert_eq!(out.normalized_exit_code(), 127);
    }

    #[test]
    fn missing_status_is_incomplete_failure() {
        let out = BackendExecOutput::default();
        assert!(!out.is_complete());
        assert_eq!(out.normalized_exit_code(), 1);
    }
}
