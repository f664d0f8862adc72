pub mod audit;
pub mod backend;
pub mod error;
pub mod events;
pub mod handle;
pub mod kube;
pub mod pod_spec;
pub mod provider;
pub mod readiness;
pub mod security;
pub mod shell;
pub mod stream;
pub mod tmux;
pub mod types;
pub mod warm_pool;

#[cfg(test)]
pub(crate) mod mock;

pub use audit::{AuditEvent, AuditSink, NoopAuditSink, TracingAuditSink};
pub use backend::PodBackend;
pub use error::{BackendError, SandboxError};
pub use events::ListenerId;
pub use handle::Sandbox;
pub use kube::KubeClient;
pub use provider::{SandboxProvider, SandboxProviderBuilder};
pub use readiness::{Clock, SystemClock};
pub use security::{
    KubeSecurityProvisioner, PodSecurityValidator, RestrictedProfile, SecurityProvisionResult,
    SecurityProvisioner, ValidationResult, validate_pod,
};
pub use stream::{ExecKiller, SandboxExecStream};
pub use types::*;
pub use warm_pool::{PodWarmPool, WarmPod, WarmPodState, WarmPoolController};
