use std::time::Duration;

use serde::Deserialize;

use super::types::SandboxStatus;

/// Normalized backend failure.
///
/// Every backend maps its transport and API failures into these variants
/// at a single boundary (`BackendError::from_response` for HTTP status
/// codes). Nothing above the backend inspects status codes or response
/// bodies directly.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("transport: {0}")]
    Transport(String),

    #[error("decode: {0}")]
    Decode(String),

    #[error("backend returned {status}: {message}")]
    Other { status: u16, message: String },
}

/// The subset of a Kubernetes `Status` body we care about when mapping
/// error responses.
#[derive(Debug, Default, Deserialize)]
struct ErrorStatusBody {
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl BackendError {
    /// Map an HTTP error response into the fixed variant set.
    ///
    /// The body is read as a Kubernetes `Status` object when it parses as
    /// one; `reason` wins over the numeric status where they disagree
    /// (some proxies rewrite status codes but pass the body through).
    pub fn from_response(status: u16, body: &str) -> Self {
        let parsed: ErrorStatusBody = serde_json::from_str(body).unwrap_or_default();
        let message = parsed
            .message
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| body.trim().to_string());

        match parsed.reason.as_deref() {
            Some("AlreadyExists") | Some("Conflict") => return Self::Conflict(message),
            Some("NotFound") => return Self::NotFound(message),
            Some("Forbidden") => return Self::Forbidden(message),
            Some("Unauthorized") => return Self::Unauthorized(message),
            Some("Invalid") | Some("BadRequest") => return Self::Invalid(message),
            _ => {}
        }

        match status {
            400 | 422 => Self::Invalid(message),
            401 => Self::Unauthorized(message),
            403 => Self::Forbidden(message),
            404 => Self::NotFound(message),
            409 => Self::Conflict(message),
            429 | 502 | 503 | 504 => Self::Unavailable(message),
            _ => Self::Other { status, message },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Decode(e.to_string())
        } else if e.is_timeout() || e.is_connect() {
            Self::Unavailable(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

/// Errors from sandbox operations.
///
/// This is the full taxonomy callers can branch on. Backend-specific shapes
/// only ever appear wrapped in `Backend`, and creation paths convert those
/// with [`SandboxError::creation`] so that an HTTP 409 and the in-memory
/// duplicate check surface as the same `AlreadyExists`.
#[derive(thiserror::Error, Debug)]
pub enum SandboxError {
    #[error("sandbox already exists for project {project_id}")]
    AlreadyExists { project_id: String },

    #[error("sandbox creation failed: {0}")]
    CreationFailed(String),

    #[error("pod security violation: {}", .violations.join("; "))]
    SecurityViolation { violations: Vec<String> },

    #[error("namespace {namespace} unavailable: {message}")]
    NamespaceFailed { namespace: String, message: String },

    #[error("exec failed for `{command}`: {message}")]
    ExecFailed { command: String, message: String },

    #[error("exec timed out after {0:?}")]
    ExecTimeout(Duration),

    #[error("invalid environment variable name: {0:?}")]
    InvalidEnvKey(String),

    #[error("invalid tmux session name: {0:?}")]
    InvalidSessionName(String),

    #[error("tmux session already exists: {0}")]
    TmuxSessionExists(String),

    #[error("tmux session not found: {0}")]
    TmuxSessionNotFound(String),

    #[error("failed to delete pod {pod}: {message}")]
    PodDeletionFailed { pod: String, message: String },

    #[error("image pull failed for pod {pod}: {reason}")]
    ImagePullBackoff { pod: String, reason: String },

    #[error("pod {pod} not ready after {timeout:?} (last phase: {last_phase})")]
    ReadinessTimeout {
        pod: String,
        timeout: Duration,
        last_phase: String,
    },

    #[error("warm pool is not enabled")]
    WarmPoolNotEnabled,

    #[error("sandbox {id} is {status}")]
    SandboxTerminated { id: String, status: SandboxStatus },

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
}

impl SandboxError {
    /// Convert a backend failure seen while creating a project's sandbox.
    pub fn creation(project_id: &str, err: BackendError) -> Self {
        match err {
            BackendError::Conflict(_) => Self::AlreadyExists {
                project_id: project_id.to_string(),
            },
            other => Self::CreationFailed(other.to_string()),
        }
    }

    /// Convert a backend failure seen while running a command.
    pub fn exec(command: &str, err: BackendError) -> Self {
        Self::ExecFailed {
            command: command.to_string(),
            message: err.to_string(),
        }
    }

    /// Short machine-friendly name, used for audit records and events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AlreadyExists { .. } => "already_exists",
            Self::CreationFailed(_) => "creation_failed",
            Self::SecurityViolation { .. } => "security_violation",
            Self::NamespaceFailed { .. } => "namespace_failed",
            Self::ExecFailed { .. } => "exec_failed",
            Self::ExecTimeout(_) => "exec_timeout",
            Self::InvalidEnvKey(_) => "invalid_env_key",
            Self::InvalidSessionName(_) => "invalid_session_name",
            Self::TmuxSessionExists(_) => "tmux_session_exists",
            Self::TmuxSessionNotFound(_) => "tmux_session_not_found",
            Self::PodDeletionFailed { .. } => "pod_deletion_failed",
            Self::ImagePullBackoff { .. } => "image_pull_backoff",
            Self::ReadinessTimeout { .. } => "readiness_timeout",
            Self::WarmPoolNotEnabled => "warm_pool_not_enabled",
            Self::SandboxTerminated { .. } => "sandbox_terminated",
            Self::Backend(_) => "backend",
        }
    }
}
