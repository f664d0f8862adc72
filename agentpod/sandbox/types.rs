use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Sandbox identity ────────────────────────────────────────────────

pub type SandboxId = String;
pub type ProjectId = String;

// ── Sandbox config (input to create) ────────────────────────────────

/// What a caller asks for when creating a sandbox. Immutable once passed
/// to the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    pub project_id: ProjectId,
    /// Host path of the project checkout. Only used by `VolumeType::HostPath`.
    #[serde(default)]
    pub project_path: String,
    pub image: String,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u32,
    #[serde(default = "default_cpu_cores")]
    pub cpu_cores: f64,
    #[serde(default = "default_idle_timeout_minutes")]
    pub idle_timeout_minutes: u32,
    #[serde(default)]
    pub mounts: Vec<MountSpec>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_memory_mb() -> u32 {
    512
}

fn default_cpu_cores() -> f64 {
    1.0
}

fn default_idle_timeout_minutes() -> u32 {
    30
}

impl SandboxConfig {
    pub fn new(project_id: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            project_path: String::new(),
            image: image.into(),
            memory_mb: default_memory_mb(),
            cpu_cores: default_cpu_cores(),
            idle_timeout_minutes: default_idle_timeout_minutes(),
            mounts: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_resources(mut self, memory_mb: u32, cpu_cores: f64) -> Self {
        self.memory_mb = memory_mb;
        self.cpu_cores = cpu_cores;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_mount(mut self, mount: MountSpec) -> Self {
        self.mounts.push(mount);
        self
    }

    pub fn with_project_path(mut self, path: impl Into<String>) -> Self {
        self.project_path = path.into();
        self
    }
}

/// An extra scratch mount inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    pub name: String,
    pub mount_path: String,
    #[serde(default)]
    pub read_only: bool,
}

// ── Status ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Creating,
    Running,
    Idle,
    Stopping,
    Stopped,
    Error,
}

impl SandboxStatus {
    /// `Stopped` and `Error` are final; nothing leaves them.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }

    /// Allowed lifecycle edges:
    /// `creating → running → {idle, stopping} → stopped`, `idle ↔ running`,
    /// and any non-terminal state `→ error`.
    pub fn can_transition_to(self, next: SandboxStatus) -> bool {
        use SandboxStatus::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Error) => true,
            (Creating, Running) => true,
            (Running, Idle) | (Running, Stopping) => true,
            (Idle, Running) | (Idle, Stopping) => true,
            (Stopping, Stopped) => true,
            _ => false,
        }
    }

    /// Map a Kubernetes pod phase to a sandbox status.
    pub fn from_phase(phase: Option<&str>) -> Self {
        match phase {
            Some("Running") => Self::Running,
            Some("Pending") => Self::Creating,
            Some("Paused") => Self::Idle,
            Some("Failed") => Self::Error,
            Some("Succeeded") => Self::Stopped,
            _ => Self::Creating,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Idle => "idle",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            Self::Creating => 0,
            Self::Running => 1,
            Self::Idle => 2,
            Self::Stopping => 3,
            Self::Stopped => 4,
            Self::Error => 5,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Creating,
            1 => Self::Running,
            2 => Self::Idle,
            3 => Self::Stopping,
            4 => Self::Stopped,
            _ => Self::Error,
        }
    }
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SandboxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "creating" => Ok(Self::Creating),
            "running" => Ok(Self::Running),
            "idle" => Ok(Self::Idle),
            "stopping" => Ok(Self::Stopping),
            "stopped" => Ok(Self::Stopped),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown sandbox status: {other}")),
        }
    }
}

// ── Snapshots ───────────────────────────────────────────────────────

/// Point-in-time view of a sandbox.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SandboxInfo {
    pub id: SandboxId,
    pub project_id: ProjectId,
    pub container_id: String,
    pub status: SandboxStatus,
    pub image: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub memory_mb: u32,
    pub cpu_cores: f64,
}

/// Resource fields are zero when the backend could not report them.
/// Zero means "unknown", not "idle".
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SandboxMetrics {
    pub sandbox_id: SandboxId,
    pub uptime_secs: u64,
    pub cpu_millicores: u64,
    pub memory_bytes: u64,
    pub last_activity_at: DateTime<Utc>,
}

// ── Exec model ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Input to `Sandbox::exec_stream`.
#[derive(Debug, Clone, Default)]
pub struct ExecStreamRequest {
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<String>,
    /// Overrides the provider's default stream timeout for this call.
    pub timeout: Option<Duration>,
}

impl ExecStreamRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

// ── tmux ────────────────────────────────────────────────────────────

/// A tmux session inside a sandbox. Derived from `tmux list-sessions`
/// output on every call; never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TmuxSession {
    pub name: String,
    pub sandbox_id: SandboxId,
    pub task_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub window_count: u32,
    pub attached: bool,
}

// ── Events ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SandboxProviderEvent {
    Creating {
        sandbox_id: SandboxId,
        project_id: ProjectId,
    },
    Created {
        sandbox_id: SandboxId,
        project_id: ProjectId,
    },
    Started {
        sandbox_id: SandboxId,
        project_id: ProjectId,
    },
    /// `sandbox_id` is empty when the request failed before an id was
    /// assigned.
    Error {
        sandbox_id: SandboxId,
        project_id: ProjectId,
        error: String,
    },
}

impl SandboxProviderEvent {
    pub fn sandbox_id(&self) -> &str {
        match self {
            Self::Creating { sandbox_id, .. }
            | Self::Created { sandbox_id, .. }
            | Self::Started { sandbox_id, .. }
            | Self::Error { sandbox_id, .. } => sandbox_id,
        }
    }

    pub fn project_id(&self) -> &str {
        match self {
            Self::Creating { project_id, .. }
            | Self::Created { project_id, .. }
            | Self::Started { project_id, .. }
            | Self::Error { project_id, .. } => project_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Creating { .. } => "creating",
            Self::Created { .. } => "created",
            Self::Started { .. } => "started",
            Self::Error { .. } => "error",
        }
    }
}

// ── Cleanup / health ────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct CleanupOptions {
    /// Only sandboxes whose last activity is strictly before this instant.
    pub older_than: Option<DateTime<Utc>>,
    /// Statuses that qualify. `None` means `[Stopped]`.
    pub status: Option<Vec<SandboxStatus>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PodCounts {
    pub total: usize,
    pub running: usize,
    pub pending: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WarmPoolMetrics {
    pub warm: usize,
    pub allocated: usize,
    pub draining: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate_percent: f64,
    pub avg_allocation_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub message: String,
    pub api_reachable: bool,
    pub namespace_exists: bool,
    pub schema_registered: bool,
    pub server_version: Option<String>,
    pub pod_counts: PodCounts,
    pub warm_pool: Option<WarmPoolMetrics>,
}

// ── Provider config ─────────────────────────────────────────────────

/// How the `/workspace` volume is backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VolumeType {
    #[default]
    Ephemeral,
    HostPath,
    PersistentClaim,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmPoolConfig {
    pub enabled: bool,
    pub min_size: usize,
    pub max_size: usize,
    pub autoscale: bool,
}

impl Default for WarmPoolConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_size: 1,
            max_size: 5,
            autoscale: false,
        }
    }
}

/// Provider-wide settings. Loaded and persisted elsewhere; the provider
/// only reads them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub namespace: String,
    pub default_image: String,
    pub volume_type: VolumeType,
    pub storage_class: Option<String>,
    pub storage_size: String,
    /// Size limit for ephemeral workspaces, e.g. "10Gi".
    pub ephemeral_size_limit: Option<String>,
    pub warm_pool: WarmPoolConfig,
    #[serde(with = "duration_secs")]
    pub readiness_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub readiness_poll_interval: Duration,
    #[serde(with = "duration_secs")]
    pub exec_stream_timeout: Duration,
    pub egress_allowlist: Vec<String>,
    pub enable_rbac: bool,
    pub enable_network_policy: bool,
    pub enable_audit: bool,
    pub allow_host_path: bool,
    pub service_account: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            namespace: "agentpod-sandboxes".into(),
            default_image: "ghcr.io/agentpod/sandbox:latest".into(),
            volume_type: VolumeType::Ephemeral,
            storage_class: None,
            storage_size: "10Gi".into(),
            ephemeral_size_limit: Some("10Gi".into()),
            warm_pool: WarmPoolConfig::default(),
            readiness_timeout: Duration::from_secs(120),
            readiness_poll_interval: Duration::from_millis(1000),
            exec_stream_timeout: Duration::from_secs(60 * 60),
            egress_allowlist: vec![
                "api.anthropic.com".into(),
                "github.com".into(),
                "registry.npmjs.org".into(),
                "pypi.org".into(),
            ],
            enable_rbac: true,
            enable_network_policy: true,
            enable_audit: true,
            allow_host_path: false,
            service_account: "agentpod-sandbox".into(),
        }
    }
}

/// Connection settings for the Kubernetes API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KubeConfig {
    pub api_url: String,
    pub token: Option<String>,
    pub accept_invalid_certs: bool,
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
}

impl Default for KubeConfig {
    fn default() -> Self {
        Self {
            api_url: "https://kubernetes.default.svc".into(),
            token: None,
            accept_invalid_certs: false,
            request_timeout: Duration::from_secs(30),
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
