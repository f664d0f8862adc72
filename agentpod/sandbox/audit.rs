//! Audit trail for cluster-side changes.
//!
//! Recording is synchronous and infallible from the caller's point of view:
//! a sink must never block a sandbox operation or turn it into a failure.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    PodCreated {
        sandbox_id: String,
        project_id: String,
        pod: String,
        image: String,
    },
    PodStarted {
        sandbox_id: String,
        pod: String,
        startup_ms: i64,
    },
    PodFailed {
        sandbox_id: String,
        project_id: String,
        pod: String,
        error: String,
    },
    PodDeleted {
        sandbox_id: String,
        pod: String,
    },
    PvcCreated {
        sandbox_id: String,
        pvc: String,
    },
    PvcDeleted {
        sandbox_id: String,
        pvc: String,
    },
    NamespaceCreated {
        namespace: String,
    },
    PolicyCreated {
        name: String,
    },
    RbacCreated {
        kind: String,
        name: String,
    },
    SecurityViolation {
        project_id: String,
        pod: String,
        violations: Vec<String>,
    },
}

impl AuditEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::PodCreated { .. } => "pod_created",
            Self::PodStarted { .. } => "pod_started",
            Self::PodFailed { .. } => "pod_failed",
            Self::PodDeleted { .. } => "pod_deleted",
            Self::PvcCreated { .. } => "pvc_created",
            Self::PvcDeleted { .. } => "pvc_deleted",
            Self::NamespaceCreated { .. } => "namespace_created",
            Self::PolicyCreated { .. } => "policy_created",
            Self::RbacCreated { .. } => "rbac_created",
            Self::SecurityViolation { .. } => "security_violation",
        }
    }
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Writes each record as one structured log line on the `agentpod::audit`
/// target, so it can be routed separately by the subscriber's filter.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        let name = event.name();
        match serde_json::to_string(&event) {
            Ok(json) => {
                if matches!(event, AuditEvent::SecurityViolation { .. } | AuditEvent::PodFailed { .. }) {
                    tracing::warn!(target: "agentpod::audit", event = name, record = %json, "audit");
                } else {
                    tracing::info!(target: "agentpod::audit", event = name, record = %json, "audit");
                }
            }
            Err(e) => tracing::warn!(target: "agentpod::audit", event = name, error = %e, "unserializable audit record"),
        }
    }
}

/// Used when auditing is switched off.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn record(&self, _event: AuditEvent) {}
}
