//! Bounded readiness polling.
//!
//! Outcomes are kept distinct because each needs a different fix:
//! a pod that never leaves `Pending` (scheduling/quota) times out, a bad
//! image fails fast with `ImagePullBackoff`, and a pod that exits or
//! crash-loops fails fast with `CreationFailed`.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::backend::PodBackend;
use super::error::SandboxError;
use super::kube::models::Pod;

/// Time source for everything that waits or timestamps.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    async fn sleep(&self, duration: Duration);
}

/// Wall clock plus tokio timers.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// A clock that only moves when told to. `sleep` advances it instantly.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let delta = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
        if let Ok(mut now) = self.now.lock() {
            *now += delta;
        }
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|n| *n).unwrap_or_else(|p| *p.into_inner())
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}

const IMAGE_PULL_REASONS: &[&str] = &[
    "ImagePullBackOff",
    "ErrImagePull",
    "InvalidImageName",
    "ErrImageNeverPull",
];

/// Classification of a single observation of a pod.
#[derive(Debug)]
pub enum Readiness {
    Ready,
    /// Keep waiting; carries the phase for timeout diagnostics.
    NotYet(String),
    Failed(SandboxError),
}

/// Classify one pod observation.
pub fn evaluate(pod: &Pod) -> Readiness {
    let name = pod.metadata.name_or_empty().to_string();
    let status = match &pod.status {
        Some(s) => s,
        None => return Readiness::NotYet("Unknown".into()),
    };
    let phase = status.phase.clone().unwrap_or_else(|| "Unknown".into());

    if phase == "Failed" || phase == "Succeeded" {
        let detail = status
            .message
            .clone()
            .or_else(|| status.reason.clone())
            .unwrap_or_default();
        return Readiness::Failed(SandboxError::CreationFailed(format!(
            "pod {name} terminated with phase {phase}{}",
            if detail.is_empty() { String::new() } else { format!(": {detail}") }
        )));
    }

    for cs in &status.container_statuses {
        let waiting = cs.state.as_ref().and_then(|s| s.waiting.as_ref());
        let reason = waiting.and_then(|w| w.reason.as_deref());
        match reason {
            Some(r) if IMAGE_PULL_REASONS.contains(&r) => {
                let message = waiting.and_then(|w| w.message.clone());
                return Readiness::Failed(SandboxError::ImagePullBackoff {
                    pod: name,
                    reason: match message {
                        Some(m) => format!("{r}: {m}"),
                        None => r.to_string(),
                    },
                });
            }
            Some("CrashLoopBackOff") => {
                return Readiness::Failed(SandboxError::CreationFailed(format!(
                    "container {} in pod {name} is crash-looping",
                    cs.name
                )));
            }
            _ => {}
        }
    }

    let all_ready = !status.container_statuses.is_empty()
        && status.container_statuses.iter().all(|c| c.ready);
    if phase == "Running" && all_ready {
        Readiness::Ready
    } else {
        Readiness::NotYet(phase)
    }
}

/// Polls a pod until it is ready, fails, or the deadline passes.
///
/// Nothing is cleaned up on timeout; the pod is left as the backend has it.
pub struct ReadinessWaiter<'a> {
    backend: &'a dyn PodBackend,
    clock: &'a dyn Clock,
    timeout: Duration,
    interval: Duration,
}

impl<'a> ReadinessWaiter<'a> {
    pub fn new(
        backend: &'a dyn PodBackend,
        clock: &'a dyn Clock,
        timeout: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            backend,
            clock,
            timeout,
            interval,
        }
    }

    pub async fn wait(&self, namespace: &str, pod_name: &str) -> Result<Pod, SandboxError> {
        let started = self.clock.now();
        let deadline = started + chrono::Duration::from_std(self.timeout).unwrap_or(chrono::Duration::MAX);
        let mut last_phase = "Unknown".to_string();
        let mut polls: u32 = 0;

        loop {
            polls += 1;
            match self.backend.get_pod(namespace, pod_name).await {
                Ok(pod) => match evaluate(&pod) {
                    Readiness::Ready => {
                        tracing::info!(
                            pod = %pod_name,
                            polls,
                            elapsed_ms = (self.clock.now() - started).num_milliseconds(),
                            "pod is ready"
                        );
                        return Ok(pod);
                    }
                    Readiness::Failed(err) => {
                        tracing::warn!(pod = %pod_name, error = %err, "pod failed before becoming ready");
                        return Err(err);
                    }
                    Readiness::NotYet(phase) => {
                        tracing::debug!(pod = %pod_name, phase = %phase, "waiting for pod");
                        last_phase = phase;
                    }
                },
                Err(e) => {
                    tracing::debug!(pod = %pod_name, error = %e, "readiness poll failed, retrying");
                }
            }

            if self.clock.now() >= deadline {
                return Err(SandboxError::ReadinessTimeout {
                    pod: pod_name.to_string(),
                    timeout: self.timeout,
                    last_phase,
                });
            }
            self.clock.sleep(self.interval).await;
        }
    }
}
