//! Pre-provisioned pods handed out to new sandboxes.
//!
//! Members are kept in memory, oldest first. The pool never holds its lock
//! across a backend call: slots are reserved under the lock and the pods are
//! created afterwards.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::audit::{AuditEvent, AuditSink};
use super::backend::PodBackend;
use super::error::{BackendError, SandboxError};
use super::pod_spec::{LABEL_POOL, LABEL_SANDBOX_ID, POOL_WARM, PodSpecBuilder, managed_selector, warm_pod_name};
use super::readiness::{Clock, Readiness, evaluate};
use super::security::PodSecurityValidator;
use super::types::{ProviderConfig, SandboxId, WarmPoolMetrics};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarmPodState {
    Warm,
    Allocated,
    Draining,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WarmPod {
    /// Id the pod was labelled with at creation. Becomes the sandbox id.
    pub sandbox_id: SandboxId,
    pub pod_name: String,
    pub pod_uid: Option<String>,
    pub state: WarmPodState,
    pub created_at: DateTime<Utc>,
    pub allocated_at: Option<DateTime<Utc>>,
    pub project_id: Option<String>,
}

#[async_trait]
pub trait WarmPoolController: Send + Sync {
    /// Create up to `count` pods, never exceeding the pool's maximum.
    /// Returns how many were created.
    async fn prewarm(&self, count: usize) -> Result<usize, SandboxError>;

    /// Hand out the oldest ready member, or `None` if there is none.
    async fn get_warm(&self, project_id: &str) -> Option<WarmPod>;

    /// Take a member out of service and delete its pod. Best-effort.
    async fn release(&self, pod_name: &str);

    /// Stop tracking a member handed out by `get_warm`. Its pod now
    /// belongs to a sandbox and is cleaned up with it.
    async fn forget(&self, pod_name: &str);

    async fn metrics(&self) -> WarmPoolMetrics;

    /// Delete every unallocated member. Returns how many were removed.
    async fn drain(&self) -> usize;

    /// Sync members with the cluster (forget vanished pods, adopt untracked
    /// warm ones) and, with autoscale on, top the pool back up to its
    /// minimum. Returns how many pods were created.
    async fn maintain(&self) -> Result<usize, SandboxError>;
}

#[derive(Default)]
struct Members {
    pods: Vec<WarmPod>,
    /// Slots reserved by an in-flight `prewarm`.
    reserved: usize,
}

impl Members {
    fn warm(&self) -> usize {
        self.count(WarmPodState::Warm)
    }

    fn count(&self, state: WarmPodState) -> usize {
        self.pods.iter().filter(|p| p.state == state).count()
    }

    fn get_mut(&mut self, pod_name: &str) -> Option<&mut WarmPod> {
        self.pods.iter_mut().find(|p| p.pod_name == pod_name)
    }

    fn remove(&mut self, pod_name: &str) {
        self.pods.retain(|p| p.pod_name != pod_name);
    }
}

/// In-process warm pool backed by real pods.
pub struct PodWarmPool {
    backend: Arc<dyn PodBackend>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
    validator: Arc<dyn PodSecurityValidator>,
    config: ProviderConfig,
    members: Mutex<Members>,
    hits: AtomicU64,
    misses: AtomicU64,
    allocation_ms_total: AtomicU64,
}

impl PodWarmPool {
    pub fn new(
        backend: Arc<dyn PodBackend>,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
        validator: Arc<dyn PodSecurityValidator>,
        config: ProviderConfig,
    ) -> Self {
        Self {
            backend,
            clock,
            audit,
            validator,
            config,
            members: Mutex::new(Members::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            allocation_ms_total: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Members> {
        self.members.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Snapshot of every tracked member.
    pub fn members(&self) -> Vec<WarmPod> {
        self.lock().pods.clone()
    }

    fn namespace(&self) -> &str {
        &self.config.namespace
    }

    async fn create_one(&self) -> Result<WarmPod, SandboxError> {
        let id = Uuid::new_v4().to_string();
        let name = warm_pod_name(&id);
        let manifest = PodSpecBuilder::new(&self.config).build_warm(&id, &name);

        let validation = self.validator.validate(&manifest);
        if !validation.valid {
            self.audit.record(AuditEvent::SecurityViolation {
                project_id: String::new(),
                pod: name,
                violations: validation.violations.clone(),
            });
            return Err(SandboxError::SecurityViolation {
                violations: validation.violations,
            });
        }

        let created = self
            .backend
            .create_pod(self.namespace(), &manifest)
            .await
            .map_err(|e| SandboxError::CreationFailed(format!("warm pool: {e}")))?;
        self.audit.record(AuditEvent::PodCreated {
            sandbox_id: id.clone(),
            project_id: String::new(),
            pod: name.clone(),
            image: self.config.default_image.clone(),
        });
        Ok(WarmPod {
            sandbox_id: id,
            pod_name: name,
            pod_uid: created.metadata.uid,
            state: WarmPodState::Warm,
            created_at: created
                .metadata
                .creation_timestamp
                .unwrap_or_else(|| self.clock.now()),
            allocated_at: None,
            project_id: None,
        })
    }

    /// Delete a member's pod. The member is dropped once the pod is gone and
    /// left `Draining` if the delete fails.
    async fn delete_member(&self, pod_name: &str) -> bool {
        let sandbox_id = {
            let mut members = self.lock();
            match members.get_mut(pod_name) {
                Some(member) => {
                    member.state = WarmPodState::Draining;
                    member.sandbox_id.clone()
                }
                None => String::new(),
            }
        };

        match self.backend.delete_pod(self.namespace(), pod_name).await {
            Ok(()) | Err(BackendError::NotFound(_)) => {
                self.lock().remove(pod_name);
                self.audit.record(AuditEvent::PodDeleted {
                    sandbox_id,
                    pod: pod_name.to_string(),
                });
                true
            }
            Err(e) => {
                tracing::warn!(pod = %pod_name, error = %e, "failed to delete warm pod");
                false
            }
        }
    }

    /// Oldest `Warm` member not in `skip`, moved to `Allocated`.
    fn claim_oldest(&self, project_id: &str, skip: &BTreeSet<String>) -> Option<WarmPod> {
        let now = self.clock.now();
        let mut members = self.lock();
        let member = members
            .pods
            .iter_mut()
            .filter(|p| p.state == WarmPodState::Warm && !skip.contains(&p.pod_name))
            .min_by_key(|p| p.created_at)?;
        member.state = WarmPodState::Allocated;
        member.allocated_at = Some(now);
        member.project_id = Some(project_id.to_string());
        Some(member.clone())
    }

    fn unclaim(&self, pod_name: &str) {
        if let Some(member) = self.lock().get_mut(pod_name) {
            member.state = WarmPodState::Warm;
            member.allocated_at = None;
            member.project_id = None;
        }
    }
}

#[async_trait]
impl WarmPoolController for PodWarmPool {
    async fn prewarm(&self, count: usize) -> Result<usize, SandboxError> {
        let wanted = {
            let mut members = self.lock();
            let current = members.warm() + members.reserved;
            let n = count.min(self.config.warm_pool.max_size.saturating_sub(current));
            members.reserved += n;
            n
        };
        if wanted == 0 {
            return Ok(0);
        }

        let mut created = 0;
        let mut last_error = None;
        let mut remaining = wanted;
        while remaining > 0 {
            let result = self.create_one().await;
            let mut members = self.lock();
            members.reserved -= 1;
            remaining -= 1;
            match result {
                Ok(pod) => {
                    tracing::debug!(pod = %pod.pod_name, "warm pod created");
                    members.pods.push(pod);
                    created += 1;
                }
                Err(e @ SandboxError::SecurityViolation { .. }) => {
                    // Every warm pod has the same spec; the rest would fail too.
                    tracing::error!(error = %e, "warm pod spec rejected");
                    members.reserved -= remaining;
                    remaining = 0;
                    last_error = Some(e);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to create warm pod");
                    last_error = Some(e);
                }
            }
        }

        tracing::info!(requested = count, created, "prewarmed sandbox pods");
        match last_error {
            Some(e) if created == 0 => Err(e),
            _ => Ok(created),
        }
    }

    async fn get_warm(&self, project_id: &str) -> Option<WarmPod> {
        let started = self.clock.now();
        let mut skipped = BTreeSet::new();

        while let Some(member) = self.claim_oldest(project_id, &skipped) {
            match self.backend.get_pod(self.namespace(), &member.pod_name).await {
                Ok(pod) => match evaluate(&pod) {
                    Readiness::Ready => {
                        let ms = (self.clock.now() - started).num_milliseconds().max(0) as u64;
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        self.allocation_ms_total.fetch_add(ms, Ordering::Relaxed);
                        tracing::info!(
                            pod = %member.pod_name,
                            project_id = %project_id,
                            allocation_ms = ms,
                            "allocated warm pod"
                        );
                        return Some(member);
                    }
                    Readiness::NotYet(reason) => {
                        tracing::debug!(pod = %member.pod_name, reason = %reason, "warm pod not ready yet");
                        self.unclaim(&member.pod_name);
                        skipped.insert(member.pod_name);
                    }
                    Readiness::Failed(e) => {
                        tracing::warn!(pod = %member.pod_name, error = %e, "discarding failed warm pod");
                        self.delete_member(&member.pod_name).await;
                    }
                },
                Err(BackendError::NotFound(_)) => {
                    tracing::warn!(pod = %member.pod_name, "warm pod disappeared");
                    self.lock().remove(&member.pod_name);
                }
                Err(e) => {
                    tracing::debug!(pod = %member.pod_name, error = %e, "could not check warm pod");
                    self.unclaim(&member.pod_name);
                    skipped.insert(member.pod_name);
                }
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(project_id = %project_id, "warm pool miss");
        None
    }

    async fn release(&self, pod_name: &str) {
        tracing::info!(pod = %pod_name, "releasing warm pod");
        self.delete_member(pod_name).await;
    }

    async fn forget(&self, pod_name: &str) {
        self.lock().remove(pod_name);
        tracing::debug!(pod = %pod_name, "warm pod handed over to its sandbox");
    }

    async fn metrics(&self) -> WarmPoolMetrics {
        let (warm, allocated, draining) = {
            let members = self.lock();
            (
                members.warm(),
                members.count(WarmPodState::Allocated),
                members.count(WarmPodState::Draining),
            )
        };
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        WarmPoolMetrics {
            warm,
            allocated,
            draining,
            hits,
            misses,
            hit_rate_percent: if total == 0 {
                0.0
            } else {
                hits as f64 * 100.0 / total as f64
            },
            avg_allocation_ms: if hits == 0 {
                0.0
            } else {
                self.allocation_ms_total.load(Ordering::Relaxed) as f64 / hits as f64
            },
        }
    }

    async fn drain(&self) -> usize {
        let names: Vec<String> = {
            let mut members = self.lock();
            members
                .pods
                .iter_mut()
                .filter(|p| p.state != WarmPodState::Allocated)
                .map(|p| {
                    p.state = WarmPodState::Draining;
                    p.pod_name.clone()
                })
                .collect()
        };

        let mut removed = 0;
        for name in &names {
            if self.delete_member(name).await {
                removed += 1;
            }
        }
        tracing::info!(removed, "drained warm pool");
        removed
    }

    async fn maintain(&self) -> Result<usize, SandboxError> {
        // Members added while the listing is in flight are not in it.
        let known: BTreeSet<String> = self.lock().pods.iter().map(|p| p.pod_name.clone()).collect();
        match self.backend.list_pods(self.namespace(), &managed_selector()).await {
            Ok(pods) => {
                let now = self.clock.now();
                let live: BTreeSet<&str> = pods.iter().filter_map(|p| p.metadata.name.as_deref()).collect();
                let mut members = self.lock();
                let before = members.pods.len();
                members
                    .pods
                    .retain(|p| live.contains(p.pod_name.as_str()) || !known.contains(&p.pod_name));
                let gone = before - members.pods.len();

                let mut adopted = 0;
                for pod in pods.iter().filter(|p| p.label(LABEL_POOL) == Some(POOL_WARM) && !p.is_terminating()) {
                    let (Some(name), Some(id)) = (pod.metadata.name.as_deref(), pod.label(LABEL_SANDBOX_ID)) else {
                        continue;
                    };
                    if members.pods.iter().any(|m| m.pod_name == name) {
                        continue;
                    }
                    members.pods.push(WarmPod {
                        sandbox_id: id.to_string(),
                        pod_name: name.to_string(),
                        pod_uid: pod.metadata.uid.clone(),
                        state: WarmPodState::Warm,
                        created_at: pod.metadata.creation_timestamp.unwrap_or(now),
                        allocated_at: None,
                        project_id: None,
                    });
                    adopted += 1;
                }
                if gone > 0 || adopted > 0 {
                    tracing::debug!(gone, adopted, "reconciled warm pool with the cluster");
                }
            }
            Err(e) => tracing::warn!(error = %e, "could not reconcile warm pool"),
        }

        if !self.config.warm_pool.autoscale {
            return Ok(0);
        }
        let missing = {
            let members = self.lock();
            self.config
                .warm_pool
                .min_size
                .saturating_sub(members.warm() + members.reserved)
        };
        if missing == 0 {
            return Ok(0);
        }
        self.prewarm(missing).await
    }
}
