//! Provider lifecycle notifications.
//!
//! Two ways to observe: synchronous callbacks registered with `on`, and a
//! `broadcast` receiver from `subscribe`. Callbacks run on the emitting
//! task, so they should be quick.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;

use super::types::SandboxProviderEvent;

pub type ListenerId = u64;

type Listener = Arc<dyn Fn(&SandboxProviderEvent) + Send + Sync>;

pub struct EventBus {
    listeners: RwLock<Vec<(ListenerId, Listener)>>,
    next_id: AtomicU64,
    events_tx: broadcast::Sender<SandboxProviderEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (events_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            events_tx,
        }
    }

    pub fn on(&self, listener: impl Fn(&SandboxProviderEvent) + Send + Sync + 'static) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(|p| p.into_inner());
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SandboxProviderEvent> {
        self.events_tx.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().map(|l| l.len()).unwrap_or(0)
    }

    /// Deliver to every listener registered at the time of the call. A
    /// panicking listener is logged and does not affect the others.
    pub fn emit(&self, event: SandboxProviderEvent) {
        let snapshot: Vec<Listener> = self
            .listeners
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|(_, l)| l.clone())
            .collect();

        tracing::debug!(
            event = event.kind(),
            sandbox_id = %event.sandbox_id(),
            listeners = snapshot.len(),
            "emitting sandbox event"
        );

        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                tracing::error!(
                    event = event.kind(),
                    sandbox_id = %event.sandbox_id(),
                    "sandbox event listener panicked"
                );
            }
        }

        // No subscribers is not an error.
        let _ = self.events_tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
