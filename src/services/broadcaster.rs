use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use metrics::counter;

use crate::models::PositionEvent;

type Callback = Arc<dyn Fn(&PositionEvent) -> anyhow::Result<()> + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    listeners: RwLock<BTreeMap<u64, Callback>>,
}

impl Registry {
    fn remove(&self, id: u64) {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        listeners.remove(&id);
    }
}

/// Fan-out of position events to any number of listeners.
///
/// A listener that errors or panics is logged and skipped; delivery to the
/// others continues.
#[derive(Clone, Default)]
pub struct UpdateBroadcaster {
    registry: Arc<Registry>,
}

/// Handle returned by [`UpdateBroadcaster::subscribe`]. Dropping it
/// unsubscribes the listener.
#[must_use = "dropping the subscription unsubscribes the listener"]
pub struct Subscription {
    id: u64,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

impl UpdateBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&PositionEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        let mut listeners = self.registry.listeners.write().unwrap_or_else(|e| e.into_inner());
        listeners.insert(id, Arc::new(callback));
        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.listeners.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Deliver `event` to every listener; returns how many succeeded.
    pub fn publish(&self, event: &PositionEvent) -> usize {
        // Snapshot so listeners may (un)subscribe from inside a callback.
        let listeners: Vec<(u64, Callback)> = self
            .registry
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(id, cb)| (*id, cb.clone()))
            .collect();

        let mut delivered = 0;
        for (id, callback) in listeners {
            match catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    counter!("broadcast_failures_total").increment(1);
                    tracing::warn!(
                        subscriber = id,
                        position_id = %event.position.id,
                        error = %e,
                        "Position event listener failed"
                    );
                }
                Err(_) => {
                    counter!("broadcast_failures_total").increment(1);
                    tracing::error!(
                        subscriber = id,
                        position_id = %event.position.id,
                        "Position event listener panicked"
                    );
                }
            }
        }
        delivered
    }
}
