use crate::diagnostics::Diagnostics;
use crate::model::Snapshot;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

type Observer = dyn Fn(&Arc<Snapshot>) + Send + Sync;

/// Holds the latest accepted snapshot and fans it out to subscribers.
///
/// Cloning yields another handle onto the same store.
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    slot: Mutex<Slot>,
    observers: Mutex<Vec<(u64, Arc<Observer>)>>,
    next_id: AtomicU64,
    diagnostics: Arc<Diagnostics>,
}

#[derive(Default)]
struct Slot {
    snapshot: Option<Arc<Snapshot>>,
    // set once the current link session has delivered a snapshot
    fresh: bool,
}

/// Keeps an observer registered; dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    store: Weak<StoreInner>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        drop(self)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(store) = self.store.upgrade() {
            lock(&store.observers).retain(|(id, _)| *id != self.id);
        }
    }
}

impl StateStore {
    pub fn new(diagnostics: Arc<Diagnostics>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                slot: Mutex::new(Slot::default()),
                observers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                diagnostics,
            }),
        }
    }

    /// Last accepted snapshot, kept across disconnects.
    pub fn current(&self) -> Option<Arc<Snapshot>> {
        lock(&self.inner.slot).snapshot.clone()
    }

    /// Snapshot delivered during the current link session, if any yet.
    pub fn live(&self) -> Option<Arc<Snapshot>> {
        let slot = lock(&self.inner.slot);
        if slot.fresh {
            slot.snapshot.clone()
        } else {
            None
        }
    }

    pub fn subscribe<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&Arc<Snapshot>) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.observers).push((id, Arc::new(observer)));
        Subscription {
            id,
            store: Arc::downgrade(&self.inner),
        }
    }

    #[cfg(test)]
    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.observers).len()
    }

    pub(crate) fn begin_session(&self) {
        lock(&self.inner.slot).fresh = false;
    }

    /// The link went down; the retained snapshot stops being live.
    pub(crate) fn end_session(&self) {
        lock(&self.inner.slot).fresh = false;
    }

    pub(crate) fn publish(&self, snapshot: Snapshot) {
        let snapshot = Arc::new(snapshot);
        {
            let mut slot = lock(&self.inner.slot);
            if let Some(previous) = &slot.snapshot {
                if snapshot.regressed_from(previous) {
                    tracing::info!(
                        uptime = snapshot.system_uptime,
                        previous_uptime = previous.system_uptime,
                        "remote counters went backwards; controller restarted"
                    );
                    self.inner.diagnostics.remote_restarted();
                }
            }
            slot.snapshot = Some(snapshot.clone());
            slot.fresh = true;
        }

        // Observers run outside the locks so they may read the store.
        let observers: Vec<Arc<Observer>> = lock(&self.inner.observers)
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();
        for observer in observers {
            observer(&snapshot);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
