//! Multi-subscriber event used for disconnect notifications.
//!
//! Publishing snapshots the subscriber list and releases the lock before invoking
//! anything, so listeners may subscribe or unsubscribe (themselves or others) while
//! an event is being delivered. Changes take effect from the next publish.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::utils::lock;

/// Handle returned by [`Event::subscribe`], used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Id for a listener that was invoked immediately and never stored
    pub(crate) fn detached() -> Self {
        Self(u64::MAX)
    }
}

pub(crate) type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Thread-safe list of callbacks for values of type `T`
pub struct Event<T> {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, Callback<T>)>>,
}

impl<T> Event<T> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.listeners).push((id, Arc::new(listener)));
        id
    }

    /// Returns false if the listener was already removed or drained
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.listeners);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Deliver `value` to a snapshot of the current listeners
    pub fn publish(&self, value: &T) -> usize {
        let snapshot: Vec<Callback<T>> = lock(&self.listeners)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in &snapshot {
            listener(value);
        }
        snapshot.len()
    }

    /// Remove every listener and hand them back for a one-shot delivery
    pub(crate) fn drain(&self) -> Vec<Callback<T>> {
        std::mem::take(&mut *lock(&self.listeners))
            .into_iter()
            .map(|(_, listener)| listener)
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.listeners).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for Event<T> {
    fn default() -> Self {
        Self::new()
    }
}
