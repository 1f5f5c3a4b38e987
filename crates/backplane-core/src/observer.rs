//! Token-registered observer lists
//!
//! Every handler fan-out in the registry (update, presence, sensor, control,
//! FRU, hot-swap) is a `HandlerList`. Registration returns a token used for
//! removal; invocation iterates over a snapshot, so handlers may register or
//! remove handlers (including themselves) from inside a callback.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Removal token returned by `HandlerList::add`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

pub struct HandlerList<T: ?Sized> {
    next_id: AtomicU64,
    entries: Mutex<Vec<(HandlerId, Arc<T>)>>,
}

impl<T: ?Sized> HandlerList<T> {
    pub fn new() -> Self {
        Self { next_id: AtomicU64::new(1), entries: Mutex::new(Vec::new()) }
    }

    pub fn add(&self, handler: Arc<T>) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().unwrap().push((id, handler));
        id
    }

    /// Remove a handler by its token. Returns false if it was already gone.
    pub fn remove(&self, id: HandlerId) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|(hid, _)| *hid != id);
        entries.len() != before
    }

    /// Snapshot the current handlers for iteration outside the lock.
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.entries.lock().unwrap().iter().map(|(_, h)| h.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}

impl<T: ?Sized> Default for HandlerList<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    type Callback = dyn Fn() + Send + Sync;

    #[test]
    fn test_add_remove() {
        let list: HandlerList<Callback> = HandlerList::new();
        let id = list.add(Arc::new(|| {}));
        assert!(!list.is_empty());
        assert!(list.remove(id));
        assert!(!list.remove(id));
        assert!(list.is_empty());
    }

    #[test]
    fn test_handler_added_during_iteration_not_called_in_same_pass() {
        let list: Arc<HandlerList<Callback>> = Arc::new(HandlerList::new());
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let list2 = list.clone();
            let calls2 = calls.clone();
            list.add(Arc::new(move || {
                let calls3 = calls2.clone();
                list2.add(Arc::new(move || {
                    calls3.fetch_add(1, Ordering::Relaxed);
                }));
            }));
        }
        for h in list.snapshot() {
            h();
        }
        assert_eq!(calls.load(Ordering::Relaxed), 0);
        // The newly registered handler runs on the next pass.
        for h in list.snapshot() {
            h();
        }
        assert!(calls.load(Ordering::Relaxed) >= 1);
    }
}
