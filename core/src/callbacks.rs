//! Listener registry for breaker and connection events

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Shared listener callback
pub type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Handle returned by [`Listeners::subscribe`], used to remove the listener again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// Ordered set of listeners for one event type.
///
/// Listeners are invoked in subscription order on the emitting thread. The list is
/// snapshotted before dispatch, so a listener may subscribe or unsubscribe others
/// without deadlocking.
pub struct Listeners<E> {
    next_id: AtomicU64,
    entries: RwLock<Vec<(ListenerId, Listener<E>)>>,
}

impl<E> Listeners<E> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        id
    }

    /// Returns `false` if the id was unknown (already removed or destroyed).
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    /// Drop every listener.
    pub fn destroy(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Listener<E>> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in snapshot {
            listener(event);
        }
    }
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for Listeners<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_emit_in_subscription_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let listeners = Listeners::<u32>::new();

        let a = Arc::clone(&seen);
        listeners.subscribe(move |n| a.lock().unwrap().push(format!("a{n}")));
        let b = Arc::clone(&seen);
        listeners.subscribe(move |n| b.lock().unwrap().push(format!("b{n}")));

        listeners.emit(&7);

        assert_eq!(*seen.lock().unwrap(), vec!["a7", "b7"]);
    }

    #[test]
    fn test_unsubscribe_and_destroy() {
        let hits = Arc::new(AtomicU64::new(0));
        let listeners = Listeners::<()>::new();

        let h = Arc::clone(&hits);
        let first = listeners.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        let h = Arc::clone(&hits);
        listeners.subscribe(move |_| {
            h.fetch_add(10, Ordering::SeqCst);
        });

        assert!(listeners.unsubscribe(first));
        assert!(!listeners.unsubscribe(first));
        listeners.emit(&());
        assert_eq!(hits.load(Ordering::SeqCst), 10);

        listeners.destroy();
        assert!(listeners.is_empty());
        listeners.emit(&());
        assert_eq!(hits.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_listener_can_unsubscribe_during_emit() {
        let listeners = Arc::new(Listeners::<()>::new());
        let inner = Arc::clone(&listeners);
        listeners.subscribe(move |_| inner.destroy());

        listeners.emit(&());
        assert!(listeners.is_empty());
    }
}
