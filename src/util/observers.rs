use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Identifies a registration in [Observers], for unsubscribing
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// A registry of event handlers of one kind. Any number of handlers can be registered
///  independently of each other.
///
/// Handlers are never called while the registry's lock is held, so a handler may (un)subscribe
///  handlers itself.
pub struct Observers<H: ?Sized> {
    next_id: AtomicU64,
    handlers: RwLock<Vec<(SubscriptionId, Arc<H>)>>,
}

impl <H: ?Sized> Default for Observers<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl <H: ?Sized> Observers<H> {
    pub fn new() -> Observers<H> {
        Observers {
            next_id: AtomicU64::new(0),
            handlers: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, handler: Arc<H>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().unwrap()
            .push((id, handler));
        id
    }

    /// returns `false` if there was no registration for the id
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write().unwrap();
        let len_before = handlers.len();
        handlers.retain(|(registered, _)| *registered != id);
        handlers.len() != len_before
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.handlers.read().unwrap().len()
    }

    /// The handlers registered at the time of the call, in registration order
    pub fn snapshot(&self) -> Vec<Arc<H>> {
        self.handlers.read().unwrap()
            .iter()
            .map(|(_, h)| h.clone())
            .collect()
    }
}
