//! Keeps handlers alive while an operation still intends to call them.
//!
//! Once a connection is open its handler is owned by the connection state and
//! the registry is out of the picture. Until then something has to hold it:
//! a listening socket needs its factory for every accept, and an in-flight
//! `connect` needs its handler to either attach it or report the failure.
//!
//! ```text
//!   listen  ──> Listener(factory) ─────────── released when the listener is destroyed
//!   connect ──> Connect(handler, deadline) ── taken on success (moved into the connection)
//!                                             or on failure (on_closed fires, then dropped)
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::event::SocketId;
use crate::handler::{BoxedHandler, HandlerFactory};

enum Entry {
    Listener(Arc<dyn HandlerFactory>),
    Connect {
        handler: BoxedHandler,
        deadline: Instant,
        /// Set once the deadline has been reported.
        expiring: bool,
    },
}

#[derive(Default)]
pub struct HandlerRegistry {
    entries: Mutex<HashMap<SocketId, Entry>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retains `factory` for the lifetime of the listening socket `id`.
    pub fn retain_factory(&self, id: SocketId, factory: Arc<dyn HandlerFactory>) {
        self.entries.lock().insert(id, Entry::Listener(factory));
    }

    /// Returns the factory of listener `id`, if it is still registered.
    pub fn factory(&self, id: SocketId) -> Option<Arc<dyn HandlerFactory>> {
        match self.entries.lock().get(&id) {
            Some(Entry::Listener(factory)) => Some(factory.clone()),
            _ => None,
        }
    }

    /// Retains the handler of an in-flight connect until `deadline`.
    pub fn retain_pending(&self, id: SocketId, handler: BoxedHandler, deadline: Instant) {
        self.entries
            .lock()
            .insert(
                id,
                Entry::Connect {
                    handler,
                    deadline,
                    expiring: false,
                },
            );
    }

    /// Takes the handler of a pending connect, resolving it.
    ///
    /// Returns `None` if the connect was already resolved, so a connect
    /// outcome can only ever be reported once.
    pub fn take_pending(&self, id: SocketId) -> Option<BoxedHandler> {
        let mut entries = self.entries.lock();
        match entries.remove(&id) {
            Some(Entry::Connect { handler, .. }) => Some(handler),
            Some(other) => {
                entries.insert(id, other);
                None
            }
            None => None,
        }
    }

    /// Pending connects whose deadline is at or before `now`.
    ///
    /// Each connect is reported by at most one call; the handler itself stays
    /// here until [`take_pending`](Self::take_pending) claims it.
    pub fn expired(&self, now: Instant) -> Vec<SocketId> {
        self.entries
            .lock()
            .iter_mut()
            .filter_map(|(id, entry)| match entry {
                Entry::Connect {
                    deadline, expiring, ..
                } if !*expiring && *deadline <= now => {
                    *expiring = true;
                    Some(*id)
                }
                _ => None,
            })
            .collect()
    }

    /// Ids of every pending connect.
    pub fn pending_ids(&self) -> Vec<SocketId> {
        self.entries
            .lock()
            .iter()
            .filter_map(|(id, entry)| match entry {
                Entry::Connect { .. } => Some(*id),
                Entry::Listener(_) => None,
            })
            .collect()
    }

    /// Drops whatever is registered under `id`.
    pub fn release(&self, id: SocketId) -> bool {
        self.entries.lock().remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::ConnectionHandler;
    use std::time::Duration;

    struct Quiet;
    impl ConnectionHandler for Quiet {}

    #[test]
    fn test_factory_retained_until_released() {
        let registry = HandlerRegistry::new();
        registry.retain_factory(SocketId(1), Arc::new(|| Some(Quiet)));

        assert!(registry.factory(SocketId(1)).is_some());
        assert!(registry.factory(SocketId(1)).is_some());
        assert!(registry.release(SocketId(1)));
        assert!(registry.factory(SocketId(1)).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_pending_taken_once() {
        let registry = HandlerRegistry::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        registry.retain_pending(SocketId(2), Box::new(Quiet), deadline);

        assert!(registry.take_pending(SocketId(2)).is_some());
        assert!(registry.take_pending(SocketId(2)).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_take_pending_leaves_listeners_alone() {
        let registry = HandlerRegistry::new();
        registry.retain_factory(SocketId(3), Arc::new(|| Some(Quiet)));

        assert!(registry.take_pending(SocketId(3)).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_expired_only_reports_overdue_connects() {
        let registry = HandlerRegistry::new();
        let now = Instant::now();
        registry.retain_pending(SocketId(4), Box::new(Quiet), now);
        registry.retain_pending(SocketId(5), Box::new(Quiet), now + Duration::from_secs(60));
        registry.retain_factory(SocketId(6), Arc::new(|| Some(Quiet)));

        assert_eq!(registry.expired(now), vec![SocketId(4)]);
        let mut pending = registry.pending_ids();
        pending.sort();
        assert_eq!(pending, vec![SocketId(4), SocketId(5)]);
    }

    #[test]
    fn test_expired_reports_each_deadline_once() {
        let registry = HandlerRegistry::new();
        let now = Instant::now();
        registry.retain_pending(SocketId(7), Box::new(Quiet), now);

        assert_eq!(registry.expired(now), vec![SocketId(7)]);
        assert!(registry.expired(now + Duration::from_secs(1)).is_empty());

        // Still claimable by whichever task resolves the connect.
        assert!(registry.take_pending(SocketId(7)).is_some());
        assert!(registry.is_empty());
    }
}
