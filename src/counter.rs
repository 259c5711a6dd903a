//! Shared count of active client sessions.
//!
//! The counter is the single point of truth for admission decisions. Every
//! read and every update goes through the same mutex, so increments from
//! the acceptor and decrements from session tasks are serialized.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OwnedSemaphorePermit;
use tracing::{trace, warn};

/// Number of live sessions, bounded by `max_clients`.
#[derive(Debug)]
pub struct SessionCounter {
    active: Mutex<usize>,
    max_clients: usize,
}

impl SessionCounter {
    /// Create a counter starting at zero.
    pub fn new(max_clients: usize) -> Arc<Self> {
        Arc::new(Self {
            active: Mutex::new(0),
            max_clients,
        })
    }

    // A poisoned lock still holds a valid integer.
    fn lock(&self) -> MutexGuard<'_, usize> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a newly admitted session. Returns the new count.
    pub fn increment(&self) -> usize {
        let mut active = self.lock();
        *active += 1;
        trace!(active = *active, "Session counter incremented");
        *active
    }

    /// Record a finished session. Returns the new count.
    pub fn decrement(&self) -> usize {
        let mut active = self.lock();
        if *active == 0 {
            warn!("Session counter decremented below zero, ignoring");
            return 0;
        }
        *active -= 1;
        trace!(active = *active, "Session counter decremented");
        *active
    }

    /// Current number of active sessions.
    pub fn snapshot(&self) -> usize {
        *self.lock()
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    /// Whether another session may be admitted right now.
    pub fn has_capacity(&self) -> bool {
        self.snapshot() < self.max_clients
    }
}

/// Ownership of one admitted session's place in the counter.
///
/// Dropping the slot decrements the counter exactly once and, when the
/// semaphore gate is in use, hands the permit back. Every exit path of a
/// session handler releases its slot this way.
#[derive(Debug)]
pub struct SessionSlot {
    counter: Arc<SessionCounter>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl SessionSlot {
    /// Increment the counter and take ownership of the resulting slot.
    pub(crate) fn acquire(
        counter: Arc<SessionCounter>,
        permit: Option<OwnedSemaphorePermit>,
    ) -> (Self, usize) {
        let active = counter.increment();
        (
            Self {
                counter,
                _permit: permit,
            },
            active,
        )
    }
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        // Decrement before the permit field drops so a waiting acceptor
        // never observes a freed permit alongside a stale count.
        self.counter.decrement();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_increment_decrement_snapshot() {
        let counter = SessionCounter::new(5);
        assert_eq!(counter.snapshot(), 0);
        assert_eq!(counter.increment(), 1);
        assert_eq!(counter.increment(), 2);
        assert_eq!(counter.decrement(), 1);
        assert_eq!(counter.snapshot(), 1);
        assert_eq!(counter.max_clients(), 5);
    }

    #[test]
    fn test_decrement_never_underflows() {
        let counter = SessionCounter::new(1);
        assert_eq!(counter.decrement(), 0);
        assert_eq!(counter.snapshot(), 0);
    }

    #[test]
    fn test_has_capacity() {
        let counter = SessionCounter::new(2);
        assert!(counter.has_capacity());
        counter.increment();
        counter.increment();
        assert!(!counter.has_capacity());
        counter.decrement();
        assert!(counter.has_capacity());
    }

    #[test]
    fn test_slot_releases_on_drop() {
        let counter = SessionCounter::new(3);
        let (slot, active) = SessionSlot::acquire(Arc::clone(&counter), None);
        assert_eq!(active, 1);
        assert_eq!(counter.snapshot(), 1);

        drop(slot);
        assert_eq!(counter.snapshot(), 0);
    }

    #[test]
    fn test_slot_released_when_thread_panics() {
        let counter = SessionCounter::new(1);
        let shared = Arc::clone(&counter);

        let result = thread::spawn(move || {
            let (_slot, _) = SessionSlot::acquire(shared, None);
            panic!("handler failed");
        })
        .join();

        assert!(result.is_err());
        assert_eq!(counter.snapshot(), 0);
    }

    #[test]
    fn test_concurrent_updates_balance() {
        let counter = SessionCounter::new(64);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        counter.increment();
                        counter.decrement();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(counter.snapshot(), 0);
    }
}
