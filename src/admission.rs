//! Admission control for new client sessions.
//!
//! The acceptor asks the gate for a [`Reservation`] before it calls
//! `accept`. A reservation only exists while there is room for one more
//! session, so connections beyond the limit stay in the kernel backlog
//! instead of being refused.
//!
//! Two gates are available:
//! - `Semaphore`: waits on a permit sized to `max_clients`; wakes as soon as
//!   a session ends.
//! - `Polling`: re-reads the session counter every `backoff` while it is at
//!   the limit.

use crate::config::AdmissionMode;
use crate::counter::{SessionCounter, SessionSlot};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// Decides when the acceptor may take another connection.
pub struct AdmissionGate {
    counter: Arc<SessionCounter>,
    mode: GateMode,
}

enum GateMode {
    Semaphore(Arc<Semaphore>),
    Polling { backoff: Duration },
}

impl AdmissionGate {
    /// Create a gate of the given kind over `counter`.
    pub fn new(mode: AdmissionMode, counter: Arc<SessionCounter>, backoff: Duration) -> Self {
        let mode = match mode {
            AdmissionMode::Semaphore => {
                GateMode::Semaphore(Arc::new(Semaphore::new(counter.max_clients())))
            }
            AdmissionMode::Polling => GateMode::Polling { backoff },
        };
        Self { counter, mode }
    }

    pub fn mode(&self) -> AdmissionMode {
        match self.mode {
            GateMode::Semaphore(_) => AdmissionMode::Semaphore,
            GateMode::Polling { .. } => AdmissionMode::Polling,
        }
    }

    /// Wait until a session may be admitted.
    pub async fn reserve(&self) -> Reservation {
        match &self.mode {
            GateMode::Semaphore(semaphore) => {
                if semaphore.available_permits() == 0 {
                    debug!(
                        max_clients = self.counter.max_clients(),
                        "Max clients reached, waiting for a slot"
                    );
                }
                // The semaphore is owned by the gate and never closed.
                let permit = Arc::clone(semaphore).acquire_owned().await.ok();
                Reservation {
                    counter: Arc::clone(&self.counter),
                    permit,
                }
            }
            GateMode::Polling { backoff } => {
                while !self.counter.has_capacity() {
                    warn!(
                        active = self.counter.snapshot(),
                        max_clients = self.counter.max_clients(),
                        "Max clients reached, waiting for a slot"
                    );
                    tokio::time::sleep(*backoff).await;
                }
                Reservation {
                    counter: Arc::clone(&self.counter),
                    permit: None,
                }
            }
        }
    }
}

/// Room for one session, held across a single `accept` call.
///
/// Dropping a reservation without admitting (the accept failed) gives the
/// room back without touching the counter.
#[derive(Debug)]
pub struct Reservation {
    counter: Arc<SessionCounter>,
    permit: Option<OwnedSemaphorePermit>,
}

impl Reservation {
    /// Count the accepted connection as active. Returns the slot that the
    /// session handler must own, and the new active count.
    pub fn admit(self) -> (SessionSlot, usize) {
        SessionSlot::acquire(self.counter, self.permit)
    }
}
