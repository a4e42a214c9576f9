//! Single-flight FIFO admission for one session.
//!
//! Only the holder of a [`QueuePermit`] may touch the session's channel.
//! Waiting operations hold nothing but a ticket, so they never consume a
//! nonce index. Dropping an [`Admission`] at any point (before or after it
//! was granted) leaves the queue consistent: a grant that raced with the drop
//! is passed on to the next waiter.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::error::SessionError;

/// Position of an operation in a session queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ticket(u64);

impl Ticket {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct Waiter {
    ticket: Ticket,
    grant: oneshot::Sender<()>,
}

#[derive(Default)]
struct QueueState {
    in_flight: Option<Ticket>,
    waiting: VecDeque<Waiter>,
    next_ticket: u64,
    closed: bool,
}

impl QueueState {
    fn grant_next(&mut self) {
        while let Some(waiter) = self.waiting.pop_front() {
            if waiter.grant.send(()).is_ok() {
                trace!(ticket = %waiter.ticket, "queue permit granted");
                self.in_flight = Some(waiter.ticket);
                return;
            }
        }
        self.in_flight = None;
    }

    fn release(&mut self, ticket: Ticket) {
        if self.in_flight == Some(ticket) {
            self.in_flight = None;
            self.grant_next();
        }
    }
}

/// FIFO single-flight queue.
#[derive(Clone, Default)]
pub struct RequestQueue {
    state: Arc<Mutex<QueueState>>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Join the queue. The returned admission resolves when it reaches the head.
    pub fn enqueue(&self) -> Admission {
        let mut state = self.lock();
        let ticket = Ticket(state.next_ticket);
        state.next_ticket += 1;

        if state.closed {
            return Admission {
                ticket,
                state: Arc::clone(&self.state),
                stage: Stage::Rejected,
            };
        }

        if state.in_flight.is_none() && state.waiting.is_empty() {
            state.in_flight = Some(ticket);
            debug!(%ticket, "queue admitted immediately");
            return Admission {
                ticket,
                state: Arc::clone(&self.state),
                stage: Stage::Granted,
            };
        }

        let (grant, rx) = oneshot::channel();
        state.waiting.push_back(Waiter { ticket, grant });
        debug!(%ticket, depth = state.waiting.len(), "queued behind in-flight operation");
        Admission {
            ticket,
            state: Arc::clone(&self.state),
            stage: Stage::Waiting(rx),
        }
    }

    /// Remove a queued operation. Returns false if it is in flight or gone.
    pub fn cancel(&self, ticket: Ticket) -> bool {
        let mut state = self.lock();
        let before = state.waiting.len();
        state.waiting.retain(|w| w.ticket != ticket);
        let removed = state.waiting.len() != before;
        if removed {
            debug!(%ticket, "queued operation cancelled");
        }
        removed
    }

    /// Refuse new admissions and cancel every waiter. The in-flight permit stays valid.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        let dropped = state.waiting.len();
        state.waiting.clear();
        if dropped > 0 {
            debug!(dropped, "queue closed with waiters");
        }
    }

    /// Operations waiting behind the head.
    pub fn depth(&self) -> usize {
        self.lock().waiting.len()
    }

    pub fn in_flight(&self) -> Option<Ticket> {
        self.lock().in_flight
    }
}

impl fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("RequestQueue")
            .field("in_flight", &state.in_flight)
            .field("depth", &state.waiting.len())
            .field("closed", &state.closed)
            .finish()
    }
}

enum Stage {
    Waiting(oneshot::Receiver<()>),
    Granted,
    Rejected,
    Done,
}

/// A place in the queue.
pub struct Admission {
    ticket: Ticket,
    state: Arc<Mutex<QueueState>>,
    stage: Stage,
}

impl Admission {
    pub fn ticket(&self) -> Ticket {
        self.ticket
    }

    /// Wait until this operation is at the head of the queue.
    ///
    /// Fails with `Cancelled` if the ticket was cancelled or the queue closed.
    pub async fn ready(mut self) -> Result<QueuePermit, SessionError> {
        match std::mem::replace(&mut self.stage, Stage::Done) {
            Stage::Granted => {}
            Stage::Waiting(rx) => {
                // Any stage but Done makes Drop clean up if this future is dropped mid-wait.
                self.stage = Stage::Granted;
                if rx.await.is_err() {
                    self.stage = Stage::Done;
                    return Err(SessionError::Cancelled);
                }
            }
            Stage::Rejected | Stage::Done => return Err(SessionError::Cancelled),
        }
        self.stage = Stage::Done;
        Ok(QueuePermit {
            ticket: self.ticket,
            state: Arc::clone(&self.state),
        })
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        if matches!(self.stage, Stage::Done | Stage::Rejected) {
            return;
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let ticket = self.ticket;
        if state.in_flight == Some(ticket) {
            trace!(%ticket, "admission dropped after grant, passing permit on");
            state.release(ticket);
        } else {
            state.waiting.retain(|w| w.ticket != ticket);
            trace!(%ticket, "admission abandoned");
        }
    }
}

/// Exclusive right to use the session channel. Released on drop.
pub struct QueuePermit {
    ticket: Ticket,
    state: Arc<Mutex<QueueState>>,
}

impl QueuePermit {
    pub fn ticket(&self) -> Ticket {
        self.ticket
    }
}

impl Drop for QueuePermit {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        trace!(ticket = %self.ticket, "queue permit released");
        state.release(self.ticket);
    }
}

impl fmt::Debug for QueuePermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueuePermit({})", self.ticket)
    }
}
