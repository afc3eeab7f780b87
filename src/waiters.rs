//! The FIFO queue of acquirers parked while the pool is saturated.
//!
//! Ordering is a hard contract: a released connection goes to the head
//! waiter, never to a newer one, unless the older waiter already timed
//! out or went away. The timeout/hand-off race is decided under the
//! pool's lock: exactly one of [`WaiterQueue::cancel`] and a hand-off
//! succeeds for any given waiter.

use std::collections::VecDeque;
use std::fmt;

use tokio::sync::oneshot::{self, Receiver, Sender};
use tracing::trace;

use crate::conn::Connect;
use crate::pool::Pooled;

/// Message delivered to a parked acquirer.
pub(crate) enum HandOff<M: Connect> {
    /// A leased connection, ready to use.
    Lease(Pooled<M>),
    /// Capacity freed without a connection to pass along; the recipient
    /// re-runs the acquire decision.
    Retry,
}

impl<M: Connect> fmt::Debug for HandOff<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandOff::Lease(_) => f.debug_tuple("Lease").finish(),
            HandOff::Retry => f.debug_tuple("Retry").finish(),
        }
    }
}

/// Identifies one parked acquirer for the timeout/hand-off race.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WaiterId(u64);

pub(crate) struct Waiter<M: Connect> {
    id: WaiterId,
    tx: Sender<HandOff<M>>,
}

impl<M: Connect> Waiter<M> {
    pub(crate) fn id(&self) -> WaiterId {
        self.id
    }

    /// Whether the acquirer has given up on this waiter.
    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Hand a leased connection to this waiter. On failure the acquirer
    /// went away; the guard comes back so the connection can be offered
    /// to the next waiter.
    pub(crate) fn send_lease(self, lease: Pooled<M>) -> Result<(), Pooled<M>> {
        self.tx.send(HandOff::Lease(lease)).map_err(|returned| match returned {
            HandOff::Lease(lease) => lease,
            HandOff::Retry => unreachable!("a lease was sent"),
        })
    }

    /// Wake this waiter to re-run the acquire decision.
    pub(crate) fn send_retry(self) -> Result<(), ()> {
        self.tx.send(HandOff::Retry).map_err(|_| ())
    }
}

impl<M: Connect> fmt::Debug for Waiter<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Waiter").field(&self.id).finish()
    }
}

/// Strictly first-in, first-out queue of parked acquirers.
pub(crate) struct WaiterQueue<M: Connect> {
    queue: VecDeque<Waiter<M>>,
    next_id: u64,
}

impl<M: Connect> WaiterQueue<M> {
    pub(crate) fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            next_id: 1,
        }
    }

    fn waiter(&mut self) -> (Waiter<M>, WaiterId, Receiver<HandOff<M>>) {
        let id = WaiterId(self.next_id);
        self.next_id += 1;
        let (tx, rx) = oneshot::channel();
        (Waiter { id, tx }, id, rx)
    }

    /// Park a new acquirer at the tail.
    pub(crate) fn enqueue(&mut self) -> (WaiterId, Receiver<HandOff<M>>) {
        let (waiter, id, rx) = self.waiter();
        self.queue.push_back(waiter);
        (id, rx)
    }

    /// Re-park an acquirer at the head, restoring the position it held
    /// before a retry nudge.
    pub(crate) fn enqueue_front(&mut self) -> (WaiterId, Receiver<HandOff<M>>) {
        let (waiter, id, rx) = self.waiter();
        self.queue.push_front(waiter);
        (id, rx)
    }

    pub(crate) fn pop_front(&mut self) -> Option<Waiter<M>> {
        self.queue.pop_front()
    }

    /// Remove a parked acquirer whose deadline elapsed. Returns `false`
    /// when the waiter is no longer queued because a hand-off beat the
    /// timeout.
    pub(crate) fn cancel(&mut self, id: WaiterId) -> bool {
        match self.queue.iter().position(|waiter| waiter.id == id) {
            Some(index) => {
                let _ = self.queue.remove(index);
                trace!(waiter = ?id, "waiter timed out");
                true
            }
            None => false,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drop entries whose acquirer has gone away, so a dead waiter does
    /// not make the queue look occupied.
    pub(crate) fn purge_closed(&mut self) {
        self.queue.retain(|waiter| !waiter.is_closed());
    }

    /// Drop every parked acquirer. Their channels close, and they observe
    /// the pool as closed.
    pub(crate) fn drain(&mut self) {
        if !self.queue.is_empty() {
            trace!(waiters = self.queue.len(), "dropping parked acquirers");
        }
        self.queue.clear();
    }
}

impl<M: Connect> fmt::Debug for WaiterQueue<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaiterQueue")
            .field("len", &self.queue.len())
            .finish()
    }
}
