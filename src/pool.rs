//! The pool façade: acquire, release, and lifecycle.
//!
//! All scheduling state (the slot registry and the waiter queue) lives
//! behind a single mutex, held only for O(1) bookkeeping and never across
//! I/O. Connection establishment, probing, and closing all happen outside
//! the critical section.

use std::fmt;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::{Config, ConfigError};
use crate::conn::Connect;
use crate::monitor;
use crate::slot::{ConnId, Slot, SlotRegistry};
use crate::waiters::{HandOff, WaiterId, WaiterQueue};

/// Errors surfaced by [`Pool::acquire`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum AcquireError<E> {
    /// The deadline elapsed before a connection could be handed over.
    ///
    /// A transient capacity signal: the caller may retry, or surface it
    /// upward as backpressure.
    #[error("timed out waiting for a connection")]
    Timeout,

    /// The pool is draining or closed.
    #[error("pool is closed")]
    Closed,

    /// Establishing a new connection failed.
    #[error("establishing connection")]
    Connect(#[source] E),
}

/// Error surfaced by [`Pooled::release`] and [`Pool::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ReleaseError {
    /// The connection is not currently leased from this pool: it was
    /// already released, or its lease was revoked at shutdown. The pool's
    /// bookkeeping is untouched and the connection has been closed.
    #[error("connection was already released or its lease was revoked")]
    DoubleRelease,
}

/// Eager startup opened fewer connections than `min_size`.
///
/// The pool is still running and will keep growing lazily on demand.
#[derive(Debug, thiserror::Error)]
#[error("opened {opened} of {wanted} connections at startup")]
#[non_exhaustive]
pub struct StartError<E> {
    /// Connections successfully opened.
    pub opened: usize,
    /// Eager connections this call set out to open: the gap between the
    /// pool's size and `min_size` when `start` was called.
    pub wanted: usize,
    /// The last establishment failure.
    #[source]
    pub source: E,
}

/// Where the pool is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Constructed; eager connections not yet opened. Acquires already
    /// work and grow the pool lazily.
    Starting,
    /// Fully operational.
    Running,
    /// Shutting down: new acquires are rejected, in-use connections are
    /// being waited out.
    Draining,
    /// Shut down: every connection closed or its lease revoked.
    Closed,
}

/// A point-in-time snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Connections owned by the pool, idle or in use.
    pub total: usize,
    /// Connections sitting idle.
    pub idle: usize,
    /// Connections out with callers.
    pub in_use: usize,
    /// Acquirers parked waiting for a connection.
    pub waiting: usize,
    /// Current lifecycle state.
    pub lifecycle: Lifecycle,
}

/// Outcome of the acquire decision, taken under the lock.
enum Step<M: Connect> {
    Ready(Slot<M::Connection>),
    Grow,
    Wait(WaiterId, oneshot::Receiver<HandOff<M>>),
    Closed,
}

/// What a caller should do with a slot after the bookkeeping settled.
enum Released<C> {
    Returned,
    Close(Slot<C>),
    Stale(Slot<C>),
}

pub(crate) struct PoolCore<M: Connect> {
    lifecycle: Lifecycle,
    registry: SlotRegistry<M::Connection>,
    waiters: WaiterQueue<M>,
    in_use: watch::Sender<usize>,
}

impl<M: Connect> PoolCore<M> {
    fn new(max_size: usize) -> Self {
        let (in_use, _) = watch::channel(0);
        Self {
            lifecycle: Lifecycle::Starting,
            registry: SlotRegistry::new(max_size),
            waiters: WaiterQueue::new(),
            in_use,
        }
    }

    pub(crate) fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    fn is_open_for_acquires(&self) -> bool {
        !matches!(self.lifecycle, Lifecycle::Draining | Lifecycle::Closed)
    }

    fn publish_in_use(&mut self) {
        let _ = self.in_use.send_replace(self.registry.in_use_count());
    }

    fn next_step(
        &mut self,
        connector: &M,
        resume_front: bool,
        dead: &mut Vec<Slot<M::Connection>>,
    ) -> Step<M> {
        if !self.is_open_for_acquires() {
            return Step::Closed;
        }
        self.waiters.purge_closed();
        if let Some(mut slot) = self
            .registry
            .pop_idle(|conn| connector.is_open(conn), dead)
        {
            slot.touch();
            self.registry.lease(slot.id());
            self.publish_in_use();
            return Step::Ready(slot);
        }
        // A newcomer may not grow into capacity that freed up while older
        // waiters are still parked; a nudged waiter re-entering may.
        if (resume_front || self.waiters.is_empty()) && self.registry.can_grow() {
            self.registry.reserve();
            return Step::Grow;
        }
        let (id, rx) = if resume_front {
            self.waiters.enqueue_front()
        } else {
            self.waiters.enqueue()
        };
        trace!(waiter = ?id, "pool saturated, parking acquirer");
        Step::Wait(id, rx)
    }

    /// Give a connection to the head waiter, or park it in the idle set.
    ///
    /// The hand-off is sent while the lock is held, so the decision
    /// against a concurrent timeout is atomic.
    fn offer(&mut self, slot: Slot<M::Connection>, core: &Weak<Mutex<Self>>, connector: &Arc<M>) {
        let mut slot = slot;
        while let Some(waiter) = self.waiters.pop_front() {
            let waiter_id = waiter.id();
            slot.touch();
            self.registry.lease(slot.id());
            self.publish_in_use();
            let lease = Pooled {
                slot: Some(slot),
                core: core.clone(),
                connector: connector.clone(),
            };
            match waiter.send_lease(lease) {
                Ok(()) => {
                    debug!(waiter = ?waiter_id, "connection handed to waiter");
                    return;
                }
                Err(returned) => {
                    trace!(waiter = ?waiter_id, "waiter gone, trying the next");
                    slot = returned
                        .into_slot()
                        .expect("lease carries its slot until released");
                    let _ = self.registry.redeem(slot.id());
                    self.publish_in_use();
                }
            }
        }
        self.registry.push_idle(slot);
    }

    /// Wake the head waiter with a retry after capacity freed without a
    /// connection to hand over.
    fn nudge(&mut self) {
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.send_retry().is_ok() {
                trace!("nudged head waiter to retry");
                return;
            }
        }
    }

    fn release(
        &mut self,
        slot: Slot<M::Connection>,
        open: bool,
        core: &Weak<Mutex<Self>>,
        connector: &Arc<M>,
    ) -> Released<M::Connection> {
        if !self.registry.redeem(slot.id()) {
            return Released::Stale(slot);
        }
        self.publish_in_use();
        if !self.is_open_for_acquires() {
            trace!(id = %slot.id(), "pool draining, closing released connection");
            return Released::Close(slot);
        }
        if !open {
            debug!(id = %slot.id(), "released connection is no longer open");
            self.nudge();
            return Released::Close(slot);
        }
        self.offer(slot, core, connector);
        Released::Returned
    }

    // Entry points for the health monitor.

    pub(crate) fn reclaim_expired(
        &mut self,
        lifetime: Duration,
        min_size: usize,
    ) -> Vec<Slot<M::Connection>> {
        self.registry.take_expired(lifetime, min_size)
    }

    /// Borrow every idle connection for probing. Borrowed slots stay
    /// leased so the capacity cap holds while they are out.
    pub(crate) fn borrow_idle(&mut self) -> Vec<Slot<M::Connection>> {
        let borrowed = self.registry.take_all_idle();
        for slot in &borrowed {
            self.registry.lease(slot.id());
        }
        self.publish_in_use();
        borrowed
    }

    /// Drop a borrowed connection that failed its probe.
    pub(crate) fn evict(&mut self, id: ConnId) {
        if self.registry.redeem(id) {
            self.publish_in_use();
        }
        self.nudge();
    }

    /// Return a borrowed or freshly opened connection to service. When
    /// the pool can no longer take it, the slot comes back for the caller
    /// to close outside the lock.
    pub(crate) fn restore(
        &mut self,
        slot: Slot<M::Connection>,
        borrowed: bool,
        core: &Weak<Mutex<Self>>,
        connector: &Arc<M>,
    ) -> Option<Slot<M::Connection>> {
        if borrowed {
            if !self.registry.redeem(slot.id()) {
                return Some(slot);
            }
            self.publish_in_use();
        }
        if !self.is_open_for_acquires() {
            return Some(slot);
        }
        self.offer(slot, core, connector);
        None
    }

    /// Claim capacity for a replenishing establishment, if one is needed.
    pub(crate) fn reserve_replenish(&mut self, min_size: usize) -> bool {
        if self.lifecycle != Lifecycle::Running {
            return false;
        }
        if self.registry.total() + self.registry.reserved() < min_size
            && self.registry.can_grow()
        {
            self.registry.reserve();
            return true;
        }
        false
    }

    pub(crate) fn finish_reservation(&mut self) {
        self.registry.unreserve();
    }

    pub(crate) fn abandon_reservation(&mut self) {
        self.registry.unreserve();
        self.nudge();
    }

    pub(crate) fn adopt(&mut self, conn: M::Connection) -> Slot<M::Connection> {
        Slot::new(self.registry.assign_id(), conn)
    }
}

impl<M: Connect> fmt::Debug for PoolCore<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolCore")
            .field("lifecycle", &self.lifecycle)
            .field("total", &self.registry.total())
            .field("idle", &self.registry.idle_count())
            .field("waiters", &self.waiters)
            .finish()
    }
}

/// A bounded, fair pool of reusable backend connections.
///
/// Cloning is cheap and every clone drives the same pool.
pub struct Pool<M: Connect> {
    core: Arc<Mutex<PoolCore<M>>>,
    connector: Arc<M>,
    config: Config,
}

impl<M: Connect> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            connector: self.connector.clone(),
            config: self.config.clone(),
        }
    }
}

impl<M: Connect> fmt::Debug for Pool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl<M: Connect> Pool<M> {
    /// Create a pool over `connector`, validating `config`.
    ///
    /// The pool is usable immediately and grows lazily; call
    /// [`Pool::start`] to open the eager minimum and begin health
    /// monitoring.
    pub fn new(connector: M, config: Config) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            core: Arc::new(Mutex::new(PoolCore::new(config.max_size))),
            connector: Arc::new(connector),
            config,
        })
    }

    /// The pool's configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The connector this pool opens connections through.
    pub fn connector(&self) -> &M {
        &self.connector
    }

    /// A point-in-time snapshot of occupancy.
    pub fn status(&self) -> PoolStatus {
        let core = self.core.lock();
        PoolStatus {
            total: core.registry.total(),
            idle: core.registry.idle_count(),
            in_use: core.registry.in_use_count(),
            waiting: core.waiters.len(),
            lifecycle: core.lifecycle,
        }
    }

    /// Top the pool up to `min_size` eagerly and spawn the health
    /// monitor.
    ///
    /// Connections the pool already grew lazily count toward the
    /// minimum, so `start` never opens past the cap. Partial failure is
    /// reported but not fatal: successfully opened connections are kept,
    /// the pool enters its running state, and lazy growth continues to
    /// work. Calling `start` more than once is a no-op.
    pub async fn start(&self) -> Result<(), StartError<M::Error>> {
        let wanted = {
            let mut core = self.core.lock();
            if core.lifecycle != Lifecycle::Starting {
                return Ok(());
            }
            // The pool may already have grown lazily; only open what is
            // still missing below the minimum. Existing connections and
            // reservations keep this within the cap.
            let wanted = self
                .config
                .min_size
                .saturating_sub(core.registry.total() + core.registry.reserved());
            core.registry.reserve_many(wanted);
            wanted
        };
        let mut reservation = Reservation::new(&self.core, wanted);

        debug!(wanted, "opening minimum connections");
        let opens = (0..wanted).map(|_| self.connector.connect());
        let results = futures_util::future::join_all(opens).await;

        reservation.disarm();
        let mut opened = 0;
        let mut failure = None;
        let mut stillborn = Vec::new();
        {
            let mut core = self.core.lock();
            let starting = core.lifecycle == Lifecycle::Starting;
            for result in results {
                core.registry.unreserve();
                match result {
                    Ok(conn) if starting => {
                        let slot = core.adopt(conn);
                        trace!(id = %slot.id(), "connection opened at startup");
                        core.registry.push_idle(slot);
                        opened += 1;
                    }
                    // A shutdown raced the eager opens; close them.
                    Ok(conn) => stillborn.push(conn),
                    Err(error) => {
                        warn!(error = %error, "startup connection failed");
                        failure = Some(error);
                    }
                }
            }
            if starting {
                core.lifecycle = Lifecycle::Running;
            }
        }
        for conn in stillborn {
            self.connector.close(conn);
        }

        monitor::spawn(
            Arc::downgrade(&self.core),
            self.connector.clone(),
            self.config.clone(),
        );

        match failure {
            None => {
                debug!(opened, "pool running");
                Ok(())
            }
            Some(source) => Err(StartError {
                opened,
                wanted,
                source,
            }),
        }
    }

    /// Acquire a connection, waiting at most the configured
    /// `acquire_timeout`.
    pub async fn acquire(&self) -> Result<Pooled<M>, AcquireError<M::Error>> {
        self.acquire_timeout(self.config.acquire_timeout).await
    }

    /// Acquire a connection, waiting at most `timeout`.
    ///
    /// An idle connection is returned immediately. Below `max_size` a new
    /// one is opened on behalf of this call, bounded by the same
    /// deadline. At capacity the caller parks in a FIFO queue until a
    /// connection is released to it or the deadline passes.
    pub async fn acquire_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Pooled<M>, AcquireError<M::Error>> {
        let deadline = Instant::now().checked_add(timeout);
        let mut resume_front = false;
        loop {
            let mut dead = Vec::new();
            let step = {
                let mut core = self.core.lock();
                core.next_step(&self.connector, resume_front, &mut dead)
            };
            resume_front = false;
            for slot in dead {
                self.connector.close(slot.into_conn());
            }

            match step {
                Step::Closed => return Err(AcquireError::Closed),
                Step::Ready(slot) => {
                    debug!(id = %slot.id(), "reusing idle connection");
                    return Ok(self.pooled(slot));
                }
                Step::Grow => return self.grow(deadline).await,
                Step::Wait(id, mut rx) => {
                    match with_deadline(deadline, &mut rx).await {
                        Some(Ok(HandOff::Lease(lease))) => {
                            debug!(id = %lease.id(), "connection received from hand-off");
                            return Ok(lease);
                        }
                        Some(Ok(HandOff::Retry)) => {
                            trace!("capacity freed, retrying acquire");
                            resume_front = true;
                        }
                        Some(Err(_closed)) => return Err(AcquireError::Closed),
                        None => {
                            if self.core.lock().waiters.cancel(id) {
                                return Err(AcquireError::Timeout);
                            }
                            // A hand-off won the race under the lock; the
                            // message is already in the channel.
                            match rx.try_recv() {
                                Ok(HandOff::Lease(lease)) => return Ok(lease),
                                Ok(HandOff::Retry) => resume_front = true,
                                Err(_) => return Err(AcquireError::Closed),
                            }
                        }
                    }
                }
            }
        }
    }

    /// Explicitly return a leased connection to the pool.
    ///
    /// Equivalent to dropping the guard, but surfaces bookkeeping errors
    /// instead of only logging them.
    pub fn release(&self, conn: Pooled<M>) -> Result<(), ReleaseError> {
        conn.release()
    }

    /// Drain and close the pool.
    ///
    /// New acquires fail immediately with [`AcquireError::Closed`] and
    /// parked waiters are woken with the same error. Idle connections
    /// close at once; in-use connections get up to `grace` to be
    /// released. Leases still outstanding after that are revoked: their
    /// connections are closed when the holder lets go of them.
    pub async fn shutdown(&self, grace: Duration) {
        debug!("pool shutting down");
        let (idle, mut leases) = {
            let mut core = self.core.lock();
            core.lifecycle = Lifecycle::Draining;
            core.waiters.drain();
            (core.registry.take_all_idle(), core.in_use.subscribe())
        };
        for slot in idle {
            self.connector.close(slot.into_conn());
        }

        // The watch guard must not be held into the lock below.
        let drained = tokio::time::timeout(grace, leases.wait_for(|&count| count == 0))
            .await
            .is_ok();

        let mut core = self.core.lock();
        if drained {
            debug!("pool drained");
        } else {
            let revoked = core.registry.revoke_all();
            core.publish_in_use();
            if revoked > 0 {
                warn!(
                    revoked,
                    "grace period expired with connections still leased; revoking their leases"
                );
            }
        }
        core.lifecycle = Lifecycle::Closed;
        drop(core);
        debug!("pool closed");
    }

    /// Open a new connection on behalf of an acquire, with capacity
    /// already reserved.
    async fn grow(
        &self,
        deadline: Option<Instant>,
    ) -> Result<Pooled<M>, AcquireError<M::Error>> {
        debug!("opening connection for acquire");
        let mut reservation = Reservation::new(&self.core, 1);
        match with_deadline(deadline, self.connector.connect()).await {
            Some(Ok(conn)) => {
                reservation.disarm();
                let mut core = self.core.lock();
                core.registry.unreserve();
                if !core.is_open_for_acquires() {
                    drop(core);
                    trace!("pool closed while connecting");
                    self.connector.close(conn);
                    return Err(AcquireError::Closed);
                }
                let slot = core.adopt(conn);
                trace!(id = %slot.id(), "connection established");
                core.registry.lease(slot.id());
                core.publish_in_use();
                drop(core);
                Ok(self.pooled(slot))
            }
            Some(Err(error)) => {
                warn!(error = %error, "connection establishment failed");
                reservation.disarm();
                let mut core = self.core.lock();
                core.abandon_reservation();
                drop(core);
                Err(AcquireError::Connect(error))
            }
            None => {
                debug!("connection establishment abandoned at deadline");
                reservation.disarm();
                let mut core = self.core.lock();
                core.abandon_reservation();
                drop(core);
                Err(AcquireError::Timeout)
            }
        }
    }

    fn pooled(&self, slot: Slot<M::Connection>) -> Pooled<M> {
        Pooled {
            slot: Some(slot),
            core: Arc::downgrade(&self.core),
            connector: self.connector.clone(),
        }
    }
}

/// Returns capacity reservations if an establishment is abandoned
/// mid-flight because the owning future was dropped at its await point.
struct Reservation<'a, M: Connect> {
    core: &'a Mutex<PoolCore<M>>,
    count: usize,
}

impl<'a, M: Connect> Reservation<'a, M> {
    fn new(core: &'a Mutex<PoolCore<M>>, count: usize) -> Self {
        Self { core, count }
    }

    fn disarm(&mut self) {
        self.count = 0;
    }
}

impl<M: Connect> Drop for Reservation<'_, M> {
    fn drop(&mut self) {
        if self.count > 0 {
            trace!(count = self.count, "establishment abandoned, returning reservations");
            let mut core = self.core.lock();
            for _ in 0..self.count {
                core.abandon_reservation();
            }
        }
    }
}

async fn with_deadline<F>(deadline: Option<Instant>, future: F) -> Option<F::Output>
where
    F: Future,
{
    match deadline {
        Some(at) => tokio::time::timeout_at(at, future).await.ok(),
        None => Some(future.await),
    }
}

/// A connection leased from a [`Pool`].
///
/// Dereferences to the driver connection. Dropping the guard returns the
/// connection to the pool; [`Pooled::release`] does the same but surfaces
/// bookkeeping errors, and [`Pooled::detach`] takes the connection out of
/// the pool entirely.
pub struct Pooled<M: Connect> {
    slot: Option<Slot<M::Connection>>,
    core: Weak<Mutex<PoolCore<M>>>,
    connector: Arc<M>,
}

impl<M: Connect> Pooled<M> {
    /// The pool's identity for this connection.
    pub fn id(&self) -> ConnId {
        self.slot().id()
    }

    /// When this connection was established.
    pub fn created_at(&self) -> std::time::Instant {
        self.slot().created_at()
    }

    /// When this connection last went out to a caller or came back.
    pub fn last_used(&self) -> std::time::Instant {
        self.slot().last_used()
    }

    /// Explicitly return the connection to the pool.
    ///
    /// Reports [`ReleaseError::DoubleRelease`] when the lease is no
    /// longer current, for example after a shutdown revoked it. The pool
    /// state is untouched in that case; the connection is closed either
    /// way.
    pub fn release(mut self) -> Result<(), ReleaseError> {
        self.give_back()
    }

    /// Take the connection out of the pool's accounting, freeing its
    /// capacity for a replacement.
    pub fn detach(mut self) -> M::Connection {
        let slot = self.slot.take().expect("slot present until released");
        if let Some(core) = self.core.upgrade() {
            let mut core = core.lock();
            if core.registry.redeem(slot.id()) {
                core.publish_in_use();
                core.nudge();
            }
        }
        trace!(id = %slot.id(), "connection detached from pool");
        slot.into_conn()
    }

    pub(crate) fn into_slot(mut self) -> Option<Slot<M::Connection>> {
        self.slot.take()
    }

    fn slot(&self) -> &Slot<M::Connection> {
        self.slot.as_ref().expect("slot present until released")
    }

    fn give_back(&mut self) -> Result<(), ReleaseError> {
        let Some(mut slot) = self.slot.take() else {
            return Ok(());
        };
        slot.touch();
        let Some(core) = self.core.upgrade() else {
            trace!(id = %slot.id(), "pool gone, closing connection");
            self.connector.close(slot.into_conn());
            return Ok(());
        };
        let open = self.connector.is_open(slot.conn());
        let released = core
            .lock()
            .release(slot, open, &self.core, &self.connector);
        match released {
            Released::Returned => Ok(()),
            Released::Close(slot) => {
                self.connector.close(slot.into_conn());
                Ok(())
            }
            Released::Stale(slot) => {
                warn!(
                    id = %slot.id(),
                    "connection released twice or after its lease was revoked"
                );
                self.connector.close(slot.into_conn());
                Err(ReleaseError::DoubleRelease)
            }
        }
    }
}

impl<M: Connect> Deref for Pooled<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        self.slot().conn()
    }
}

impl<M: Connect> DerefMut for Pooled<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.slot
            .as_mut()
            .expect("slot present until released")
            .conn_mut()
    }
}

impl<M: Connect> fmt::Debug for Pooled<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pooled")
            .field(&self.slot.as_ref().map(|slot| slot.id()))
            .finish()
    }
}

impl<M: Connect> Drop for Pooled<M> {
    fn drop(&mut self) {
        let _ = self.give_back();
    }
}
