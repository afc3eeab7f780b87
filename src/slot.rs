//! Slot bookkeeping: which connections the pool owns, and where they are.
//!
//! The registry is pure bookkeeping. It performs no I/O and is only ever
//! mutated under the pool's lock; an acquire or release is a single
//! logical transaction across the registry and the waiter queue.

use std::collections::HashSet;
use std::fmt;
use std::time::{Duration, Instant};

use tracing::trace;

/// Identity of a pooled connection, unique within its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A connection owned by the pool, with its bookkeeping record.
///
/// While leased, the slot travels inside the caller's guard; its id stays
/// behind in the lease table.
#[derive(Debug)]
pub(crate) struct Slot<C> {
    id: ConnId,
    conn: C,
    created_at: Instant,
    last_used: Instant,
}

impl<C> Slot<C> {
    pub(crate) fn new(id: ConnId, conn: C) -> Self {
        let now = Instant::now();
        Self {
            id,
            conn,
            created_at: now,
            last_used: now,
        }
    }

    pub(crate) fn id(&self) -> ConnId {
        self.id
    }

    pub(crate) fn conn(&self) -> &C {
        &self.conn
    }

    pub(crate) fn conn_mut(&mut self) -> &mut C {
        &mut self.conn
    }

    pub(crate) fn into_conn(self) -> C {
        self.conn
    }

    pub(crate) fn created_at(&self) -> Instant {
        self.created_at
    }

    pub(crate) fn last_used(&self) -> Instant {
        self.last_used
    }

    pub(crate) fn touch(&mut self) {
        self.last_used = Instant::now();
    }
}

#[derive(Debug)]
struct Idle<C> {
    since: Instant,
    slot: Slot<C>,
}

/// Tracks every connection the pool owns, partitioned into an idle list
/// and a lease table, plus reservations for establishments in flight.
///
/// Reservations are what keep a burst of concurrent growers under the
/// cap: capacity is claimed before the handshake starts, and returned if
/// it fails.
#[derive(Debug)]
pub(crate) struct SlotRegistry<C> {
    idle: Vec<Idle<C>>,
    leases: HashSet<ConnId>,
    reserved: usize,
    max_size: usize,
    next_id: u64,
}

impl<C> SlotRegistry<C> {
    pub(crate) fn new(max_size: usize) -> Self {
        Self {
            idle: Vec::new(),
            leases: HashSet::new(),
            reserved: 0,
            max_size,
            next_id: 1,
        }
    }

    pub(crate) fn assign_id(&mut self) -> ConnId {
        let id = ConnId(self.next_id);
        self.next_id += 1;
        id
    }

    pub(crate) fn total(&self) -> usize {
        self.idle.len() + self.leases.len()
    }

    pub(crate) fn idle_count(&self) -> usize {
        self.idle.len()
    }

    pub(crate) fn in_use_count(&self) -> usize {
        self.leases.len()
    }

    pub(crate) fn reserved(&self) -> usize {
        self.reserved
    }

    /// Whether a new establishment may begin without risking the cap.
    pub(crate) fn can_grow(&self) -> bool {
        self.total() + self.reserved < self.max_size
    }

    pub(crate) fn reserve(&mut self) {
        self.reserved += 1;
    }

    pub(crate) fn reserve_many(&mut self, n: usize) {
        self.reserved += n;
    }

    pub(crate) fn unreserve(&mut self) {
        debug_assert!(self.reserved > 0, "unreserve without a reservation");
        self.reserved = self.reserved.saturating_sub(1);
    }

    /// Take the most recently idled connection, discarding any that the
    /// driver reports closed. Discards are pushed onto `dead` for the
    /// caller to close outside the lock.
    pub(crate) fn pop_idle(
        &mut self,
        is_open: impl Fn(&C) -> bool,
        dead: &mut Vec<Slot<C>>,
    ) -> Option<Slot<C>> {
        while let Some(entry) = self.idle.pop() {
            if is_open(entry.slot.conn()) {
                return Some(entry.slot);
            }
            trace!(id = %entry.slot.id(), "discarding closed idle connection");
            dead.push(entry.slot);
        }
        None
    }

    pub(crate) fn push_idle(&mut self, slot: Slot<C>) {
        debug_assert!(!self.leases.contains(&slot.id()), "idle slot still leased");
        self.idle.push(Idle {
            since: Instant::now(),
            slot,
        });
    }

    /// Record that `id` is out with a caller.
    pub(crate) fn lease(&mut self, id: ConnId) {
        let inserted = self.leases.insert(id);
        debug_assert!(inserted, "connection leased twice");
    }

    /// Clear the lease for `id`. Returns `false` when no such lease
    /// exists: a double release, or a lease revoked at shutdown.
    pub(crate) fn redeem(&mut self, id: ConnId) -> bool {
        self.leases.remove(&id)
    }

    /// Remove idle connections older than `lifetime`, oldest first,
    /// keeping the pool at or above `min_size`.
    pub(crate) fn take_expired(&mut self, lifetime: Duration, min_size: usize) -> Vec<Slot<C>> {
        let mut reclaimed = Vec::new();
        let Some(cutoff) = Instant::now().checked_sub(lifetime) else {
            return reclaimed;
        };
        while self.total() > min_size {
            match self.idle.first() {
                Some(entry) if entry.since < cutoff => {
                    let entry = self.idle.remove(0);
                    trace!(id = %entry.slot.id(), "reclaiming idle connection");
                    reclaimed.push(entry.slot);
                }
                _ => break,
            }
        }
        reclaimed
    }

    pub(crate) fn take_all_idle(&mut self) -> Vec<Slot<C>> {
        self.idle.drain(..).map(|entry| entry.slot).collect()
    }

    /// Invalidate every outstanding lease. Returns how many were revoked.
    pub(crate) fn revoke_all(&mut self) -> usize {
        let revoked = self.leases.len();
        self.leases.clear();
        revoked
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn slot(registry: &mut SlotRegistry<&'static str>, conn: &'static str) -> Slot<&'static str> {
        let id = registry.assign_id();
        Slot::new(id, conn)
    }

    #[test]
    fn counts_partition_cleanly() {
        let mut registry = SlotRegistry::new(4);
        let first = slot(&mut registry, "a");
        let second = slot(&mut registry, "b");
        let second_id = second.id();

        registry.push_idle(first);
        registry.lease(second_id);

        assert_eq!(registry.idle_count(), 1);
        assert_eq!(registry.in_use_count(), 1);
        assert_eq!(registry.total(), 2);
    }

    #[test]
    fn redeem_is_single_shot() {
        let mut registry = SlotRegistry::<&str>::new(2);
        let id = registry.assign_id();

        registry.lease(id);
        assert!(registry.redeem(id));
        assert!(!registry.redeem(id));
        assert_eq!(registry.in_use_count(), 0);
    }

    #[test]
    fn pop_idle_skips_closed_connections() {
        let mut registry = SlotRegistry::new(4);
        let s = slot(&mut registry, "dead");
        registry.push_idle(s);
        let s = slot(&mut registry, "live");
        registry.push_idle(s);

        let mut dead = Vec::new();
        let popped = registry.pop_idle(|conn| *conn == "live", &mut dead);

        assert_eq!(popped.map(|s| s.into_conn()), Some("live"));
        assert!(dead.is_empty());

        let popped = registry.pop_idle(|conn| *conn == "live", &mut dead);
        assert!(popped.is_none());
        assert_eq!(dead.len(), 1);
        assert_eq!(registry.total(), 0);
    }

    #[test]
    fn reservations_count_against_capacity() {
        let mut registry = SlotRegistry::<&str>::new(2);
        assert!(registry.can_grow());

        registry.reserve();
        assert!(registry.can_grow());
        registry.reserve();
        assert!(!registry.can_grow());

        registry.unreserve();
        assert!(registry.can_grow());
        assert_eq!(registry.reserved(), 1);
    }

    #[test]
    fn expiry_respects_the_minimum() {
        let mut registry = SlotRegistry::new(4);
        let s = slot(&mut registry, "a");
        registry.push_idle(s);
        let s = slot(&mut registry, "b");
        registry.push_idle(s);
        let s = slot(&mut registry, "c");
        registry.push_idle(s);

        thread::sleep(Duration::from_millis(10));

        let reclaimed = registry.take_expired(Duration::from_millis(1), 1);
        assert_eq!(reclaimed.len(), 2);
        assert_eq!(registry.total(), 1);

        let reclaimed = registry.take_expired(Duration::from_millis(1), 1);
        assert!(reclaimed.is_empty());
    }

    #[test]
    fn fresh_connections_do_not_expire() {
        let mut registry = SlotRegistry::new(4);
        let s = slot(&mut registry, "a");
        registry.push_idle(s);
        let s = slot(&mut registry, "b");
        registry.push_idle(s);

        let reclaimed = registry.take_expired(Duration::from_secs(300), 1);
        assert!(reclaimed.is_empty());
        assert_eq!(registry.total(), 2);
    }

    #[test]
    fn revoke_clears_every_lease() {
        let mut registry = SlotRegistry::<&str>::new(4);
        let first = registry.assign_id();
        let second = registry.assign_id();
        registry.lease(first);
        registry.lease(second);

        assert_eq!(registry.revoke_all(), 2);
        assert_eq!(registry.in_use_count(), 0);
        assert!(!registry.redeem(first));
    }
}
