//! A scripted connector for exercising a pool without a real backend.
//!
//! Mock sessions have no behavior of their own, but expose shared
//! open/healthy flags so tests can break them while the pool holds them.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use crate::conn::Connect;

static IDENT: AtomicU16 = AtomicU16::new(1);

/// A unique identifier for a mock backend session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u16);

impl SessionId {
    fn new() -> Self {
        Self(IDENT.fetch_add(1, Ordering::SeqCst))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

#[derive(Debug, Clone)]
struct Flags {
    open: Arc<AtomicBool>,
    healthy: Arc<AtomicBool>,
}

impl Flags {
    fn new() -> Self {
        Self {
            open: Arc::new(AtomicBool::new(true)),
            healthy: Arc::new(AtomicBool::new(true)),
        }
    }
}

/// A mock backend session.
#[derive(Debug)]
pub struct MockConn {
    ident: SessionId,
    flags: Flags,
}

impl MockConn {
    fn new() -> Self {
        let conn = Self {
            ident: SessionId::new(),
            flags: Flags::new(),
        };
        trace!(id = %conn.id(), "creating mock session");
        conn
    }

    /// The session identity, for asserting re-use.
    pub fn id(&self) -> SessionId {
        self.ident
    }

    /// Close the session out from under its holder.
    pub fn close(&self) {
        self.flags.open.store(false, Ordering::SeqCst);
    }
}

/// A side handle onto a mock session, valid while the pool holds it.
#[derive(Debug, Clone)]
pub struct MockHandle {
    ident: SessionId,
    flags: Flags,
}

impl MockHandle {
    /// The session this handle refers to.
    pub fn id(&self) -> SessionId {
        self.ident
    }

    /// Mark the session closed.
    pub fn close(&self) {
        self.flags.open.store(false, Ordering::SeqCst);
    }

    /// Make the session fail its next health probe.
    pub fn poison(&self) {
        self.flags.healthy.store(false, Ordering::SeqCst);
    }
}

/// Error produced by the scripted connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MockError {
    /// `connect` was scripted to fail.
    #[error("mock backend refused the connection")]
    Refused,
    /// The session was poisoned and failed its probe.
    #[error("mock session unhealthy")]
    Unhealthy,
}

/// Connector over scripted in-memory sessions.
#[derive(Debug, Default)]
pub struct MockConnector {
    fail_connects: AtomicUsize,
    connect_delay: Mutex<Duration>,
    opened: AtomicUsize,
    closed: AtomicUsize,
    handles: Mutex<Vec<MockHandle>>,
}

impl MockConnector {
    /// Create a connector where every connect succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the next `n` connect calls to fail.
    pub fn fail_next_connects(&self, n: usize) {
        self.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Make every connect pause before completing, so tests can catch
    /// establishments in flight. Zero (the default) completes at once.
    pub fn delay_connects(&self, delay: Duration) {
        *self.connect_delay.lock() = delay;
    }

    /// Number of sessions opened so far.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Number of sessions closed back through the connector.
    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Handles onto every session opened so far, in open order.
    pub fn handles(&self) -> Vec<MockHandle> {
        self.handles.lock().clone()
    }

    fn take_scripted_failure(&self) -> bool {
        self.fail_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Connect for MockConnector {
    type Connection = MockConn;
    type Error = MockError;

    async fn connect(&self) -> Result<MockConn, MockError> {
        if self.take_scripted_failure() {
            return Err(MockError::Refused);
        }
        let delay = *self.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let conn = MockConn::new();
        self.handles.lock().push(MockHandle {
            ident: conn.ident,
            flags: conn.flags.clone(),
        });
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(conn)
    }

    async fn probe(&self, conn: &mut MockConn) -> Result<(), MockError> {
        if conn.flags.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(MockError::Unhealthy)
        }
    }

    fn is_open(&self, conn: &MockConn) -> bool {
        conn.flags.open.load(Ordering::SeqCst)
    }

    fn close(&self, conn: MockConn) {
        conn.flags.open.store(false, Ordering::SeqCst);
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sessions_get_unique_ids() {
        let connector = MockConnector::new();
        let first = connector.connect().await.unwrap();
        let second = connector.connect().await.unwrap();

        assert_ne!(first.id(), second.id());
        assert_eq!(connector.opened(), 2);
    }

    #[tokio::test]
    async fn scripted_failures_run_out() {
        let connector = MockConnector::new();
        connector.fail_next_connects(1);

        assert_eq!(connector.connect().await.unwrap_err(), MockError::Refused);
        assert!(connector.connect().await.is_ok());
    }

    #[tokio::test]
    async fn poisoned_sessions_fail_probes() {
        let connector = MockConnector::new();
        let mut conn = connector.connect().await.unwrap();

        assert!(connector.probe(&mut conn).await.is_ok());
        connector.handles()[0].poison();
        assert_eq!(
            connector.probe(&mut conn).await.unwrap_err(),
            MockError::Unhealthy
        );
    }

    #[tokio::test]
    async fn closing_is_observable() {
        let connector = MockConnector::new();
        let conn = connector.connect().await.unwrap();

        assert!(connector.is_open(&conn));
        connector.close(conn);
        assert_eq!(connector.closed(), 1);
    }
}
