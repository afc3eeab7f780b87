//! The driver seam: how a pool opens, checks, and closes connections.

use async_trait::async_trait;

/// Opens and maintains backend connections on behalf of a
/// [`Pool`](crate::Pool).
///
/// The pool treats connections as opaque: everything it needs from the
/// backend goes through this trait. Implementations wrap a driver such as
/// a database client, an RPC channel, or a raw socket, and the pool takes
/// care of capacity, fairness, timeouts, and lifecycle.
///
/// `connect` and `probe` run outside the pool's internal lock and may
/// take their time; `is_open` and `close` are called on the release and
/// shutdown paths and must not block.
#[async_trait]
pub trait Connect: Send + Sync + 'static {
    /// The driver's connection type.
    type Connection: Send + 'static;

    /// Error produced when establishing or probing a connection.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Establish a new backend connection.
    async fn connect(&self) -> Result<Self::Connection, Self::Error>;

    /// Cheap liveness probe for an idle connection.
    ///
    /// Called periodically by the health monitor. A returned error evicts
    /// the connection from the pool. The default accepts everything.
    async fn probe(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        let _ = conn;
        Ok(())
    }

    /// Whether the connection is still usable, without I/O.
    ///
    /// Consulted when handing out idle connections and when accepting
    /// releases; connections reported closed are discarded. The default
    /// trusts every connection.
    fn is_open(&self, conn: &Self::Connection) -> bool {
        let _ = conn;
        true
    }

    /// Dispose of a connection the pool no longer wants.
    ///
    /// The default drops it. Implement this when teardown needs
    /// bookkeeping or an explicit goodbye that `Drop` cannot provide.
    fn close(&self, conn: Self::Connection) {
        drop(conn);
    }
}
