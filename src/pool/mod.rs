//! Pre-warmed pool of [`Connection`] objects.
//!
//! The pool is touched only from the reactor thread, so it needs no locking.
//! `lease` moves a connection out and `release` takes one back by value: a
//! leased connection simply is not in the pool, and a connection cannot be
//! released twice because releasing consumes it.

use tracing::trace;

use crate::connection::{Connection, ConnectionId, ConnectionState};

/// Reference pre-warm count.
pub const DEFAULT_INITIAL_SIZE: usize = 128;

type Factory = Box<dyn FnMut(ConnectionId) -> Connection + Send>;

/// Lease/release pool with on-demand growth.
///
/// # Examples
///
/// ```
/// use fluxhttp::pool::ConnectionPool;
///
/// let mut pool = ConnectionPool::with_capacity(2);
/// let a = pool.lease();
/// let b = pool.lease();
/// let c = pool.lease(); // grows instead of blocking
/// assert_eq!(pool.created(), 3);
/// assert_eq!(pool.leased(), 3);
///
/// pool.release(a);
/// pool.release(b);
/// pool.release(c);
/// assert_eq!(pool.available(), 3);
/// ```
pub struct ConnectionPool {
    available: Vec<Connection>,
    factory: Factory,
    created: u64,
}

impl ConnectionPool {
    /// Builds a pool pre-warmed with `initial` connections made by the
    /// default factory.
    pub fn with_capacity(initial: usize) -> Self {
        Self::with_factory(initial, Connection::new)
    }

    /// Builds a pool pre-warmed with `initial` connections, using `factory`
    /// both for pre-warming and for later growth.
    pub fn with_factory<F>(initial: usize, factory: F) -> Self
    where
        F: FnMut(ConnectionId) -> Connection + Send + 'static,
    {
        let mut pool = Self {
            available: Vec::with_capacity(initial),
            factory: Box::new(factory),
            created: 0,
        };
        for _ in 0..initial {
            let conn = pool.create();
            pool.available.push(conn);
        }
        pool
    }

    fn create(&mut self) -> Connection {
        let id = ConnectionId::new(self.created);
        self.created += 1;
        (self.factory)(id)
    }

    /// Takes an idle connection, building a new one if none is idle.
    pub fn lease(&mut self) -> Connection {
        match self.available.pop() {
            Some(conn) => conn,
            None => {
                let conn = self.create();
                trace!(conn = %conn.id(), total = self.created, "pool grew");
                conn
            }
        }
    }

    /// Returns a connection for reuse, clearing its per-request state.
    pub fn release(&mut self, mut conn: Connection) {
        conn.reset();
        debug_assert_eq!(conn.state(), ConnectionState::Pooled);
        self.available.push(conn);
    }

    /// Number of idle connections.
    pub fn available(&self) -> usize {
        self.available.len()
    }

    /// Number of connections ever built by this pool.
    pub fn created(&self) -> usize {
        self.created as usize
    }

    /// Number of connections currently out of the pool.
    pub fn leased(&self) -> usize {
        self.created() - self.available()
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_INITIAL_SIZE)
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("available", &self.available())
            .field("created", &self.created)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::reactor::SocketHandle;

    #[test]
    fn prewarms_with_initial_count() {
        let pool = ConnectionPool::with_capacity(4);
        assert_eq!(pool.available(), 4);
        assert_eq!(pool.created(), 4);
        assert_eq!(pool.leased(), 0);
    }

    #[test]
    fn default_pool_uses_reference_size() {
        assert_eq!(ConnectionPool::default().available(), DEFAULT_INITIAL_SIZE);
    }

    #[test]
    fn third_lease_on_pool_of_two_grows_via_factory() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut pool = ConnectionPool::with_factory(2, move |id| {
            counter.fetch_add(1, Ordering::SeqCst);
            Connection::new(id)
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let leased: Vec<_> = (0..3).map(|_| pool.lease()).collect();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(pool.available(), 0);
        assert_eq!(pool.leased(), 3);

        let ids: HashSet<_> = leased.iter().map(Connection::id).collect();
        assert_eq!(ids.len(), 3, "every lease must be a distinct object");
    }

    #[test]
    fn leased_objects_are_never_handed_out_twice() {
        let mut pool = ConnectionPool::with_capacity(3);
        let mut out: Vec<Connection> = Vec::new();

        // Interleave leases and releases; at every step the ids held outside
        // the pool must be unique.
        for round in 0..50 {
            if round % 3 == 2 {
                if let Some(conn) = out.pop() {
                    pool.release(conn);
                }
            } else {
                out.push(pool.lease());
            }
            let ids: HashSet<_> = out.iter().map(Connection::id).collect();
            assert_eq!(ids.len(), out.len());
            assert_eq!(pool.leased(), out.len());
        }
    }

    #[test]
    fn release_resets_connection_state() {
        let mut pool = ConnectionPool::with_capacity(1);
        let mut conn = pool.lease();
        conn.attach(SocketHandle::from_raw(5));
        conn.request_mut().insert("k", 1u8);
        let id = conn.id();
        pool.release(conn);

        let again = pool.lease();
        assert_eq!(again.id(), id);
        assert_eq!(again.state(), ConnectionState::Pooled);
        assert!(again.request().is_empty());
        assert_eq!(again.socket(), None);
    }
}
