//! The drain cycle: turns finished dispatches into socket writes.
//!
//! Runs on the reactor thread from the periodic timer. Each tick pops every
//! result currently queued, serializes a response into the connection's write
//! buffer and starts a non-blocking write. The connection waits in
//! [`PendingWrites`] until the reactor reports the write finished, at which
//! point it goes back to the pool.

use std::collections::HashMap;

use tracing::{trace, warn};

use crate::connection::{Connection, ConnectionState};
use crate::http::{Response, canned};
use crate::pool::ConnectionPool;
use crate::queue::{CompletionReceiver, Outcome};
use crate::reactor::{ReactorIo, SocketHandle};

/// Tally of one drain tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainStats {
    /// Staged responses written.
    pub succeeded: usize,
    /// Internal-error responses written for failed callbacks.
    pub failed: usize,
    /// Writes the reactor refused to start.
    pub write_errors: usize,
}

impl DrainStats {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed
    }
}

/// Connections with a write in flight, keyed by socket.
#[derive(Debug, Default)]
pub struct PendingWrites {
    inner: HashMap<SocketHandle, Connection>,
}

impl PendingWrites {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends the connection's write buffer and parks the connection until
    /// completion.
    ///
    /// If the write cannot start, the socket is closed and the connection is
    /// released on the spot. Returns whether the write started.
    pub(crate) fn start(
        &mut self,
        io: &mut dyn ReactorIo,
        mut conn: Connection,
        pool: &mut ConnectionPool,
    ) -> bool {
        let Some(socket) = conn.socket() else {
            warn!(conn = %conn.id(), "connection has no socket, releasing");
            pool.release(conn);
            return false;
        };

        let bytes = conn.write_buf_mut().split().freeze();
        conn.set_state(ConnectionState::Writing);
        match io.write(socket, bytes) {
            Ok(()) => {
                self.inner.insert(socket, conn);
                true
            }
            Err(e) => {
                warn!(%socket, conn = %conn.id(), error = %e, "write could not start");
                io.close(socket);
                pool.release(conn);
                false
            }
        }
    }

    /// Removes and returns the connection whose write on `socket` finished.
    pub(crate) fn finish(&mut self, socket: SocketHandle) -> Option<Connection> {
        self.inner.remove(&socket)
    }

    pub fn contains(&self, socket: SocketHandle) -> bool {
        self.inner.contains_key(&socket)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Reactor-side owner of the completion queue's receiving end.
#[derive(Debug)]
pub struct DrainCycle {
    completions: CompletionReceiver,
}

impl DrainCycle {
    pub fn new(completions: CompletionReceiver) -> Self {
        Self { completions }
    }

    /// Results waiting for the next tick.
    pub fn queued(&self) -> usize {
        self.completions.len()
    }

    /// Stops accepting results; later pushes fail and are discarded by their
    /// producers.
    pub fn close(&mut self) {
        self.completions.close();
    }

    /// Drains everything queued right now. Never waits for more.
    pub fn run(
        &mut self,
        io: &mut dyn ReactorIo,
        writes: &mut PendingWrites,
        pool: &mut ConnectionPool,
    ) -> DrainStats {
        let mut stats = DrainStats::default();

        while let Some(result) = self.completions.try_pop() {
            let (mut conn, outcome) = result.into_parts();
            match outcome {
                Outcome::Succeeded => {
                    let response = Response::from_staged(conn.request_mut());
                    trace!(conn = %conn.id(), status = %response.status(), "writing staged response");
                    response.write_to(conn.write_buf_mut());
                    stats.succeeded += 1;
                }
                Outcome::Failed(e) => {
                    trace!(conn = %conn.id(), error = %e, "writing internal error");
                    conn.write_buf_mut()
                        .extend_from_slice(canned::INTERNAL_SERVER_ERROR);
                    stats.failed += 1;
                }
            }
            if !writes.start(io, conn, pool) {
                stats.write_errors += 1;
            }
        }

        stats
    }
}
