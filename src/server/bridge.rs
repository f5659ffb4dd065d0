//! Reactor-thread side of the server.
//!
//! [`Bridge`] receives every reactor callback. It owns the pool, the
//! connections currently reading, the connections with a write in flight and
//! the drain cycle; the only things that leave the reactor thread are
//! connections handed to the dispatcher, and they come back through the
//! completion queue.

use std::collections::HashMap;
use std::io;

use tracing::{debug, trace, warn};

use crate::connection::Connection;
use crate::dispatch::{DispatchError, Dispatcher};
use crate::drain::{DrainCycle, PendingWrites};
use crate::http::{ParseStatus, RequestError, canned};
use crate::pool::ConnectionPool;
use crate::reactor::{ReactorEvents, ReactorIo, SocketHandle, TimerHandle};

pub(crate) struct Bridge {
    pool: ConnectionPool,
    reading: HashMap<SocketHandle, Connection>,
    writes: PendingWrites,
    dispatcher: Dispatcher,
    drain: DrainCycle,
    max_request_size: usize,
}

impl Bridge {
    pub(crate) fn new(
        pool: ConnectionPool,
        dispatcher: Dispatcher,
        drain: DrainCycle,
        max_request_size: usize,
    ) -> Self {
        Self {
            pool,
            reading: HashMap::new(),
            writes: PendingWrites::new(),
            dispatcher,
            drain,
            max_request_size,
        }
    }

    /// Called once the reactor loop has returned. Results still arriving
    /// from workers are refused and dropped by their producers.
    pub(crate) fn shutdown(&mut self) {
        self.drain.close();
        debug!(
            reading = self.reading.len(),
            writing = self.writes.len(),
            queued = self.drain.queued(),
            in_flight = self.dispatcher.in_flight(),
            "bridge shut down"
        );
    }

    /// Answers `conn` with a fixed payload instead of dispatching it.
    fn reject(&mut self, io: &mut dyn ReactorIo, mut conn: Connection, payload: &'static [u8]) {
        if let Some(socket) = conn.socket() {
            io.stop_reading(socket);
        }
        conn.write_buf_mut().extend_from_slice(payload);
        self.writes.start(io, conn, &mut self.pool);
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &ConnectionPool {
        &self.pool
    }
}

impl ReactorEvents for Bridge {
    fn on_accept(&mut self, _io: &mut dyn ReactorIo, socket: SocketHandle) {
        let mut conn = self.pool.lease();
        conn.attach(socket);
        trace!(%socket, conn = %conn.id(), available = self.pool.available(), "leased connection");
        self.reading.insert(socket, conn);
    }

    fn on_data(&mut self, io: &mut dyn ReactorIo, socket: SocketHandle, chunk: &[u8]) {
        if chunk.is_empty() {
            match self.reading.remove(&socket) {
                Some(conn) => {
                    debug!(%socket, conn = %conn.id(), "peer closed before a full request");
                    io.close(socket);
                    self.pool.release(conn);
                }
                // Dispatched or writing: the write path releases it.
                None => trace!(%socket, "peer closed while a response is pending"),
            }
            return;
        }

        let Some(mut conn) = self.reading.remove(&socket) else {
            trace!(%socket, len = chunk.len(), "ignoring bytes for a busy connection");
            return;
        };
        conn.read_buf_mut().extend_from_slice(chunk);

        match conn.parse_buffered(self.max_request_size) {
            Ok(ParseStatus::Partial) => {
                self.reading.insert(socket, conn);
            }
            Ok(ParseStatus::Complete { consumed }) => {
                trace!(%socket, consumed, "request parsed");
                conn.read_buf_mut().clear();
                io.stop_reading(socket);
                if let Err(DispatchError::Cancelled(conn)) = self.dispatcher.dispatch(conn) {
                    debug!(%socket, "dispatcher cancelled, refusing request");
                    self.reject(io, conn, canned::SERVICE_UNAVAILABLE);
                }
            }
            Err(e @ RequestError::TooLarge { .. }) => {
                warn!(%socket, error = %e, "request too large, sending 413");
                self.reject(io, conn, canned::PAYLOAD_TOO_LARGE);
            }
            Err(e) => {
                warn!(%socket, error = %e, "bad request, sending 400");
                self.reject(io, conn, canned::BAD_REQUEST);
            }
        }
    }

    fn on_write_complete(
        &mut self,
        io: &mut dyn ReactorIo,
        socket: SocketHandle,
        result: io::Result<()>,
    ) {
        let Some(conn) = self.writes.finish(socket) else {
            trace!(%socket, "write completion for unknown socket");
            return;
        };
        if let Err(e) = result {
            debug!(%socket, error = %e, "response write failed");
        }
        io.close(socket);
        trace!(%socket, conn = %conn.id(), "releasing connection");
        self.pool.release(conn);
    }

    fn on_timer_tick(&mut self, io: &mut dyn ReactorIo, _timer: TimerHandle) {
        let stats = self.drain.run(io, &mut self.writes, &mut self.pool);
        if stats.total() > 0 {
            trace!(
                succeeded = stats.succeeded,
                failed = stats.failed,
                write_errors = stats.write_errors,
                "drain tick"
            );
        }
    }
}
