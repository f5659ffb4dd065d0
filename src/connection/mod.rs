//! Per-socket connection state.
//!
//! A [`Connection`] is a reusable container: the pool hands it out on accept,
//! the reactor fills its read buffer and request map, the dispatcher carries
//! it to a worker, and the drain cycle serializes the response into its write
//! buffer before it goes back to the pool.
//!
//! Connections are plain owned values. Whoever holds one has exclusive access,
//! so the "one owner at a time" rule is enforced by the compiler rather than by
//! bookkeeping.

use std::fmt;

use bytes::BytesMut;

use crate::http::parser::{self, ParseStatus, RequestError};
use crate::reactor::SocketHandle;

pub mod keys;
mod map;

pub use map::RequestMap;

/// Initial capacity of each connection's read and write buffers.
const INITIAL_BUF_SIZE: usize = 4096;

/// Pool-assigned identity of a connection object, stable across reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Where a connection currently sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Idle in the pool.
    Pooled,
    /// Attached to a socket; the reactor is accumulating request bytes.
    Reading,
    /// Owned by a worker while the application callback runs.
    Dispatched,
    /// Back on the reactor thread with a response in flight.
    Writing,
}

/// Mutable state for one socket.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    socket: Option<SocketHandle>,
    state: ConnectionState,
    request: RequestMap,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl Connection {
    pub fn new(id: ConnectionId) -> Self {
        Self {
            id,
            socket: None,
            state: ConnectionState::Pooled,
            request: RequestMap::new(),
            read_buf: BytesMut::with_capacity(INITIAL_BUF_SIZE),
            write_buf: BytesMut::with_capacity(INITIAL_BUF_SIZE),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The socket this connection is serving, or `None` while pooled.
    pub fn socket(&self) -> Option<SocketHandle> {
        self.socket
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn request(&self) -> &RequestMap {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut RequestMap {
        &mut self.request
    }

    pub(crate) fn read_buf_mut(&mut self) -> &mut BytesMut {
        &mut self.read_buf
    }

    pub(crate) fn write_buf_mut(&mut self) -> &mut BytesMut {
        &mut self.write_buf
    }

    /// Runs the parser over everything buffered so far, filling the request
    /// map once a whole request is present.
    pub(crate) fn parse_buffered(&mut self, max_bytes: usize) -> Result<ParseStatus, RequestError> {
        parser::parse_with_limit(&self.read_buf, &mut self.request, max_bytes)
    }

    /// Binds a freshly leased connection to an accepted socket.
    pub(crate) fn attach(&mut self, socket: SocketHandle) {
        debug_assert_eq!(self.state, ConnectionState::Pooled);
        self.socket = Some(socket);
        self.state = ConnectionState::Reading;
    }

    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
    }

    /// Moves the request map out, leaving an empty one behind.
    pub(crate) fn take_request(&mut self) -> RequestMap {
        std::mem::take(&mut self.request)
    }

    pub(crate) fn restore_request(&mut self, request: RequestMap) {
        self.request = request;
    }

    /// Clears per-request state so the object can serve another socket.
    ///
    /// Buffers keep their allocation.
    pub(crate) fn reset(&mut self) {
        self.socket = None;
        self.state = ConnectionState::Pooled;
        self.request.clear();
        self.read_buf.clear();
        self.write_buf.clear();
    }
}
