//! The reactor capability the server is built on.
//!
//! A reactor is a single-threaded, non-blocking event loop. It owns sockets,
//! the listener and the timer, and reports what happens to them through
//! [`ReactorEvents`] callbacks. Inside a callback the handler may issue
//! non-blocking writes and closes through [`ReactorIo`].
//!
//! The server never constructs a reactor itself; one is injected at
//! construction time. [`TcpReactor`] is the bundled implementation.
//!
//! ```text
//!   Reactor::run ──▶ on_accept / on_data / on_write_complete / on_timer_tick
//!                         │
//!                         └──▶ ReactorIo::write / ReactorIo::close
//! ```

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

pub mod tcp;

pub use tcp::TcpReactor;

/// Errors raised by a reactor implementation.
#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("reactor initialization failed: {0}")]
    Init(#[source] io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to listen: {0}")]
    Listen(#[source] io::Error),

    #[error("timer setup failed: {reason}")]
    Timer { reason: String },

    #[error("reactor used before init/listen")]
    NotInitialized,

    #[error("unknown or closed socket {0}")]
    UnknownSocket(SocketHandle),

    #[error("a write is already in flight on {0}")]
    WriteBusy(SocketHandle),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

macro_rules! opaque_handle {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(u64);

        impl $name {
            /// Wraps a reactor-specific identifier. Only reactor
            /// implementations should mint handles.
            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

opaque_handle!(
    /// Identity of an accepted socket, owned by the reactor.
    SocketHandle,
    "sock"
);
opaque_handle!(
    /// Identity of a listening socket.
    ListenerHandle,
    "listener"
);
opaque_handle!(
    /// Identity of a periodic timer.
    TimerHandle,
    "timer"
);
opaque_handle!(
    /// Identity of an initialized event loop.
    LoopHandle,
    "loop"
);

/// Thread-safe request to halt a running reactor.
///
/// Stopping is sticky: a stop requested before [`Reactor::run`] starts makes
/// `run` return as soon as it is entered.
#[derive(Clone)]
pub struct StopHandle {
    stop: Arc<dyn Fn() + Send + Sync>,
}

impl StopHandle {
    pub fn new(stop: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            stop: Arc::new(stop),
        }
    }

    pub fn stop(&self) {
        (self.stop)();
    }
}

impl fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopHandle").finish_non_exhaustive()
    }
}

/// Non-blocking operations available to a handler during a callback.
pub trait ReactorIo {
    /// Starts writing `bytes` to `socket`.
    ///
    /// Returns immediately; the outcome arrives later through
    /// [`ReactorEvents::on_write_complete`].
    fn write(&mut self, socket: SocketHandle, bytes: Bytes) -> Result<(), ReactorError>;

    /// Stops reading from `socket`. No further [`ReactorEvents::on_data`]
    /// calls arrive for it, end-of-stream included; writes and `close` still
    /// work.
    fn stop_reading(&mut self, socket: SocketHandle);

    /// Closes `socket`. No further events are delivered for it.
    fn close(&mut self, socket: SocketHandle);
}

/// Callbacks a reactor delivers on its own thread.
///
/// Implementations must never block: every callback runs on the single
/// reactor thread and stalls all other sockets while it executes.
pub trait ReactorEvents {
    /// A new connection was accepted on the listener.
    fn on_accept(&mut self, io: &mut dyn ReactorIo, socket: SocketHandle);

    /// Bytes arrived on `socket`. An empty chunk means the peer closed the
    /// connection or the read failed.
    fn on_data(&mut self, io: &mut dyn ReactorIo, socket: SocketHandle, chunk: &[u8]);

    /// A write started with [`ReactorIo::write`] finished.
    fn on_write_complete(
        &mut self,
        io: &mut dyn ReactorIo,
        socket: SocketHandle,
        result: io::Result<()>,
    );

    /// The periodic timer fired.
    fn on_timer_tick(&mut self, io: &mut dyn ReactorIo, timer: TimerHandle);
}

/// A single-threaded, non-blocking I/O event loop.
///
/// The methods are called in order on the thread that will run the loop:
/// [`init`](Self::init), [`listen`](Self::listen),
/// [`start_timer`](Self::start_timer), then [`run`](Self::run). Only the
/// [`StopHandle`] crosses threads.
pub trait Reactor: Send + 'static {
    fn init(&mut self) -> Result<LoopHandle, ReactorError>;

    /// Binds `addr` and starts listening with the given accept backlog.
    fn listen(&mut self, addr: SocketAddr, backlog: u32) -> Result<ListenerHandle, ReactorError>;

    /// The address actually bound by `listener` (resolves port 0).
    fn local_addr(&self, listener: ListenerHandle) -> Option<SocketAddr>;

    /// Arms a periodic timer: first tick after `delay`, then every `interval`.
    fn start_timer(
        &mut self,
        delay: Duration,
        interval: Duration,
    ) -> Result<TimerHandle, ReactorError>;

    fn stop_handle(&self) -> StopHandle;

    /// Runs the event loop until stopped, delivering callbacks to `events`.
    fn run(&mut self, events: &mut dyn ReactorEvents) -> Result<(), ReactorError>;
}
