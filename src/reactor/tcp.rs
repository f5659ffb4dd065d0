//! Tokio-backed reactor.
//!
//! Runs a current-thread Tokio runtime on whichever thread calls
//! [`Reactor::run`]. Reads happen in small per-socket tasks that forward chunks
//! into a bounded channel; the loop itself pulls from that channel, the
//! listener and the timer, and invokes the handler callbacks one at a time.
//! All of those tasks share the reactor thread, so callbacks never race each
//! other.
//!
//! Each pass of the loop checks stop, then the timer, then the listener, and
//! only then handles a bounded batch of socket events, so a busy peer cannot
//! hold off the timer or new accepts.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket};
use tokio::runtime::{Builder, Runtime};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, MissedTickBehavior, Sleep};
use tracing::{debug, error, info, trace};

use super::{
    ListenerHandle, LoopHandle, Reactor, ReactorError, ReactorEvents, ReactorIo, SocketHandle,
    StopHandle, TimerHandle,
};

/// Bytes requested from the socket per read.
const READ_CHUNK: usize = 4096;

/// Socket events buffered between the socket tasks and the loop. Readers
/// wait when it is full.
const EVENT_CAPACITY: usize = 1024;

/// Socket events handled per loop pass before stop, timer and accept are
/// checked again.
const EVENTS_PER_PASS: usize = 64;

/// Pause after a failed accept (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
struct TimerSpec {
    handle: TimerHandle,
    delay: Duration,
    interval: Duration,
}

/// Events produced by socket tasks and consumed by the loop.
enum SocketEvent {
    Data(SocketHandle, Bytes),
    Written(SocketHandle, io::Result<()>, OwnedWriteHalf),
}

struct SocketEntry {
    // `None` while a write task owns the half.
    writer: Option<OwnedWriteHalf>,
    reader: JoinHandle<()>,
    reading: bool,
}

/// Keeps the listener idle for a while after an accept error.
#[derive(Default)]
struct AcceptBackoff {
    until: Option<Pin<Box<Sleep>>>,
}

impl AcceptBackoff {
    fn arm(&mut self) {
        self.until = Some(Box::pin(time::sleep(ACCEPT_BACKOFF)));
    }

    fn is_armed(&self) -> bool {
        self.until.is_some()
    }

    /// Resolves when the armed pause is over; never resolves if unarmed.
    async fn elapsed(&mut self) {
        match self.until.as_mut() {
            Some(sleep) => {
                sleep.await;
                self.until = None;
            }
            None => std::future::pending().await,
        }
    }
}

/// The bundled [`Reactor`] implementation over Tokio's TCP primitives.
///
/// # Examples
///
/// ```rust,no_run
/// use fluxhttp::{Server, ServerConfig, TcpReactor};
///
/// let server = Server::new(ServerConfig::default(), TcpReactor::new());
/// ```
pub struct TcpReactor {
    runtime: Option<Runtime>,
    listener: Option<TcpListener>,
    listener_handle: Option<ListenerHandle>,
    local_addr: Option<SocketAddr>,
    timer: Option<TimerSpec>,
    stop: Arc<Notify>,
    next_socket: u64,
}

impl Default for TcpReactor {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpReactor {
    pub fn new() -> Self {
        Self {
            runtime: None,
            listener: None,
            listener_handle: None,
            local_addr: None,
            timer: None,
            stop: Arc::new(Notify::new()),
            next_socket: 0,
        }
    }
}

impl Reactor for TcpReactor {
    fn init(&mut self) -> Result<LoopHandle, ReactorError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(ReactorError::Init)?;
        self.runtime = Some(runtime);
        Ok(LoopHandle::from_raw(0))
    }

    fn listen(&mut self, addr: SocketAddr, backlog: u32) -> Result<ListenerHandle, ReactorError> {
        let runtime = self.runtime.as_ref().ok_or(ReactorError::NotInitialized)?;
        // Registering the listener needs the runtime's I/O driver in scope.
        let _guard = runtime.enter();

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(ReactorError::Init)?;
        socket
            .set_reuseaddr(true)
            .map_err(|source| ReactorError::Bind { addr, source })?;
        socket
            .bind(addr)
            .map_err(|source| ReactorError::Bind { addr, source })?;
        let listener = socket.listen(backlog).map_err(ReactorError::Listen)?;

        self.local_addr = Some(listener.local_addr()?);
        self.listener = Some(listener);
        let handle = ListenerHandle::from_raw(0);
        self.listener_handle = Some(handle);
        Ok(handle)
    }

    fn local_addr(&self, listener: ListenerHandle) -> Option<SocketAddr> {
        if self.listener_handle == Some(listener) {
            self.local_addr
        } else {
            None
        }
    }

    fn start_timer(
        &mut self,
        delay: Duration,
        interval: Duration,
    ) -> Result<TimerHandle, ReactorError> {
        if self.runtime.is_none() {
            return Err(ReactorError::NotInitialized);
        }
        if interval.is_zero() {
            return Err(ReactorError::Timer {
                reason: "interval must be non-zero".to_owned(),
            });
        }
        let handle = TimerHandle::from_raw(0);
        self.timer = Some(TimerSpec {
            handle,
            delay,
            interval,
        });
        Ok(handle)
    }

    fn stop_handle(&self) -> StopHandle {
        let stop = Arc::clone(&self.stop);
        StopHandle::new(move || stop.notify_one())
    }

    fn run(&mut self, events: &mut dyn ReactorEvents) -> Result<(), ReactorError> {
        let runtime = self.runtime.as_ref().ok_or(ReactorError::NotInitialized)?;
        let listener = self.listener.take().ok_or(ReactorError::NotInitialized)?;
        let looper = EventLoop {
            listener,
            timer: self.timer,
            stop: Arc::clone(&self.stop),
            next_socket: &mut self.next_socket,
        };
        runtime.block_on(looper.run(events));
        Ok(())
    }
}

struct EventLoop<'a> {
    listener: TcpListener,
    timer: Option<TimerSpec>,
    stop: Arc<Notify>,
    next_socket: &'a mut u64,
}

impl EventLoop<'_> {
    async fn run(self, events: &mut dyn ReactorEvents) {
        let Self {
            listener,
            timer,
            stop,
            next_socket,
        } = self;

        let (tx, mut rx) = mpsc::channel::<SocketEvent>(EVENT_CAPACITY);
        let mut sockets: HashMap<SocketHandle, SocketEntry> = HashMap::new();
        let mut backoff = AcceptBackoff::default();
        let mut ticker = timer.map(|spec| {
            let mut interval = time::interval_at(Instant::now() + spec.delay, spec.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            (spec.handle, interval)
        });

        info!(address = ?listener.local_addr().ok(), "reactor loop running");

        loop {
            tokio::select! {
                biased;

                _ = stop.notified() => {
                    debug!("reactor stop requested");
                    break;
                }

                timer = tick(&mut ticker) => {
                    let mut io = LoopIo { sockets: &mut sockets, tx: &tx };
                    events.on_timer_tick(&mut io, timer);
                }

                _ = backoff.elapsed(), if backoff.is_armed() => {
                    debug!("resuming accept");
                }

                accepted = listener.accept(), if !backoff.is_armed() => match accepted {
                    Ok((stream, peer)) => {
                        *next_socket += 1;
                        let socket = SocketHandle::from_raw(*next_socket);
                        debug!(%socket, %peer, "connection accepted");

                        let (read_half, write_half) = stream.into_split();
                        let reader = tokio::spawn(read_loop(read_half, socket, tx.clone()));
                        sockets.insert(
                            socket,
                            SocketEntry { writer: Some(write_half), reader, reading: true },
                        );

                        let mut io = LoopIo { sockets: &mut sockets, tx: &tx };
                        events.on_accept(&mut io, socket);
                    }
                    Err(e) => {
                        error!(error = %e, backoff = ?ACCEPT_BACKOFF, "failed to accept connection");
                        backoff.arm();
                    }
                },

                Some(event) = rx.recv() => {
                    let mut io = LoopIo { sockets: &mut sockets, tx: &tx };
                    deliver(events, &mut io, event);
                    for _ in 1..EVENTS_PER_PASS {
                        match rx.try_recv() {
                            Ok(event) => deliver(events, &mut io, event),
                            Err(_) => break,
                        }
                    }
                }
            }
        }

        for entry in sockets.values() {
            entry.reader.abort();
        }
        info!(open_sockets = sockets.len(), "reactor loop stopped");
    }
}

fn deliver(events: &mut dyn ReactorEvents, io: &mut LoopIo<'_>, event: SocketEvent) {
    match event {
        SocketEvent::Data(socket, chunk) => {
            if io.sockets.get(&socket).is_some_and(|entry| entry.reading) {
                events.on_data(io, socket, &chunk);
            }
        }
        SocketEvent::Written(socket, result, writer) => match io.sockets.get_mut(&socket) {
            Some(entry) => {
                entry.writer = Some(writer);
                events.on_write_complete(io, socket, result);
            }
            None => trace!(%socket, "write finished after close"),
        },
    }
}

async fn tick(ticker: &mut Option<(TimerHandle, Interval)>) -> TimerHandle {
    match ticker {
        Some((handle, interval)) => {
            interval.tick().await;
            *handle
        }
        None => std::future::pending().await,
    }
}

/// Forwards chunks from one socket into the loop until EOF or error.
///
/// Both EOF and read errors are reported as a single empty chunk.
async fn read_loop(
    mut reader: OwnedReadHalf,
    socket: SocketHandle,
    tx: mpsc::Sender<SocketEvent>,
) {
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    loop {
        buf.reserve(READ_CHUNK);
        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                let _ = tx.send(SocketEvent::Data(socket, Bytes::new())).await;
                break;
            }
            Ok(_) => {
                let chunk = buf.split().freeze();
                if tx.send(SocketEvent::Data(socket, chunk)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(%socket, error = %e, "read failed, treating as close");
                let _ = tx.send(SocketEvent::Data(socket, Bytes::new())).await;
                break;
            }
        }
    }
}

struct LoopIo<'a> {
    sockets: &'a mut HashMap<SocketHandle, SocketEntry>,
    tx: &'a mpsc::Sender<SocketEvent>,
}

impl ReactorIo for LoopIo<'_> {
    fn write(&mut self, socket: SocketHandle, bytes: Bytes) -> Result<(), ReactorError> {
        let entry = self
            .sockets
            .get_mut(&socket)
            .ok_or(ReactorError::UnknownSocket(socket))?;
        let mut writer = entry.writer.take().ok_or(ReactorError::WriteBusy(socket))?;
        let tx = self.tx.clone();

        tokio::spawn(async move {
            let result = match writer.write_all(&bytes).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            };
            let _ = tx.send(SocketEvent::Written(socket, result, writer)).await;
        });
        Ok(())
    }

    fn stop_reading(&mut self, socket: SocketHandle) {
        if let Some(entry) = self.sockets.get_mut(&socket) {
            entry.reader.abort();
            entry.reading = false;
            trace!(%socket, "reading stopped");
        }
    }

    fn close(&mut self, socket: SocketHandle) {
        if let Some(entry) = self.sockets.remove(&socket) {
            entry.reader.abort();
            trace!(%socket, "socket closed");
        }
    }
}
