//! Server lifecycle: `Created → Running → Stopped`.
//!
//! [`Server::start`] spawns a dedicated reactor thread, brings the reactor up
//! (init, bind + listen, drain timer), pre-warms the connection pool, wires the
//! dispatcher to the completion queue and enters the event loop. It returns
//! once the reactor is listening, or with the error of the step that failed.
//! Application callbacks run on a separate multi-threaded Tokio runtime owned
//! by the server.
//!
//! [`Server::stop`] asks the reactor to halt and raises the cancellation
//! signal. Callbacks already running are left to finish; their results are
//! dropped if the reactor is gone by then.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, mpsc};
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, error, info};

use crate::config::{ConfigError, ServerConfig};
use crate::dispatch::{AppFunc, CancelSignal, Dispatcher};
use crate::drain::DrainCycle;
use crate::pool::ConnectionPool;
use crate::queue::completion_queue;
use crate::reactor::{
    ListenerHandle, LoopHandle, Reactor, ReactorError, StopHandle, TcpReactor, TimerHandle,
};

mod bridge;

use bridge::Bridge;

/// The startup step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupStep {
    WorkerRuntime,
    ReactorThread,
    ReactorInit,
    Listen,
    Timer,
}

impl fmt::Display for StartupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::WorkerRuntime => "worker runtime setup",
            Self::ReactorThread => "reactor thread spawn",
            Self::ReactorInit => "reactor init",
            Self::Listen => "bind/listen",
            Self::Timer => "timer setup",
        })
    }
}

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server is already started")]
    AlreadyStarted,

    #[error("server is not running")]
    NotStarted,

    #[error("server is already stopped")]
    AlreadyStopped,

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("startup failed during {step}: {source}")]
    Startup {
        step: StartupStep,
        #[source]
        source: ReactorError,
    },

    #[error("reactor failed: {0}")]
    Reactor(#[source] ReactorError),

    #[error("reactor thread panicked")]
    ReactorPanicked,
}

impl ServerError {
    fn startup(step: StartupStep) -> impl FnOnce(ReactorError) -> Self {
        move |source| Self::Startup { step, source }
    }
}

/// Observable lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerState {
    /// Constructed, never started.
    Created = 0,
    /// `start` is in progress.
    Starting = 1,
    Running = 2,
    Stopped = 3,
    /// `start` failed; the server cannot be started again.
    Failed = 4,
}

impl ServerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Created,
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopped,
            _ => Self::Failed,
        }
    }
}

/// Handles reported by the reactor thread once it is listening.
#[derive(Debug)]
struct Ready {
    loop_handle: LoopHandle,
    listener: ListenerHandle,
    timer: TimerHandle,
    local_addr: Option<SocketAddr>,
    stop: StopHandle,
}

/// Everything that exists only while started.
struct Running {
    ready: Ready,
    thread: Option<JoinHandle<Result<(), ReactorError>>>,
    workers: Option<Runtime>,
}

/// HTTP front-end over a single-threaded reactor.
///
/// # Examples
///
/// ```rust,no_run
/// use fluxhttp::{Server, ServerConfig, TcpReactor};
/// use fluxhttp::dispatch::app_fn;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let server = Server::new(ServerConfig::default(), TcpReactor::new());
///     server.start(app_fn(|env| Box::pin(async move {
///         env.set_body("Hello!");
///         Ok(())
///     })))?;
///     server.wait()?;
///     Ok(())
/// }
/// ```
pub struct Server<R: Reactor = TcpReactor> {
    config: ServerConfig,
    state: AtomicU8,
    reactor: Mutex<Option<R>>,
    cancel: CancelSignal,
    running: Mutex<Option<Running>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<R: Reactor> Server<R> {
    /// Builds an idle server around an injected reactor.
    pub fn new(config: ServerConfig, reactor: R) -> Self {
        Self {
            config,
            state: AtomicU8::new(ServerState::Created as u8),
            reactor: Mutex::new(Some(reactor)),
            cancel: CancelSignal::new(),
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// The address the listener is bound to, once running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.running)
            .as_ref()
            .and_then(|running| running.ready.local_addr)
    }

    /// Starts serving, with `app` handling every parsed request.
    ///
    /// Returns once the reactor thread is listening; the event loop keeps
    /// running in the background until [`stop`](Self::stop).
    ///
    /// # Errors
    ///
    /// - [`ServerError::Config`]: invalid configuration; nothing changes.
    /// - [`ServerError::AlreadyStarted`]: any call after the first.
    /// - [`ServerError::Startup`]: a startup step failed; the server moves
    ///   to [`ServerState::Failed`].
    pub fn start(&self, app: AppFunc) -> Result<(), ServerError> {
        self.config.validate()?;
        self.state
            .compare_exchange(
                ServerState::Created as u8,
                ServerState::Starting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| ServerError::AlreadyStarted)?;

        match self.launch(app) {
            Ok(running) => {
                info!(
                    address = ?running.ready.local_addr,
                    event_loop = %running.ready.loop_handle,
                    listener = %running.ready.listener,
                    timer = %running.ready.timer,
                    "fluxhttp listening"
                );
                *lock(&self.running) = Some(running);
                self.state
                    .store(ServerState::Running as u8, Ordering::Release);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "server failed to start");
                self.state.store(ServerState::Failed as u8, Ordering::Release);
                Err(e)
            }
        }
    }

    fn launch(&self, app: AppFunc) -> Result<Running, ServerError> {
        let mut workers = Builder::new_multi_thread();
        workers.thread_name("fluxhttp-worker").enable_all();
        if let Some(threads) = self.config.worker_threads {
            workers.worker_threads(threads);
        }
        let workers = workers.build().map_err(|e| ServerError::Startup {
            step: StartupStep::WorkerRuntime,
            source: ReactorError::Io(e),
        })?;

        let reactor = lock(&self.reactor)
            .take()
            .ok_or(ServerError::AlreadyStarted)?;

        let (completions, receiver) = completion_queue(self.config.queue_capacity);
        let dispatcher = Dispatcher::new(
            app,
            completions,
            self.cancel.clone(),
            workers.handle().clone(),
        );

        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let config = self.config.clone();
        let thread = thread::Builder::new()
            .name("fluxhttp-reactor".to_owned())
            .spawn(move || {
                let mut reactor = reactor;
                let ready = match bring_up(&mut reactor, &config) {
                    Ok(ready) => ready,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return Ok(());
                    }
                };

                let pool = ConnectionPool::with_capacity(config.initial_pool_size);
                let mut bridge = Bridge::new(
                    pool,
                    dispatcher,
                    DrainCycle::new(receiver),
                    config.max_request_size,
                );
                if ready_tx.send(Ok(ready)).is_err() {
                    return Ok(());
                }

                let result = reactor.run(&mut bridge);
                bridge.shutdown();
                result
            })
            .map_err(|e| ServerError::Startup {
                step: StartupStep::ReactorThread,
                source: ReactorError::Io(e),
            })?;

        match ready_rx.recv() {
            Ok(Ok(ready)) => Ok(Running {
                ready,
                thread: Some(thread),
                workers: Some(workers),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                workers.shutdown_background();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                workers.shutdown_background();
                Err(ServerError::ReactorPanicked)
            }
        }
    }

    /// Halts the reactor and cancels further dispatching.
    ///
    /// Does not wait for the reactor thread; see [`wait`](Self::wait).
    ///
    /// # Errors
    ///
    /// - [`ServerError::NotStarted`]: never started (or start failed).
    /// - [`ServerError::AlreadyStopped`]: any call after the first.
    pub fn stop(&self) -> Result<(), ServerError> {
        match self.state.compare_exchange(
            ServerState::Running as u8,
            ServerState::Stopped as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(s) if s == ServerState::Stopped as u8 => return Err(ServerError::AlreadyStopped),
            Err(_) => return Err(ServerError::NotStarted),
        }

        if let Some(running) = lock(&self.running).as_ref() {
            running.ready.stop.stop();
        }
        self.cancel.cancel();
        info!("fluxhttp stopping");
        Ok(())
    }

    /// Blocks until the reactor thread exits.
    ///
    /// # Errors
    ///
    /// - [`ServerError::NotStarted`]: the server was never running.
    /// - [`ServerError::Reactor`]: the event loop ended with an error.
    /// - [`ServerError::ReactorPanicked`]: the reactor thread panicked.
    pub fn wait(&self) -> Result<(), ServerError> {
        let thread = match lock(&self.running).as_mut() {
            Some(running) => running.thread.take(),
            None => return Err(ServerError::NotStarted),
        };
        let Some(thread) = thread else {
            return Ok(());
        };
        match thread.join() {
            Ok(Ok(())) => {
                debug!("reactor thread exited");
                Ok(())
            }
            Ok(Err(e)) => Err(ServerError::Reactor(e)),
            Err(_) => Err(ServerError::ReactorPanicked),
        }
    }
}

/// Runs the reactor's startup steps, in order, on the reactor thread.
fn bring_up<R: Reactor>(reactor: &mut R, config: &ServerConfig) -> Result<Ready, ServerError> {
    let loop_handle = reactor
        .init()
        .map_err(ServerError::startup(StartupStep::ReactorInit))?;
    let listener = reactor
        .listen(config.address, config.listen_backlog)
        .map_err(ServerError::startup(StartupStep::Listen))?;
    let timer = reactor
        .start_timer(config.timer_delay(), config.timer_interval())
        .map_err(ServerError::startup(StartupStep::Timer))?;

    Ok(Ready {
        loop_handle,
        listener,
        timer,
        local_addr: reactor.local_addr(listener),
        stop: reactor.stop_handle(),
    })
}

impl<R: Reactor> Drop for Server<R> {
    fn drop(&mut self) {
        let running = self
            .running
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut running) = running {
            running.ready.stop.stop();
            self.cancel.cancel();
            if let Some(thread) = running.thread.take() {
                let _ = thread.join();
            }
            if let Some(workers) = running.workers.take() {
                workers.shutdown_background();
            }
        }
    }
}

impl<R: Reactor> fmt::Debug for Server<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("address", &self.config.address)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::time::Duration;

    use super::*;
    use crate::dispatch::{AppError, app_fn};
    use crate::http::StatusCode;
    use crate::reactor::ReactorEvents;

    fn config() -> ServerConfig {
        ServerConfig::new("127.0.0.1:0".parse().unwrap())
            .with_initial_pool_size(2)
            .with_worker_threads(2)
            .with_timer(Duration::from_millis(5), Duration::from_millis(2))
    }

    fn echo_app() -> AppFunc {
        app_fn(|env| {
            Box::pin(async move {
                match env.path() {
                    Some("/fail") => Err(AppError::new("requested failure")),
                    Some("/slow") => {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        env.set_body("slow");
                        Ok(())
                    }
                    path => {
                        let path = path.unwrap_or_default().to_owned();
                        env.set_status(StatusCode::Ok);
                        env.response_headers_mut().insert("X-Path", path.clone());
                        env.set_body(format!("hello from {path}"));
                        Ok(())
                    }
                }
            })
        })
    }

    fn started() -> Server {
        let server = Server::new(config(), TcpReactor::new());
        server.start(echo_app()).unwrap();
        server
    }

    fn request(addr: SocketAddr, raw: &[u8]) -> String {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream.write_all(raw).unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).unwrap();
        out
    }

    fn get(addr: SocketAddr, path: &str) -> String {
        request(addr, format!("GET {path} HTTP/1.1\r\nHost: test\r\n\r\n").as_bytes())
    }

    #[test]
    fn serves_staged_response() {
        let server = started();
        let addr = server.local_addr().unwrap();

        let response = get(addr, "/hello");
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
        assert!(response.contains("X-Path: /hello\r\n"));
        assert!(response.contains("Connection: close\r\n"));
        assert!(response.ends_with("hello from /hello"));

        server.stop().unwrap();
        server.wait().unwrap();
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[test]
    fn failing_callback_yields_internal_error() {
        let server = started();
        let response = get(server.local_addr().unwrap(), "/fail");
        assert!(response.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(response.ends_with("Internal Server Error"));
    }

    #[test]
    fn malformed_request_yields_bad_request() {
        let server = started();
        let response = request(server.local_addr().unwrap(), b"\x01garbage\r\n\r\n");
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[test]
    fn concurrent_clients_beyond_pool_size_are_all_served() {
        let server = started();
        let addr = server.local_addr().unwrap();

        let clients: Vec<_> = (0..8)
            .map(|i| {
                thread::spawn(move || {
                    let path = if i % 2 == 0 { "/slow".to_owned() } else { format!("/c{i}") };
                    (path.clone(), get(addr, &path))
                })
            })
            .collect();

        for client in clients {
            let (path, response) = client.join().unwrap();
            assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{path}: {response}");
            if path == "/slow" {
                assert!(response.ends_with("slow"));
            } else {
                assert!(response.ends_with(&format!("hello from {path}")));
            }
        }
    }

    #[test]
    fn peer_closing_early_does_not_disturb_others() {
        let server = started();
        let addr = server.local_addr().unwrap();

        drop(TcpStream::connect(addr).unwrap());
        {
            let mut half = TcpStream::connect(addr).unwrap();
            half.write_all(b"GET /partial HT").unwrap();
        }

        assert!(get(addr, "/after").ends_with("hello from /after"));
    }

    #[test]
    fn second_start_fails_and_first_keeps_running() {
        let server = started();
        assert!(matches!(
            server.start(echo_app()),
            Err(ServerError::AlreadyStarted)
        ));
        assert_eq!(server.state(), ServerState::Running);
        assert!(get(server.local_addr().unwrap(), "/still").ends_with("hello from /still"));
    }

    #[test]
    fn stop_before_start_fails_without_state_change() {
        let server = Server::new(config(), TcpReactor::new());
        assert!(matches!(server.stop(), Err(ServerError::NotStarted)));
        assert_eq!(server.state(), ServerState::Created);
        assert!(matches!(server.wait(), Err(ServerError::NotStarted)));

        server.start(echo_app()).unwrap();
        assert_eq!(server.state(), ServerState::Running);
    }

    #[test]
    fn second_stop_fails() {
        let server = started();
        server.stop().unwrap();
        assert!(matches!(server.stop(), Err(ServerError::AlreadyStopped)));
        server.wait().unwrap();
        server.wait().unwrap();
    }

    #[test]
    fn invalid_config_is_rejected_before_starting() {
        let server = Server::new(config().with_queue_capacity(0), TcpReactor::new());
        assert!(matches!(
            server.start(echo_app()),
            Err(ServerError::Config(_))
        ));
        assert_eq!(server.state(), ServerState::Created);
    }

    #[test]
    fn bind_failure_is_reported_as_listen_step() {
        let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = holder.local_addr().unwrap();

        let server = Server::new(config().with_address(taken), TcpReactor::new());
        match server.start(echo_app()) {
            Err(ServerError::Startup { step, .. }) => assert_eq!(step, StartupStep::Listen),
            other => panic!("expected startup failure, got {other:?}"),
        }
        assert_eq!(server.state(), ServerState::Failed);
        assert!(matches!(server.stop(), Err(ServerError::NotStarted)));
    }

    /// Reactor whose timer can never be armed.
    struct NoTimerReactor(TcpReactor);

    impl Reactor for NoTimerReactor {
        fn init(&mut self) -> Result<LoopHandle, ReactorError> {
            self.0.init()
        }

        fn listen(&mut self, addr: SocketAddr, backlog: u32) -> Result<ListenerHandle, ReactorError> {
            self.0.listen(addr, backlog)
        }

        fn local_addr(&self, listener: ListenerHandle) -> Option<SocketAddr> {
            self.0.local_addr(listener)
        }

        fn start_timer(&mut self, _: Duration, _: Duration) -> Result<TimerHandle, ReactorError> {
            Err(ReactorError::Timer {
                reason: "no timers here".to_owned(),
            })
        }

        fn stop_handle(&self) -> StopHandle {
            self.0.stop_handle()
        }

        fn run(&mut self, events: &mut dyn ReactorEvents) -> Result<(), ReactorError> {
            self.0.run(events)
        }
    }

    #[test]
    fn timer_failure_is_reported_as_timer_step() {
        let server = Server::new(config(), NoTimerReactor(TcpReactor::new()));
        match server.start(echo_app()) {
            Err(ServerError::Startup { step, source }) => {
                assert_eq!(step, StartupStep::Timer);
                assert!(matches!(source, ReactorError::Timer { .. }));
            }
            other => panic!("expected startup failure, got {other:?}"),
        }
        assert_eq!(server.local_addr(), None);
    }

    #[test]
    fn results_finishing_after_stop_are_dropped_quietly() {
        let server = started();
        let addr = server.local_addr().unwrap();

        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            stream
                .write_all(b"GET /slow HTTP/1.1\r\nHost: test\r\n\r\n")
                .unwrap();
            let mut out = Vec::new();
            let _ = stream.read_to_end(&mut out);
            out
        });

        thread::sleep(Duration::from_millis(30));
        server.stop().unwrap();
        server.wait().unwrap();

        // The socket closes with the reactor; no response is owed.
        let out = client.join().unwrap();
        assert!(out.is_empty() || out.starts_with(b"HTTP/1.1"));
    }

    #[test]
    fn fresh_client_is_served_while_others_keep_streaming() {
        let server = started();
        let addr = server.local_addr().unwrap();
        let until = std::time::Instant::now() + Duration::from_millis(800);

        let streamers: Vec<_> = (0..16)
            .map(|_| {
                thread::spawn(move || {
                    let mut stream = TcpStream::connect(addr).unwrap();
                    stream
                        .set_write_timeout(Some(Duration::from_millis(200)))
                        .unwrap();
                    if stream
                        .write_all(b"GET /slow HTTP/1.1\r\nHost: test\r\n\r\n")
                        .is_err()
                    {
                        return;
                    }
                    let junk = vec![b'x'; 64 * 1024];
                    while std::time::Instant::now() < until {
                        if stream.write_all(&junk).is_err() {
                            break;
                        }
                    }
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        let started_at = std::time::Instant::now();
        let response = get(addr, "/quick");
        assert!(response.ends_with("hello from /quick"), "{response}");
        assert!(started_at.elapsed() < Duration::from_secs(3));

        for streamer in streamers {
            streamer.join().unwrap();
        }
    }

    #[test]
    fn drop_shuts_down_running_server() {
        let addr = {
            let server = started();
            server.local_addr().unwrap()
        };
        thread::sleep(Duration::from_millis(20));
        assert!(TcpStream::connect(addr).is_err());
    }

    #[test]
    fn startup_step_names_are_readable() {
        assert_eq!(StartupStep::Listen.to_string(), "bind/listen");
        let err = ServerError::Startup {
            step: StartupStep::Timer,
            source: ReactorError::Timer {
                reason: "x".into(),
            },
        };
        assert_eq!(err.to_string(), "startup failed during timer setup: timer setup failed: x");
    }
}
