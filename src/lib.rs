//! # fluxhttp
//!
//! A minimal HTTP/1.1 front-end that bridges a single-threaded, non-blocking
//! reactor to asynchronous application callbacks.
//!
//! The reactor thread accepts sockets, buffers and parses requests, and writes
//! responses. Each parsed request is handed to the application callback on a
//! worker runtime; the finished result comes back through a bounded completion
//! queue that a periodic timer drains on the reactor thread.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fluxhttp::{Server, ServerConfig, StatusCode, TcpReactor, app_fn};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::new(ServerConfig::default(), TcpReactor::new());
//!     server.start(app_fn(|env| Box::pin(async move {
//!         let path = env.path().unwrap_or("/").to_owned();
//!         env.set_status(StatusCode::Ok);
//!         env.set_body(format!("Hello from {path}"));
//!         Ok(())
//!     })))?;
//!     if let Some(address) = server.local_addr() {
//!         println!("Listening on http://{address}");
//!     }
//!     server.wait()?;
//!     Ok(())
//! }
//! ```

// ── Reactor side ──────────────────────────────────────────────────────────────
pub mod connection;
pub mod drain;
pub mod http;
pub mod pool;
pub mod reactor;

// ── Worker side ───────────────────────────────────────────────────────────────
pub mod dispatch;
pub mod queue;

// ── Lifecycle ─────────────────────────────────────────────────────────────────
pub mod config;
pub mod server;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use config::{ConfigError, ServerConfig};
pub use connection::RequestMap;
pub use dispatch::{AppError, AppFunc, app_fn};
pub use http::{Headers, Method, Response, StatusCode};
pub use reactor::TcpReactor;
pub use server::{Server, ServerError, ServerState, StartupStep};
