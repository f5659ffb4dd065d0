//! Runs the application callback off the reactor thread.
//!
//! [`Dispatcher::dispatch`] moves a parsed [`Connection`] onto the worker
//! runtime, awaits the application callback against its request map, and
//! pushes exactly one [`DispatchResult`] into the completion queue once the
//! callback has finished, whether it completed immediately, suspended first,
//! failed, or panicked.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionState, RequestMap};
use crate::queue::{CompletionSender, DispatchResult, Outcome};

/// Heap-allocated, `Send` future borrowing for `'a`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The application callback.
///
/// Receives the request map, stages the response into it and resolves to
/// `Ok(())`, or resolves to an [`AppError`] to have the client receive a
/// `500 Internal Server Error`.
pub type AppFunc = Arc<
    dyn for<'a> Fn(&'a mut RequestMap) -> BoxFuture<'a, Result<(), AppError>>
        + Send
        + Sync
        + 'static,
>;

/// Wraps a closure as an [`AppFunc`].
///
/// # Examples
///
/// ```
/// use fluxhttp::dispatch::app_fn;
/// use fluxhttp::http::StatusCode;
///
/// let app = app_fn(|env| {
///     Box::pin(async move {
///         env.set_status(StatusCode::Ok);
///         env.set_body("hello");
///         Ok(())
///     })
/// });
/// ```
pub fn app_fn<F>(f: F) -> AppFunc
where
    F: for<'a> Fn(&'a mut RequestMap) -> BoxFuture<'a, Result<(), AppError>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

/// Failure reported by (or on behalf of) the application callback.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct AppError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl AppError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Wraps an underlying error, keeping it reachable through `source()`.
    pub fn from_error<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    fn panicked(err: tokio::task::JoinError) -> Self {
        let message = if err.is_panic() {
            "application callback panicked".to_owned()
        } else {
            "application callback was cancelled".to_owned()
        };
        Self {
            message,
            source: Some(Box::new(err)),
        }
    }
}

impl From<&str> for AppError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for AppError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

/// Errors returned by [`Dispatcher::dispatch`].
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The dispatcher no longer accepts work. The connection is handed back
    /// so the caller can release it.
    #[error("dispatcher is cancelled")]
    Cancelled(Connection),
}

/// One-shot cancellation flag shared by the server and the dispatcher.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    cancelled: Arc<AtomicBool>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the signal. Returns `false` if it was already raised.
    pub fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::AcqRel)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Hands requests to worker tasks and reports their completion.
pub struct Dispatcher {
    app: AppFunc,
    completions: CompletionSender,
    cancel: CancelSignal,
    workers: Handle,
    in_flight: Arc<AtomicUsize>,
}

impl Dispatcher {
    /// Binds the callback to the completion queue. Work is spawned on
    /// `workers`, which must be a runtime other than the reactor's.
    pub fn new(
        app: AppFunc,
        completions: CompletionSender,
        cancel: CancelSignal,
        workers: Handle,
    ) -> Self {
        Self {
            app,
            completions,
            cancel,
            workers,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Starts the application callback for `conn`'s request map.
    ///
    /// Returns as soon as the work is spawned; the result shows up in the
    /// completion queue later.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Cancelled`] after the cancel signal is raised.
    pub fn dispatch(&self, mut conn: Connection) -> Result<(), DispatchError> {
        if self.cancel.is_cancelled() {
            return Err(DispatchError::Cancelled(conn));
        }

        conn.set_state(ConnectionState::Dispatched);
        debug!(conn = %conn.id(), socket = ?conn.socket(), "dispatching request");

        let app = Arc::clone(&self.app);
        let completions = self.completions.clone();
        let in_flight = Arc::clone(&self.in_flight);
        in_flight.fetch_add(1, Ordering::AcqRel);

        self.workers.spawn(async move {
            let result = run_app(app, conn).await;
            if let Err(e) = completions.push(result).await {
                let conn = e.into_result().into_parts().0;
                warn!(conn = %conn.id(), "completion queue closed, dropping result");
            }
            in_flight.fetch_sub(1, Ordering::AcqRel);
        });
        Ok(())
    }

    /// Callbacks started but not yet enqueued.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Runs the callback in its own task so a panic cannot take the connection
/// down with it.
async fn run_app(app: AppFunc, mut conn: Connection) -> DispatchResult {
    let mut request = conn.take_request();
    let task = tokio::spawn(async move {
        let outcome = app(&mut request).await;
        (request, outcome)
    });

    let outcome = match task.await {
        Ok((request, outcome)) => {
            conn.restore_request(request);
            match outcome {
                Ok(()) => Outcome::Succeeded,
                Err(e) => {
                    warn!(conn = %conn.id(), error = %e, "application callback failed");
                    Outcome::Failed(e)
                }
            }
        }
        Err(join_err) => {
            let e = AppError::panicked(join_err);
            warn!(conn = %conn.id(), error = %e, "application callback aborted");
            Outcome::Failed(e)
        }
    };
    DispatchResult::new(conn, outcome)
}
