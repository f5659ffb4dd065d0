//! Server construction-time configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{pool, queue};

/// Invalid configuration values.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("invalid configuration JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Settings fixed when a [`Server`](crate::Server) is built.
///
/// Every field has a default, so partial JSON documents are accepted.
///
/// # Examples
///
/// ```
/// use fluxhttp::ServerConfig;
///
/// let config = ServerConfig::from_json(r#"{ "address": "0.0.0.0:9000", "queue_capacity": 64 }"#).unwrap();
/// assert_eq!(config.address.port(), 9000);
/// assert_eq!(config.queue_capacity, 64);
/// assert_eq!(config.initial_pool_size, 128);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind. Port 0 picks a free port.
    pub address: SocketAddr,
    /// Connections built up front.
    pub initial_pool_size: usize,
    /// Completion queue capacity.
    pub queue_capacity: usize,
    /// Delay before the first drain tick, in milliseconds.
    pub timer_delay_ms: u64,
    /// Interval between drain ticks, in milliseconds.
    pub timer_interval_ms: u64,
    /// Pending-accept backlog passed to `listen`.
    pub listen_backlog: u32,
    /// Worker threads running application callbacks. `None` uses one per core.
    pub worker_threads: Option<usize>,
    /// Largest request (headers plus body) accepted, in bytes.
    pub max_request_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080),
            initial_pool_size: pool::DEFAULT_INITIAL_SIZE,
            queue_capacity: queue::DEFAULT_CAPACITY,
            timer_delay_ms: 100,
            timer_interval_ms: 10,
            listen_backlog: 128,
            worker_threads: None,
            max_request_size: 8 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            ..Self::default()
        }
    }

    /// Parses a (possibly partial) JSON document and validates it.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Json`] for malformed input, or any error from
    /// [`validate`](Self::validate).
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn with_address(mut self, address: SocketAddr) -> Self {
        self.address = address;
        self
    }

    #[must_use]
    pub fn with_initial_pool_size(mut self, size: usize) -> Self {
        self.initial_pool_size = size;
        self
    }

    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Sets the drain timer's initial delay and interval.
    ///
    /// The timer works in whole milliseconds; fractions round up, so any
    /// non-zero duration stays non-zero.
    #[must_use]
    pub fn with_timer(mut self, delay: Duration, interval: Duration) -> Self {
        self.timer_delay_ms = whole_millis(delay);
        self.timer_interval_ms = whole_millis(interval);
        self
    }

    #[must_use]
    pub fn with_listen_backlog(mut self, backlog: u32) -> Self {
        self.listen_backlog = backlog;
        self
    }

    #[must_use]
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = Some(threads);
        self
    }

    #[must_use]
    pub fn with_max_request_size(mut self, bytes: usize) -> Self {
        self.max_request_size = bytes;
        self
    }

    pub fn timer_delay(&self) -> Duration {
        Duration::from_millis(self.timer_delay_ms)
    }

    pub fn timer_interval(&self) -> Duration {
        Duration::from_millis(self.timer_interval_ms)
    }

    /// # Errors
    ///
    /// [`ConfigError::Zero`] for a zero queue capacity, timer interval,
    /// worker thread count or request size limit.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::Zero {
                field: "queue_capacity",
            });
        }
        if self.timer_interval_ms == 0 {
            return Err(ConfigError::Zero {
                field: "timer_interval_ms",
            });
        }
        if self.worker_threads == Some(0) {
            return Err(ConfigError::Zero {
                field: "worker_threads",
            });
        }
        if self.max_request_size == 0 {
            return Err(ConfigError::Zero {
                field: "max_request_size",
            });
        }
        Ok(())
    }
}

fn whole_millis(d: Duration) -> u64 {
    u64::try_from(d.as_nanos().div_ceil(1_000_000)).unwrap_or(u64::MAX)
}
