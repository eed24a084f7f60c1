//! Proxy configuration.
//!
//! Configuration is built in memory by the caller and is immutable once the
//! proxy starts. Directions are named from the client's point of view:
//! `read` degrades what the client reads, `write` degrades what it writes.

use std::time::Duration;

use crate::error::ProxyError;
use crate::proxy::Shaping;

/// Default listen address: loopback, ephemeral port.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:0";

/// Default connect timeout for dialing the target.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Highest accepted failure ratio (percent).
pub const MAX_FAILURE_RATIO: u8 = 100;

/// Degradation applied to one direction of every proxied connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Direction {
    /// Throughput cap in bytes per second (0 = unlimited).
    pub max_bytes_per_sec: u64,
    /// Fixed delay added to every operation (zero = none).
    pub latency: Duration,
    /// Percentage (0-100) of operations truncated into a partial transfer.
    pub failure_ratio: u8,
}

impl Direction {
    /// A direction that only injects faults.
    pub fn failing(failure_ratio: u8) -> Self {
        Self {
            failure_ratio,
            ..Self::default()
        }
    }

    /// A direction that only shapes traffic.
    pub fn throttled(max_bytes_per_sec: u64, latency: Duration) -> Self {
        Self {
            max_bytes_per_sec,
            latency,
            failure_ratio: 0,
        }
    }

    /// Set the failure ratio, keeping the shaping settings.
    pub fn with_failure_ratio(mut self, failure_ratio: u8) -> Self {
        self.failure_ratio = failure_ratio;
        self
    }

    /// Throughput and latency part of this direction.
    pub fn shaping(&self) -> Shaping {
        Shaping::new(self.max_bytes_per_sec, self.latency)
    }
}

/// Proxy configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Local bind address (`host:port`, port 0 for an ephemeral port).
    pub listen: String,
    /// Raw target: bare host, `host:port` or `scheme://host[:port]`.
    pub target: String,
    /// Degradation of bytes flowing to the client.
    pub read: Direction,
    /// Degradation of bytes flowing from the client.
    pub write: Direction,
    /// How long to wait when dialing the target.
    pub connect_timeout: Duration,
    /// Rewrite the `Host` header of HTTP requests when the target is a hostname.
    pub rewrite_host: bool,
}

impl Config {
    /// Create a configuration for the given target with a healthy network.
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            listen: DEFAULT_LISTEN_ADDR.to_string(),
            target: target.into(),
            read: Direction::default(),
            write: Direction::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            rewrite_host: true,
        }
    }

    pub fn listen(mut self, listen: impl Into<String>) -> Self {
        self.listen = listen.into();
        self
    }

    pub fn read(mut self, read: Direction) -> Self {
        self.read = read;
        self
    }

    pub fn write(mut self, write: Direction) -> Self {
        self.write = write;
        self
    }

    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn rewrite_host(mut self, rewrite_host: bool) -> Self {
        self.rewrite_host = rewrite_host;
        self
    }

    /// Check the configuration before anything is bound.
    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.listen.trim().is_empty() {
            return Err(ProxyError::Config("listen address is empty".to_string()));
        }

        for (name, direction) in [("read", &self.read), ("write", &self.write)] {
            if direction.failure_ratio > MAX_FAILURE_RATIO {
                return Err(ProxyError::Config(format!(
                    "{name} failure ratio {} exceeds {MAX_FAILURE_RATIO}",
                    direction.failure_ratio
                )));
            }
        }

        if self.connect_timeout.is_zero() {
            return Err(ProxyError::Config(
                "connect timeout must be positive".to_string(),
            ));
        }

        Ok(())
    }
}
