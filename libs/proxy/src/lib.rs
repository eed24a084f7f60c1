//! faultline proxy
//!
//! A TCP intermediary for tests: it sits between client code and a real
//! target and degrades the stream with latency, throughput caps, and
//! randomly truncated reads and writes.

pub mod config;
pub mod error;
pub mod proxy;
pub mod stats;

pub use config::{Config, Direction};
pub use error::{AcceptError, FaultDirection, PartialTransfer, ProxyError};
pub use faultline_networking::{NetworkError, TargetAddr};
pub use proxy::{
    should_fail, FaultPolicy, FaultyStream, HostRewrite, ListenerCloser, Proxy, RequestTransform,
    ShapedListener, ShapedStream, Shaping,
};
pub use stats::{ProxyStats, StatsSnapshot};
