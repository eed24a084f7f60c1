//! Fault-injecting TCP proxy implementation.
//!
//! This module provides:
//! - The fault coin deciding per operation whether to inject a failure
//! - A shaped listener adding latency and throughput caps
//! - A fault-injecting connection truncating reads and writes
//! - The accept loop and per-session relaying
//! - An optional HTTP `Host` rewrite on the client-to-target path
//!
//! ## Architecture
//!
//! ```text
//! Client -> ShapedListener -> FaultyStream -> Engine -> Target
//!                                  |            |
//!                              fault coin   ProxyStats
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use faultline_proxy::{Config, Direction, Proxy};
//!
//! let proxy = Proxy::start(
//!     Config::new("127.0.0.1:5432").read(Direction::failing(10)),
//! )
//! .await?;
//! let client = connect(proxy.bind_addr()).await?;
//! // ... exercise the client ...
//! assert!(proxy.failure_ratio() < 0.5);
//! proxy.shutdown().await?;
//! ```

mod coin;
mod conn;
mod engine;
mod handle;
mod rewrite;
mod shaping;

pub use coin::should_fail;
pub use conn::{FaultPolicy, FaultyStream};
pub use engine::RELAY_BUFFER_SIZE;
pub use handle::Proxy;
pub use rewrite::{HostRewrite, RequestTransform, MAX_HEAD_BYTES};
pub use shaping::{ListenerCloser, ShapedListener, ShapedStream, Shaping};
