//! The handle returned to the caller of [`Proxy::start`].

use std::net::SocketAddr;
use std::sync::Arc;

use faultline_networking::TargetAddr;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, Instrument};

use super::conn::FaultPolicy;
use super::engine::{Engine, SessionContext};
use super::rewrite::{HostRewrite, RequestTransform};
use super::shaping::{ListenerCloser, ShapedListener};
use crate::config::Config;
use crate::error::ProxyError;
use crate::stats::ProxyStats;

/// A running proxy instance.
///
/// Dropping the handle closes the listener and cancels the accept loop
/// without waiting; call [`Proxy::shutdown`] to wait until the loop and
/// every session have stopped.
#[derive(Debug)]
pub struct Proxy {
    bind_addr: SocketAddr,
    target: TargetAddr,
    stats: Arc<ProxyStats>,
    closer: ListenerCloser,
    shutdown: CancellationToken,
    accept_loop: Option<JoinHandle<Result<(), ProxyError>>>,
}

impl Proxy {
    /// Bind the listen address and start proxying to the target.
    ///
    /// Fails without starting anything if the configuration is invalid, the
    /// target cannot be normalized, or the address cannot be bound.
    pub async fn start(config: Config) -> Result<Self, ProxyError> {
        config.validate()?;
        let target = TargetAddr::parse(&config.target)?;

        let listener =
            ShapedListener::bind(&config.listen, config.write.shaping(), config.read.shaping())
                .await
                .map_err(|source| ProxyError::Bind {
                    addr: config.listen.clone(),
                    source,
                })?;
        let bind_addr = listener.local_addr().map_err(ProxyError::LocalAddr)?;

        let transform = if config.rewrite_host {
            HostRewrite::for_target(&target).map(|r| Arc::new(r) as Arc<dyn RequestTransform>)
        } else {
            None
        };

        let stats = Arc::new(ProxyStats::default());
        let context = Arc::new(SessionContext {
            target: target.clone(),
            policy: FaultPolicy::new(config.read.failure_ratio, config.write.failure_ratio),
            connect_timeout: config.connect_timeout,
            transform,
            stats: Arc::clone(&stats),
        });

        info!(
            bind_addr = %bind_addr,
            target_addr = %target,
            read_failure_ratio = config.read.failure_ratio,
            write_failure_ratio = config.write.failure_ratio,
            "Proxy started"
        );

        let closer = listener.closer();
        let shutdown = CancellationToken::new();
        let engine = Engine::new(listener, context, shutdown.clone());
        let accept_loop = tokio::spawn(
            engine
                .run()
                .instrument(tracing::info_span!("proxy", bind_addr = %bind_addr)),
        );

        Ok(Self {
            bind_addr,
            target,
            stats,
            closer,
            shutdown,
            accept_loop: Some(accept_loop),
        })
    }

    /// Address the proxy listens on, with the OS-assigned port resolved.
    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    pub fn port(&self) -> u16 {
        self.bind_addr.port()
    }

    /// Normalized target the proxy dials.
    pub fn target(&self) -> &TargetAddr {
        &self.target
    }

    pub fn stats(&self) -> &ProxyStats {
        &self.stats
    }

    /// `(read faults + write faults + dial failures) / accepted connections`.
    pub fn failure_ratio(&self) -> f64 {
        self.stats.failure_ratio()
    }

    /// Whether the accept loop is still running.
    pub fn is_running(&self) -> bool {
        self.accept_loop
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Close the listener and wait until the accept loop and all sessions
    /// have stopped.
    ///
    /// Returns the error that stopped the accept loop, if it stopped on its
    /// own because of a listener failure.
    pub async fn shutdown(mut self) -> Result<(), ProxyError> {
        self.signal_shutdown();
        let result = match self.accept_loop.take() {
            Some(handle) => handle.await?,
            None => Ok(()),
        };
        info!(bind_addr = %self.bind_addr, "Proxy stopped");
        result
    }

    fn signal_shutdown(&self) {
        self.closer.close();
        self.shutdown.cancel();
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        if self.accept_loop.is_some() {
            self.signal_shutdown();
        }
    }
}
