//! Accept loop and session relaying.
//!
//! The engine owns the shaped listener. Every accepted connection becomes
//! a session: the target is dialed, then both directions are relayed
//! concurrently until the first of them finishes, at which point both legs
//! are closed.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use faultline_networking::TargetAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use super::conn::{FaultPolicy, FaultyStream};
use super::rewrite::RequestTransform;
use super::shaping::ShapedListener;
use crate::error::{AcceptError, PartialTransfer, ProxyError};
use crate::stats::ProxyStats;

/// Relay buffer size per direction.
pub const RELAY_BUFFER_SIZE: usize = 8192;

/// Everything a session needs, shared by all sessions of one instance.
#[derive(Debug)]
pub(crate) struct SessionContext {
    pub target: TargetAddr,
    pub policy: FaultPolicy,
    pub connect_timeout: Duration,
    pub transform: Option<Arc<dyn RequestTransform>>,
    pub stats: Arc<ProxyStats>,
}

/// How a session's relay ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    ClientClosed,
    TargetClosed,
}

/// The accept loop of one proxy instance.
pub(crate) struct Engine {
    listener: ShapedListener,
    context: Arc<SessionContext>,
    shutdown: CancellationToken,
}

impl Engine {
    pub(crate) fn new(
        listener: ShapedListener,
        context: Arc<SessionContext>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            listener,
            context,
            shutdown,
        }
    }

    /// Accept connections until the listener is closed or the instance is
    /// cancelled. Sessions still running at that point are aborted and
    /// awaited before this returns.
    pub(crate) async fn run(self) -> Result<(), ProxyError> {
        let Engine {
            listener,
            context,
            shutdown,
        } = self;
        let mut sessions = JoinSet::new();

        info!(target_addr = %context.target, "Accept loop started");

        let result = loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!(error = %e, "Session task panicked");
                        }
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        context.stats.record_accept();
                        let inbound = FaultyStream::new(
                            stream,
                            context.policy,
                            Arc::clone(&context.stats),
                        );
                        let context = Arc::clone(&context);
                        sessions.spawn(
                            run_session(inbound, context)
                                .instrument(tracing::info_span!("session", peer = %peer_addr)),
                        );
                    }
                    Err(AcceptError::Closed) => break Ok(()),
                    Err(AcceptError::Io(e)) if is_transient_accept_error(&e) => {
                        warn!(error = %e, "Skipping failed accept");
                    }
                    Err(AcceptError::Io(e)) => {
                        error!(error = %e, "Accept error");
                        break Err(ProxyError::Accept(e));
                    }
                }
            }
        };

        // Stop accepting before tearing down what is still in flight.
        drop(listener);
        let aborted = sessions.len();
        sessions.shutdown().await;

        info!(aborted_sessions = aborted, "Accept loop stopped");
        result
    }
}

/// Accept errors that concern one connection rather than the listener.
fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}

/// Dial the target and relay until either side finishes.
async fn run_session<S>(inbound: S, context: Arc<SessionContext>)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let _active = ActiveSession::start(&context.stats);

    let outbound = match dial(&context.target, context.connect_timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            context.stats.record_dial_failure();
            warn!(target_addr = %context.target, error = %e, "Target connection failed");
            // Dropping `inbound` closes the client connection.
            return;
        }
    };

    debug!(target_addr = %context.target, "Connected to target");

    match proxy_bidirectional(inbound, outbound, &context).await {
        Ok(end) => debug!(end = ?end, "Session closed"),
        Err(e) => match PartialTransfer::from_io_error(&e) {
            Some(partial) => debug!(
                direction = %partial.direction,
                transferred = partial.transferred,
                "Session ended by injected fault"
            ),
            None => debug!(error = %e, "Session ended with error"),
        },
    }
}

/// Keeps `sessions_active` accurate when a session is aborted at teardown
/// or panics.
struct ActiveSession<'a>(&'a ProxyStats);

impl<'a> ActiveSession<'a> {
    fn start(stats: &'a ProxyStats) -> Self {
        stats.session_started();
        Self(stats)
    }
}

impl Drop for ActiveSession<'_> {
    fn drop(&mut self) {
        self.0.session_finished();
    }
}

async fn dial(target: &TargetAddr, connect_timeout: Duration) -> io::Result<TcpStream> {
    let addr = target.to_string();
    match timeout(connect_timeout, TcpStream::connect(addr.as_str())).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
    }
}

/// Relay both directions until the first one finishes.
///
/// Both streams are owned here, so returning drops them and closes both
/// legs, which also ends the direction that was still running.
async fn proxy_bidirectional<S>(
    inbound: S,
    outbound: TcpStream,
    context: &SessionContext,
) -> io::Result<SessionEnd>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (client_read, client_write) = tokio::io::split(inbound);
    let (target_read, target_write) = outbound.into_split();

    let to_target = relay(
        client_read,
        target_write,
        context.transform.as_deref(),
        context.stats.bytes_to_target_counter(),
    );
    let to_client = relay(
        target_read,
        client_write,
        None,
        context.stats.bytes_from_target_counter(),
    );

    tokio::select! {
        result = to_target => result.map(|()| SessionEnd::ClientClosed),
        result = to_client => result.map(|()| SessionEnd::TargetClosed),
    }
}

/// Copy from `src` to `dst` until end of stream or error.
///
/// The bytes of an injected partial read are still forwarded before the
/// fault ends the relay.
async fn relay<R, W>(
    mut src: R,
    mut dst: W,
    transform: Option<&dyn RequestTransform>,
    counter: &AtomicU64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        match src.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => forward(&mut dst, &buf[..n], transform, counter).await?,
            Err(e) => {
                if let Some(partial) = PartialTransfer::from_io_error(&e) {
                    let n = partial.transferred;
                    if n > 0 {
                        forward(&mut dst, &buf[..n], transform, counter).await?;
                    }
                }
                return Err(e);
            }
        }
    }
    dst.shutdown().await?;
    Ok(())
}

/// Write one chunk through the transform, counting what reaches `dst`.
async fn forward<W>(
    dst: &mut W,
    chunk: &[u8],
    transform: Option<&dyn RequestTransform>,
    counter: &AtomicU64,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let written = match transform.and_then(|t| t.transform(chunk)) {
        Some(rewritten) => {
            dst.write_all(&rewritten).await?;
            rewritten.len()
        }
        None => {
            dst.write_all(chunk).await?;
            chunk.len()
        }
    };
    counter.fetch_add(written as u64, Ordering::Relaxed);
    Ok(())
}
