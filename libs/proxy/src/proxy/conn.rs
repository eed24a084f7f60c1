//! Fault-injecting connection.
//!
//! [`FaultyStream`] wraps the client-facing side of a session. Every read
//! and write rolls the fault coin; when it fires, only the first half of
//! the caller's buffer is transferred and the operation fails with
//! `UnexpectedEof` carrying a [`PartialTransfer`].
//!
//! Directions are named from the client's point of view. What the client
//! writes arrives here as reads, so reads roll the write-direction ratio;
//! what the client reads leaves here as writes, so writes roll the
//! read-direction ratio.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

use super::coin::should_fail;
use crate::error::{FaultDirection, PartialTransfer};
use crate::stats::ProxyStats;

/// Failure ratios for the two client-facing directions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultPolicy {
    /// Percent of bytes-to-client operations truncated.
    pub read_ratio: u8,
    /// Percent of bytes-from-client operations truncated.
    pub write_ratio: u8,
}

impl FaultPolicy {
    pub fn new(read_ratio: u8, write_ratio: u8) -> Self {
        Self {
            read_ratio,
            write_ratio,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.read_ratio == 0 && self.write_ratio == 0
    }
}

/// A stream that truncates a random fraction of its reads and writes.
#[derive(Debug)]
pub struct FaultyStream<S> {
    inner: S,
    policy: FaultPolicy,
    stats: Arc<ProxyStats>,
    /// Coin result for the read in progress, kept across `Pending`.
    pending_read: Option<bool>,
    /// Coin result for the write in progress, kept across `Pending`.
    pending_write: Option<bool>,
    scratch: Vec<u8>,
}

impl<S> FaultyStream<S> {
    pub fn new(inner: S, policy: FaultPolicy, stats: Arc<ProxyStats>) -> Self {
        Self {
            inner,
            policy,
            stats,
            pending_read: None,
            pending_write: None,
            scratch: Vec::new(),
        }
    }

    pub fn policy(&self) -> FaultPolicy {
        self.policy
    }

    fn fault(
        &self,
        direction: FaultDirection,
        transferred: usize,
        source: Option<io::Error>,
    ) -> io::Error {
        self.stats.record_fault(direction);
        debug!(
            direction = %direction,
            transferred,
            underlying_error = ?source,
            "Injected partial transfer"
        );
        PartialTransfer {
            direction,
            transferred,
            source,
        }
        .into_io_error()
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for FaultyStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let ratio = this.policy.write_ratio;
        let fire = *this.pending_read.get_or_insert_with(|| should_fail(ratio));

        if !fire {
            let result = ready!(Pin::new(&mut this.inner).poll_read(cx, buf));
            this.pending_read = None;
            return Poll::Ready(result);
        }

        let half = buf.remaining() / 2;
        let polled = if half == 0 {
            Poll::Ready(Ok(0))
        } else {
            this.scratch.resize(half, 0);
            let mut partial = ReadBuf::new(&mut this.scratch);
            match Pin::new(&mut this.inner).poll_read(cx, &mut partial) {
                Poll::Ready(Ok(())) => Poll::Ready(Ok(partial.filled().len())),
                Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
                Poll::Pending => Poll::Pending,
            }
        };
        let result = ready!(polled);
        this.pending_read = None;

        let err = match result {
            Ok(n) => {
                buf.put_slice(&this.scratch[..n]);
                this.fault(FaultDirection::Write, n, None)
            }
            Err(e) => this.fault(FaultDirection::Write, 0, Some(e)),
        };
        Poll::Ready(Err(err))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for FaultyStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let ratio = this.policy.read_ratio;
        let fire = *this.pending_write.get_or_insert_with(|| should_fail(ratio));

        if !fire {
            let result = ready!(Pin::new(&mut this.inner).poll_write(cx, buf));
            this.pending_write = None;
            return Poll::Ready(result);
        }

        let half = buf.len() / 2;
        let result = if half == 0 {
            Ok(0)
        } else {
            ready!(Pin::new(&mut this.inner).poll_write(cx, &buf[..half]))
        };
        this.pending_write = None;

        let err = match result {
            Ok(n) => this.fault(FaultDirection::Read, n, None),
            Err(e) => this.fault(FaultDirection::Read, 0, Some(e)),
        };
        Poll::Ready(Err(err))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
