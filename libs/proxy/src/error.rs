//! Error types for the proxy.

use std::fmt;
use std::io;

use faultline_networking::NetworkError;
use thiserror::Error;

/// Errors surfaced to the owner of a proxy instance.
///
/// Per-session failures (dial errors, relay I/O errors, injected faults)
/// never show up here; they are counted and logged inside the session.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Configuration rejected before anything was bound.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Target address could not be normalized.
    #[error("invalid target: {0}")]
    Target(#[from] NetworkError),

    /// Listen address could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Bound listener did not report its local address.
    #[error("failed to read local address: {0}")]
    LocalAddr(#[source] io::Error),

    /// Accept loop stopped on an unexpected listener error.
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    /// Accept loop task panicked or was aborted.
    #[error("accept loop task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Error returned by [`ShapedListener::accept`](crate::ShapedListener::accept).
#[derive(Debug, Error)]
pub enum AcceptError {
    /// The listener was closed for teardown. This is the normal way out of
    /// the accept loop, not a failure.
    #[error("listener closed")]
    Closed,

    /// The underlying accept call failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Which client-facing direction a fault was injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultDirection {
    /// Bytes flowing to the client (target to client).
    Read,
    /// Bytes flowing from the client (client to target).
    Write,
}

impl fmt::Display for FaultDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultDirection::Read => f.write_str("read"),
            FaultDirection::Write => f.write_str("write"),
        }
    }
}

/// Payload of an injected short transfer.
///
/// Carried inside an [`io::Error`] of kind `UnexpectedEof` (or the kind of
/// the underlying error when the truncated operation itself failed), so
/// callers see an ordinary flaky-network error and can still recover how
/// many bytes made it through.
#[derive(Debug, Error)]
#[error("injected partial {direction} transfer after {transferred} bytes")]
pub struct PartialTransfer {
    /// Direction the fault was injected into.
    pub direction: FaultDirection,
    /// Bytes actually moved by the truncated operation.
    pub transferred: usize,
    /// Error from the truncated underlying operation, if it failed too.
    #[source]
    pub source: Option<io::Error>,
}

impl PartialTransfer {
    /// Wrap into an [`io::Error`].
    pub fn into_io_error(self) -> io::Error {
        let kind = self
            .source
            .as_ref()
            .map_or(io::ErrorKind::UnexpectedEof, io::Error::kind);
        io::Error::new(kind, self)
    }

    /// Recover the payload from an error produced by a fault-injecting stream.
    pub fn from_io_error(err: &io::Error) -> Option<&PartialTransfer> {
        err.get_ref()?.downcast_ref::<PartialTransfer>()
    }
}
