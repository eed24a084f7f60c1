//! Throughput and latency shaping.
//!
//! [`ShapedListener`] accepts TCP connections and wraps each one in a
//! [`ShapedStream`] that paces both directions independently:
//! - upload: bytes read from the client
//! - download: bytes written to the client
//!
//! Latency delays every operation: read data is held for the latency
//! before it is handed to the caller, written data waits before it is sent.
//! Throughput is capped by limiting each operation to one second's budget
//! and then holding the next operation of the same direction until the
//! transferred bytes have "drained" at the configured rate.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::AcceptError;

/// Throughput cap and latency for one direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Shaping {
    /// Bytes per second (0 = unlimited).
    pub bytes_per_sec: u64,
    /// Delay added to every operation.
    pub latency: Duration,
}

impl Shaping {
    /// No shaping at all.
    pub const UNLIMITED: Shaping = Shaping {
        bytes_per_sec: 0,
        latency: Duration::ZERO,
    };

    pub fn new(bytes_per_sec: u64, latency: Duration) -> Self {
        Self {
            bytes_per_sec,
            latency,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.bytes_per_sec == 0 && self.latency.is_zero()
    }

    /// Largest transfer allowed in one operation.
    fn chunk_limit(&self, len: usize) -> usize {
        if self.bytes_per_sec == 0 {
            len
        } else {
            len.min(usize::try_from(self.bytes_per_sec).unwrap_or(usize::MAX))
        }
    }

    /// Time for `bytes` to drain at the configured rate.
    fn drain_time(&self, bytes: usize) -> Duration {
        if self.bytes_per_sec == 0 || bytes == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(bytes as f64 / self.bytes_per_sec as f64)
        }
    }
}

/// Pending delay for one direction.
#[derive(Debug)]
struct Pacer {
    shaping: Shaping,
    delay: Option<Pin<Box<Sleep>>>,
}

impl Pacer {
    fn new(shaping: Shaping) -> Self {
        Self {
            shaping,
            delay: None,
        }
    }

    fn poll_delay(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if let Some(delay) = self.delay.as_mut() {
            ready!(delay.as_mut().poll(cx));
            self.delay = None;
        }
        Poll::Ready(())
    }

    fn delay_for(&mut self, wait: Duration) {
        if !wait.is_zero() {
            self.delay = Some(Box::pin(sleep(wait)));
        }
    }
}

/// A stream whose reads and writes are paced by two independent [`Shaping`]s.
#[derive(Debug)]
pub struct ShapedStream<S> {
    inner: S,
    upload: Pacer,
    download: Pacer,
    /// Bytes read from `inner`, waiting out the upload latency.
    held: Vec<u8>,
    held_pos: usize,
    /// Whether the current write already waited out the download latency.
    latency_paid: bool,
}

impl<S> ShapedStream<S> {
    pub fn new(inner: S, upload: Shaping, download: Shaping) -> Self {
        Self {
            inner,
            upload: Pacer::new(upload),
            download: Pacer::new(download),
            held: Vec::new(),
            held_pos: 0,
            latency_paid: false,
        }
    }

    /// Whether any shaping is applied.
    pub fn is_shaped(&self) -> bool {
        !self.upload.shaping.is_unlimited() || !self.download.shaping.is_unlimited()
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ShapedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.upload.shaping.is_unlimited() {
            return Pin::new(&mut this.inner).poll_read(cx, buf);
        }

        loop {
            ready!(this.upload.poll_delay(cx));

            if this.held_pos < this.held.len() {
                let n = (this.held.len() - this.held_pos).min(buf.remaining());
                buf.put_slice(&this.held[this.held_pos..this.held_pos + n]);
                this.held_pos += n;
                if this.held_pos == this.held.len() {
                    this.held.clear();
                    this.held_pos = 0;
                }
                let drain = this.upload.shaping.drain_time(n);
                this.upload.delay_for(drain);
                return Poll::Ready(Ok(()));
            }

            let limit = this.upload.shaping.chunk_limit(buf.remaining());
            if limit == 0 {
                return Poll::Ready(Ok(()));
            }

            this.held.resize(limit, 0);
            let polled = {
                let mut chunk = ReadBuf::new(&mut this.held);
                match Pin::new(&mut this.inner).poll_read(cx, &mut chunk) {
                    Poll::Ready(Ok(())) => Poll::Ready(Ok(chunk.filled().len())),
                    Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
                    Poll::Pending => Poll::Pending,
                }
            };

            match polled {
                Poll::Ready(Ok(n)) if n > 0 => {
                    this.held.truncate(n);
                    let latency = this.upload.shaping.latency;
                    this.upload.delay_for(latency);
                }
                Poll::Ready(result) => {
                    this.held.clear();
                    return Poll::Ready(result.map(|_| ()));
                }
                Poll::Pending => {
                    this.held.clear();
                    return Poll::Pending;
                }
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ShapedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.download.shaping.is_unlimited() || buf.is_empty() {
            return Pin::new(&mut this.inner).poll_write(cx, buf);
        }

        loop {
            ready!(this.download.poll_delay(cx));
            if this.latency_paid {
                break;
            }
            this.latency_paid = true;
            let latency = this.download.shaping.latency;
            this.download.delay_for(latency);
        }

        let limit = this.download.shaping.chunk_limit(buf.len());
        let result = ready!(Pin::new(&mut this.inner).poll_write(cx, &buf[..limit]));
        this.latency_paid = false;
        if let Ok(n) = result {
            let drain = this.download.shaping.drain_time(n);
            this.download.delay_for(drain);
        }
        Poll::Ready(result)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Handle that closes a [`ShapedListener`] from another task.
#[derive(Debug, Clone)]
pub struct ListenerCloser(CancellationToken);

impl ListenerCloser {
    pub fn close(&self) {
        self.0.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_cancelled()
    }
}

/// A TCP listener whose accepted connections are shaped.
#[derive(Debug)]
pub struct ShapedListener {
    inner: TcpListener,
    upload: Shaping,
    download: Shaping,
    closed: CancellationToken,
}

impl ShapedListener {
    /// Bind to `addr` and shape every accepted connection.
    pub async fn bind(addr: &str, upload: Shaping, download: Shaping) -> io::Result<Self> {
        let inner = TcpListener::bind(addr).await?;
        let local_addr = inner.local_addr()?;

        info!(
            bind_addr = %local_addr,
            upload_bytes_per_sec = upload.bytes_per_sec,
            upload_latency_ms = upload.latency.as_millis() as u64,
            download_bytes_per_sec = download.bytes_per_sec,
            download_latency_ms = download.latency.as_millis() as u64,
            "Shaped listener bound"
        );

        Ok(Self {
            inner,
            upload,
            download,
            closed: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn closer(&self) -> ListenerCloser {
        ListenerCloser(self.closed.clone())
    }

    /// Close the listener. Pending and future accepts return
    /// [`AcceptError::Closed`].
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Accept the next connection.
    pub async fn accept(&self) -> Result<(ShapedStream<TcpStream>, SocketAddr), AcceptError> {
        if self.closed.is_cancelled() {
            return Err(AcceptError::Closed);
        }

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(AcceptError::Closed),
            accepted = self.inner.accept() => {
                let (stream, peer_addr) = accepted?;
                Ok((ShapedStream::new(stream, self.upload, self.download), peer_addr))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_unlimited_is_pass_through() {
        let (mut client, server) = duplex(1024);
        let mut shaped = ShapedStream::new(server, Shaping::UNLIMITED, Shaping::UNLIMITED);
        assert!(!shaped.is_shaped());

        let start = Instant::now();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 16];
        let n = shaped.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");

        shaped.write_all(b"pong").await.unwrap();
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_latency_delays_delivery() {
        let (mut client, server) = duplex(1024);
        let mut shaped = ShapedStream::new(
            server,
            Shaping::new(0, Duration::from_millis(100)),
            Shaping::UNLIMITED,
        );

        client.write_all(b"ping").await.unwrap();
        let start = Instant::now();
        let mut buf = [0u8; 16];
        let n = shaped.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_latency_delays_send() {
        let (mut client, server) = duplex(1024);
        let mut shaped = ShapedStream::new(
            server,
            Shaping::UNLIMITED,
            Shaping::new(0, Duration::from_millis(250)),
        );

        let start = Instant::now();
        shaped.write_all(b"pong").await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(250));

        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_throughput_is_capped() {
        let (mut client, server) = duplex(1024);
        let mut shaped =
            ShapedStream::new(server, Shaping::UNLIMITED, Shaping::new(100, Duration::ZERO));

        let start = Instant::now();
        shaped.write_all(&[7u8; 300]).await.unwrap();
        // Three 100-byte chunks, the last two each wait a second.
        assert!(start.elapsed() >= Duration::from_secs(2));

        let mut buf = [0u8; 300];
        client.read_exact(&mut buf).await.unwrap();
        assert!(buf.iter().all(|b| *b == 7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_throughput_limits_chunk_size() {
        let (mut client, server) = duplex(1024);
        let mut shaped =
            ShapedStream::new(server, Shaping::new(10, Duration::ZERO), Shaping::UNLIMITED);

        client.write_all(&[1u8; 30]).await.unwrap();
        let mut buf = [0u8; 64];

        let start = Instant::now();
        let n = shaped.read(&mut buf).await.unwrap();
        assert_eq!(n, 10);
        let n = shaped.read(&mut buf).await.unwrap();
        assert_eq!(n, 10);
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reads_in_small_pieces() {
        let (mut client, server) = duplex(1024);
        let mut shaped = ShapedStream::new(
            server,
            Shaping::new(0, Duration::from_millis(10)),
            Shaping::UNLIMITED,
        );

        client.write_all(b"abcdef").await.unwrap();
        let mut out = Vec::new();
        let mut small = [0u8; 4];
        while out.len() < 6 {
            let n = shaped.read(&mut small).await.unwrap();
            assert!(n > 0);
            out.extend_from_slice(&small[..n]);
        }
        assert_eq!(out, b"abcdef");
    }

    #[tokio::test(start_paused = true)]
    async fn test_eof_passes_through() {
        let (client, server) = duplex(64);
        let mut shaped = ShapedStream::new(
            server,
            Shaping::new(0, Duration::from_millis(10)),
            Shaping::UNLIMITED,
        );
        drop(client);

        let mut buf = [0u8; 8];
        assert_eq!(shaped.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_listener_reports_ephemeral_port() {
        let listener = ShapedListener::bind("127.0.0.1:0", Shaping::UNLIMITED, Shaping::UNLIMITED)
            .await
            .unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(port > 0);
    }

    #[tokio::test]
    async fn test_accept_shapes_connections() {
        let upload = Shaping::new(0, Duration::from_millis(5));
        let listener = ShapedListener::bind("127.0.0.1:0", upload, Shaping::UNLIMITED)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let _client = TcpStream::connect(addr).await.unwrap();
        let (stream, _peer) = listener.accept().await.unwrap();
        assert!(stream.is_shaped());
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_accept() {
        let listener = std::sync::Arc::new(
            ShapedListener::bind("127.0.0.1:0", Shaping::UNLIMITED, Shaping::UNLIMITED)
                .await
                .unwrap(),
        );
        let closer = listener.closer();

        let accepting = std::sync::Arc::clone(&listener);
        let pending = tokio::spawn(async move { accepting.accept().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        closer.close();

        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("accept should return after close")
            .unwrap();
        assert!(matches!(result, Err(AcceptError::Closed)));
        assert!(listener.is_closed());
        assert!(matches!(listener.accept().await, Err(AcceptError::Closed)));
    }
}
