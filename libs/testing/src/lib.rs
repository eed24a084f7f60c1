//! Test targets for proxy integration tests.
//!
//! Targets run on loopback with an ephemeral port and stop accepting when
//! dropped. Also provides an address nobody listens on and a `tracing`
//! setup that writes through the test harness.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

static INIT_TRACING: Once = Once::new();

/// Install a `tracing` subscriber that writes through the test harness.
///
/// Honors `RUST_LOG`, defaulting to `warn`. Safe to call from every test.
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// An address on loopback with nothing listening on it.
pub async fn unreachable_addr() -> io::Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    listener.local_addr()
}

/// Loopback server running a handler task per connection.
struct Server {
    addr: SocketAddr,
    accept_loop: JoinHandle<()>,
}

impl Server {
    async fn spawn<F, Fut>(handle: F) -> io::Result<Self>
    where
        F: Fn(TcpStream) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let accept_loop = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(handle(stream));
            }
        });
        Ok(Self { addr, accept_loop })
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.accept_loop.abort();
    }
}

/// A TCP service that echoes every byte back until the peer closes.
pub struct EchoTarget {
    pub addr: SocketAddr,
    connections: Arc<AtomicU64>,
    _server: Server,
}

impl EchoTarget {
    pub async fn spawn() -> io::Result<Self> {
        let connections = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&connections);

        let server = Server::spawn(move |mut stream| {
            counter.fetch_add(1, Ordering::Relaxed);
            async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            }
        })
        .await?;

        Ok(Self {
            addr: server.addr,
            connections,
            _server: server,
        })
    }

    /// Connections accepted so far.
    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}

/// Body returned by [`HttpTarget`].
pub const HTTP_BODY: &str = "PONG";

/// A minimal HTTP/1.1 server answering `200 PONG` to one request per
/// connection and recording its `Host` header.
pub struct HttpTarget {
    pub addr: SocketAddr,
    hosts: Arc<Mutex<Vec<String>>>,
    _server: Server,
}

impl HttpTarget {
    pub async fn spawn() -> io::Result<Self> {
        let hosts = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&hosts);

        let server = Server::spawn(move |mut stream| {
            let recorded = Arc::clone(&recorded);
            async move {
                let request = tokio::time::timeout(
                    Duration::from_secs(1),
                    read_request_host(&mut stream),
                )
                .await;
                let Ok(Ok(host)) = request else {
                    return;
                };
                if let Some(host) = host {
                    recorded
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push(host);
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{HTTP_BODY}",
                    HTTP_BODY.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
            }
        })
        .await?;

        Ok(Self {
            addr: server.addr,
            hosts,
            _server: server,
        })
    }

    /// `Host` headers seen so far, in arrival order.
    pub fn hosts(&self) -> Vec<String> {
        self.hosts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Read one request head and return its `Host` header, if it has one.
async fn read_request_host<R>(stream: &mut R) -> io::Result<Option<String>>
where
    R: AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(1024);
    loop {
        if stream.read_buf(&mut head).await? == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }

        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(&head) {
            Ok(httparse::Status::Complete(_)) => {
                return Ok(req
                    .headers
                    .iter()
                    .find(|h| h.name.eq_ignore_ascii_case("host"))
                    .map(|h| String::from_utf8_lossy(h.value).into_owned()));
            }
            Ok(httparse::Status::Partial) => {}
            Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
        }
    }
}
