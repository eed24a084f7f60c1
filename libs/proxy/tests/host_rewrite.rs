use std::time::Duration;

use faultline_proxy::{Config, Direction, Proxy};
use faultline_testing::{init_tracing, HttpTarget, HTTP_BODY};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

async fn http_get(proxy: &Proxy) -> String {
    let mut client = TcpStream::connect(proxy.bind_addr()).await.unwrap();
    let request = format!(
        "GET /health HTTP/1.1\r\nHost: {}\r\nAccept: */*\r\n\r\n",
        proxy.bind_addr()
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    timeout(TEST_TIMEOUT, client.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    String::from_utf8(response).unwrap()
}

#[tokio::test]
async fn host_header_is_rewritten_for_hostname_targets() {
    init_tracing();
    let target = HttpTarget::spawn().await.unwrap();
    let port = target.addr.port();
    let proxy = Proxy::start(Config::new(format!("http://localhost:{port}/ignored")))
        .await
        .unwrap();

    let response = http_get(&proxy).await;

    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.ends_with(HTTP_BODY));
    assert_eq!(target.hosts(), vec![format!("localhost:{port}")]);

    proxy.shutdown().await.unwrap();
}

#[tokio::test]
async fn host_header_is_kept_when_rewrite_is_off() {
    init_tracing();
    let target = HttpTarget::spawn().await.unwrap();
    let proxy = Proxy::start(
        Config::new(format!("localhost:{}", target.addr.port())).rewrite_host(false),
    )
    .await
    .unwrap();

    http_get(&proxy).await;

    assert_eq!(target.hosts(), vec![proxy.bind_addr().to_string()]);

    proxy.shutdown().await.unwrap();
}

#[tokio::test]
async fn ip_targets_are_not_rewritten() {
    init_tracing();
    let target = HttpTarget::spawn().await.unwrap();
    let proxy = Proxy::start(Config::new(target.addr.to_string()))
        .await
        .unwrap();

    http_get(&proxy).await;

    assert_eq!(target.hosts(), vec![proxy.bind_addr().to_string()]);

    proxy.shutdown().await.unwrap();
}

#[tokio::test]
async fn host_header_is_rewritten_on_truncated_requests() {
    init_tracing();
    let target = HttpTarget::spawn().await.unwrap();
    let port = target.addr.port();
    let proxy = Proxy::start(
        Config::new(format!("localhost:{port}")).write(Direction::failing(100)),
    )
    .await
    .unwrap();

    let mut client = TcpStream::connect(proxy.bind_addr()).await.unwrap();
    let request = format!("GET / HTTP/1.1\r\nHost: {}\r\n\r\n", proxy.bind_addr());
    client.write_all(request.as_bytes()).await.unwrap();

    // The session ends at the injected fault; only the target's view matters.
    let seen = timeout(TEST_TIMEOUT, async {
        loop {
            let hosts = target.hosts();
            if !hosts.is_empty() {
                return hosts;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(seen, vec![format!("localhost:{port}")]);
    assert!(proxy.stats().write_faults() >= 1);

    proxy.shutdown().await.unwrap();
}
