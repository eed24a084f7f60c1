//! Best-effort request rewriting on the client-to-target path.
//!
//! When the target is addressed by hostname, a plain-HTTP client talking to
//! the proxy sends `Host: 127.0.0.1:<proxy port>`, which virtual-hosted
//! servers reject. [`HostRewrite`] replaces that header with the target's
//! hostname. Anything that does not parse as a complete HTTP/1.x request
//! head passes through untouched.

use std::fmt;

use bytes::{BufMut, BytesMut};
use faultline_networking::TargetAddr;

/// Maximum request head size considered for rewriting.
pub const MAX_HEAD_BYTES: usize = 16 * 1024;

/// Maximum number of headers in a request head considered for rewriting.
const MAX_HEADERS: usize = 64;

/// A transform applied to each chunk the client sends before it reaches
/// the target.
///
/// Returning `None` forwards the chunk unchanged. Implementations must not
/// fail: anything they cannot handle is passed through.
pub trait RequestTransform: Send + Sync + fmt::Debug {
    fn transform(&self, chunk: &[u8]) -> Option<Vec<u8>>;
}

/// Rewrites the `Host` header of HTTP/1.x requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRewrite {
    host: String,
}

impl HostRewrite {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }

    /// Rewrite for a target, or `None` when the target is an IP literal.
    pub fn for_target(target: &TargetAddr) -> Option<Self> {
        if target.is_ip() {
            None
        } else {
            Some(Self::new(target.host_header()))
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}

impl RequestTransform for HostRewrite {
    fn transform(&self, chunk: &[u8]) -> Option<Vec<u8>> {
        let window = &chunk[..chunk.len().min(MAX_HEAD_BYTES)];
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        let head_len = match req.parse(window) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) | Err(_) => return None,
        };
        let (method, path, version) = (req.method?, req.path?, req.version?);

        let mut hosts = req
            .headers
            .iter()
            .filter(|h| h.name.eq_ignore_ascii_case("host"));
        let current = hosts.next();
        if hosts.next().is_some() || current.is_some_and(|h| h.value == self.host.as_bytes()) {
            return None;
        }

        let mut out = BytesMut::with_capacity(chunk.len() + self.host.len() + 8);
        out.put_slice(method.as_bytes());
        out.put_u8(b' ');
        out.put_slice(path.as_bytes());
        out.put_slice(format!(" HTTP/1.{version}\r\n").as_bytes());
        if current.is_none() {
            put_header(&mut out, "Host", self.host.as_bytes());
        }
        for header in req.headers.iter() {
            if header.name.eq_ignore_ascii_case("host") {
                put_header(&mut out, "Host", self.host.as_bytes());
            } else {
                put_header(&mut out, header.name, header.value);
            }
        }
        out.put_slice(b"\r\n");
        out.put_slice(&chunk[head_len..]);

        Some(out.to_vec())
    }
}

fn put_header(out: &mut BytesMut, name: &str, value: &[u8]) {
    out.put_slice(name.as_bytes());
    out.put_slice(b": ");
    out.put_slice(value);
    out.put_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rewrite() -> HostRewrite {
        HostRewrite::new("example.com:8080")
    }

    fn apply(input: &str) -> Option<String> {
        rewrite()
            .transform(input.as_bytes())
            .map(|out| String::from_utf8(out).unwrap())
    }

    #[test]
    fn test_replaces_host_header() {
        let out = apply("GET / HTTP/1.1\r\nHost: 127.0.0.1:4000\r\nAccept: */*\r\n\r\n").unwrap();
        assert_eq!(
            out,
            "GET / HTTP/1.1\r\nHost: example.com:8080\r\nAccept: */*\r\n\r\n"
        );
    }

    #[test]
    fn test_header_name_is_case_insensitive() {
        let out = apply("GET / HTTP/1.1\r\nhOST: 127.0.0.1\r\n\r\n").unwrap();
        assert!(out.contains("Host: example.com:8080\r\n"));
        assert!(!out.contains("127.0.0.1"));
    }

    #[test]
    fn test_inserts_missing_host_after_request_line() {
        let out = apply("GET /index.html HTTP/1.0\r\nAccept: */*\r\n\r\n").unwrap();
        assert_eq!(
            out,
            "GET /index.html HTTP/1.0\r\nHost: example.com:8080\r\nAccept: */*\r\n\r\n"
        );
    }

    #[test]
    fn test_preserves_body() {
        let out = apply("POST /submit HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello").unwrap();
        assert!(out.ends_with("\r\n\r\nhello"));
        assert!(out.contains("Content-Length: 5\r\n"));
    }

    #[test]
    fn test_already_correct_host_is_untouched() {
        assert!(apply("GET / HTTP/1.1\r\nHost: example.com:8080\r\n\r\n").is_none());
    }

    #[test]
    fn test_non_http_passes_through() {
        assert!(apply("\x16\x03\x01\x02\x00").is_none());
        assert!(apply("PING\r\n\r\n").is_none());
        assert!(apply("GET / HTTP/2\r\n\r\n").is_none());
    }

    #[test]
    fn test_incomplete_head_passes_through() {
        assert!(apply("GET / HTTP/1.1\r\nHost: 127.0.0.1\r\n").is_none());
    }

    #[test]
    fn test_malformed_headers_pass_through() {
        assert!(apply("GET / HTTP/1.1\r\nno colon here\r\n\r\n").is_none());
        assert!(apply("GET / HTTP/1.1\r\nBad Name: x\r\n\r\n").is_none());
        assert!(apply("GET / HTTP/1.1\r\nHost: a\r\nHost: b\r\n\r\n").is_none());
    }

    #[test]
    fn test_oversized_head_passes_through() {
        let padding = "a".repeat(MAX_HEAD_BYTES);
        let input = format!("GET / HTTP/1.1\r\nHost: 127.0.0.1\r\nX-Pad: {padding}\r\n\r\n");
        assert!(apply(&input).is_none());
    }

    #[test]
    fn test_for_target_skips_ip_literals() {
        let ip = TargetAddr::parse("127.0.0.1:8080").unwrap();
        assert!(HostRewrite::for_target(&ip).is_none());

        let named = TargetAddr::parse("http://example.com").unwrap();
        assert_eq!(HostRewrite::for_target(&named).unwrap().host(), "example.com");

        let with_port = TargetAddr::parse("example.com:8443").unwrap();
        assert_eq!(
            HostRewrite::for_target(&with_port).unwrap().host(),
            "example.com:8443"
        );
    }
}
