//! Outbound socket execution (§4.6 steps 2-5): opens a TCP (optionally TLS)
//! connection to the origin, transmits the pre-assembled request bytes, and
//! parses the HTTP/1.x response directly off the socket.
//!
//! Deliberately not built on an HTTP client crate — the original tool reads
//! and writes raw bytes so that malformed or adversarial origin responses
//! are captured as-is rather than normalized away by a client library.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use rustls_pki_types::ServerName;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{Duration, timeout};
use tokio_rustls::TlsConnector;

use crate::envelope::{RequestEnvelope, ResponseEnvelope, Scheme};
use crate::tls::insecure_client_config;

#[derive(Debug, Error)]
pub enum OutboundError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("tls handshake failed: {0}")]
    Tls(String),
    #[error("socket io failed: {0}")]
    Io(String),
    #[error("response parse failed: {0}")]
    Parse(String),
}

/// Strips a trailing `:port` from a `Host` value per §4.6 step 3, since the
/// envelope's own `port` field is authoritative.
pub fn host_without_port(host: &str) -> &str {
    match host.split_once(':') {
        Some((stripped, _)) => stripped,
        None => host,
    }
}

fn assemble_request(request: &RequestEnvelope) -> Vec<u8> {
    let mut buf = Vec::with_capacity(request.content.as_bytes().len() + 256);
    buf.extend_from_slice(request.method.as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(request.path.as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(request.http_version.as_bytes());
    buf.extend_from_slice(b"\r\n");
    for (key, value) in &request.headers {
        buf.extend_from_slice(key.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(request.content.as_bytes());
    buf
}

pub async fn execute(
    request: &RequestEnvelope,
    socket_timeout: Duration,
) -> Result<ResponseEnvelope, OutboundError> {
    let host = host_without_port(&request.host).to_string();
    let addr = (host.as_str(), request.port);

    let stream = timeout(socket_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| OutboundError::Connect("connect timed out".into()))?
        .map_err(|e| OutboundError::Connect(e.to_string()))?;
    let _ = stream.set_nodelay(true);

    let wire = assemble_request(request);

    let response_bytes = match request.scheme {
        Scheme::Http => {
            let mut stream = stream;
            write_and_read(&mut stream, &wire, socket_timeout).await?
        }
        Scheme::Https => {
            let connector = TlsConnector::from(Arc::new(insecure_client_config()));
            let server_name = ServerName::try_from(host.clone())
                .map_err(|_| OutboundError::Tls("invalid server name".into()))?;
            let mut tls_stream = timeout(socket_timeout, connector.connect(server_name, stream))
                .await
                .map_err(|_| OutboundError::Tls("handshake timed out".into()))?
                .map_err(|e| OutboundError::Tls(e.to_string()))?;
            write_and_read(&mut tls_stream, &wire, socket_timeout).await?
        }
    };

    parse_response(&response_bytes)
}

async fn write_and_read<S>(
    stream: &mut S,
    request_bytes: &[u8],
    socket_timeout: Duration,
) -> Result<BytesMut, OutboundError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    timeout(socket_timeout, stream.write_all(request_bytes))
        .await
        .map_err(|_| OutboundError::Io("write timed out".into()))?
        .map_err(|e| OutboundError::Io(e.to_string()))?;

    let mut buf = BytesMut::with_capacity(8192);
    let mut header_end = None;
    let mut content_length: Option<usize> = None;

    loop {
        let mut chunk = [0u8; 8192];
        let read = timeout(socket_timeout, stream.read(&mut chunk))
            .await
            .map_err(|_| OutboundError::Io("read timed out".into()))?
            .map_err(|e| OutboundError::Io(e.to_string()))?;
        if read == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..read]);

        if header_end.is_none() {
            let mut headers = [httparse::EMPTY_HEADER; 64];
            let mut parsed = httparse::Response::new(&mut headers);
            if let Ok(httparse::Status::Complete(offset)) = parsed.parse(&buf) {
                header_end = Some(offset);
                content_length = parsed
                    .headers
                    .iter()
                    .find(|h| h.name.eq_ignore_ascii_case("content-length"))
                    .and_then(|h| std::str::from_utf8(h.value).ok())
                    .and_then(|v| v.parse::<usize>().ok());
            }
        }

        if let (Some(offset), Some(length)) = (header_end, content_length) {
            if buf.len() >= offset + length {
                break;
            }
        }
    }

    Ok(buf)
}

fn parse_response(raw: &BytesMut) -> Result<ResponseEnvelope, OutboundError> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Response::new(&mut headers);
    let status = parsed
        .parse(raw)
        .map_err(|e| OutboundError::Parse(e.to_string()))?;
    let header_end = match status {
        httparse::Status::Complete(offset) => offset,
        httparse::Status::Partial => return Err(OutboundError::Parse("incomplete response headers".into())),
    };

    let status_code = parsed.code.ok_or_else(|| OutboundError::Parse("missing status code".into()))?;
    let reason = parsed.reason.unwrap_or("").to_string();
    let version = match parsed.version {
        Some(1) => "HTTP/1.1",
        _ => "HTTP/1.0",
    }
    .to_string();

    let header_list = parsed
        .headers
        .iter()
        .map(|h| {
            (
                crate::codec::ByteString::from(h.name.as_bytes().to_vec()),
                crate::codec::ByteString::from(h.value.to_vec()),
            )
        })
        .collect();

    let body = raw[header_end..].to_vec();

    Ok(ResponseEnvelope {
        http_version: version,
        status_code,
        reason: crate::codec::ByteString::from(reason.as_bytes().to_vec()),
        headers: header_list,
        content: crate::codec::ByteString::from(body),
        trailers: None,
        timestamp_start: 0.0,
        timestamp_end: 0.0,
    })
}

pub fn synthetic_response(
    status_code: u16,
    reason: &str,
    body: impl Into<Bytes>,
) -> ResponseEnvelope {
    let body: Bytes = body.into();
    ResponseEnvelope {
        http_version: "HTTP/1.1".to_string(),
        status_code,
        reason: crate::codec::ByteString::from(reason.as_bytes().to_vec()),
        headers: vec![(
            crate::codec::ByteString::from_static("Content-Type"),
            crate::codec::ByteString::from_static("text/plain"),
        )],
        content: crate::codec::ByteString::from(body.to_vec()),
        trailers: None,
        timestamp_start: 0.0,
        timestamp_end: 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ByteString;

    #[test]
    fn host_without_port_strips_colon_suffix() {
        assert_eq!(host_without_port("example.com:8443"), "example.com");
        assert_eq!(host_without_port("example.com"), "example.com");
    }

    #[test]
    fn assemble_request_preserves_header_order_and_body() {
        let request = RequestEnvelope {
            http_version: "HTTP/1.1".into(),
            host: "example.com".into(),
            port: 80,
            scheme: Scheme::Http,
            method: ByteString::from_static("POST"),
            path: ByteString::from_static("/submit"),
            authority: ByteString::from_static("example.com"),
            headers: vec![
                (ByteString::from_static("Host"), ByteString::from_static("example.com")),
                (ByteString::from_static("Content-Length"), ByteString::from_static("5")),
            ],
            content: ByteString::from_static("hello"),
            timestamp_start: 0.0,
            timestamp_end: 0.0,
        };
        let wire = assemble_request(&request);
        let text = String::from_utf8(wire).unwrap();
        assert!(text.starts_with("POST /submit HTTP/1.1\r\n"));
        assert!(text.contains("Host: example.com\r\n"));
        assert!(text.ends_with("\r\n\r\nhello"));
    }

    #[test]
    fn parse_response_reads_status_headers_and_body() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi";
        let response = parse_response(&BytesMut::from(&raw[..])).unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(response.reason.to_string_lossy(), "OK");
        assert_eq!(response.content.as_bytes(), b"hi");
    }
}
