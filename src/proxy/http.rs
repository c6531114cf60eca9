//! HTTP proxy request parsing.
//!
//! Reads the CRLF request line and MIME headers, then classifies the
//! request: CONNECT establishes a raw tunnel, everything else is a
//! plaintext forward whose head gets rebuilt (absolute URI rewritten to a
//! relative path) and replayed to the dialed upstream. The proxy never
//! looks past the blank line.

use std::net::SocketAddr;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

use crate::common::addr::Address;
use crate::common::error::{ProxyError, Result};
use crate::common::stream::{PrefixedStream, ProxyStream};

/// Exact tunnel-establishment response, byte for byte.
pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

const ALLOWED_METHODS: [&str; 6] = ["GET", "POST", "HEAD", "CONNECT", "PATCH", "OPTIONS"];

#[derive(Debug)]
pub enum HttpKind {
    /// CONNECT host:port — reply 200 after the dial, then raw relay.
    Connect,
    /// Forward request: rebuilt head to replay to the upstream.
    Forward { head: Vec<u8> },
}

#[derive(Debug)]
pub struct HttpRequest {
    pub target: Address,
    pub kind: HttpKind,
}

/// Parse one proxy request off the stream. Returns the request plus the
/// stream with any over-read bytes (start of a request body) put back.
pub async fn read_request(stream: ProxyStream) -> Result<(HttpRequest, ProxyStream)> {
    let mut reader = BufReader::new(stream);

    let mut request_line = String::new();
    if reader.read_line(&mut request_line).await? == 0 {
        return Err(ProxyError::BadRequest);
    }
    let request_line = request_line.trim_end_matches(['\r', '\n']).to_string();

    // "METHOD target HTTP/1.x"
    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() < 3 {
        return Err(ProxyError::BadRequest);
    }
    let method = parts[0];
    let uri = parts[1];
    let http_version = parts[2];

    if !ALLOWED_METHODS
        .iter()
        .any(|m| method.eq_ignore_ascii_case(m))
    {
        return Err(ProxyError::BadRequest);
    }
    let is_connect = method.eq_ignore_ascii_case("CONNECT");

    // 读取全部 header 直到空行
    let mut headers: Vec<String> = Vec::new();
    let mut host_header: Option<String> = None;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(ProxyError::BadRequest);
        }
        if line.trim().is_empty() {
            break;
        }
        let lower = line.to_ascii_lowercase();
        if lower.starts_with("proxy-connection:") {
            continue; // hop-by-hop, never forwarded
        }
        if lower.starts_with("host:") {
            host_header = Some(line["host:".len()..].trim().to_string());
        }
        headers.push(line);
    }

    let request = if is_connect {
        let target = parse_host_port_default(uri, host_header.as_deref(), 443)?;
        debug!(target = %target, "HTTP CONNECT request");
        HttpRequest {
            target,
            kind: HttpKind::Connect,
        }
    } else {
        let (target, relative_path) = parse_forward_url(uri, host_header.as_deref())?;
        debug!(method = method, target = %target, path = %relative_path, "HTTP forward request");

        // 重构请求：绝对 URL → 相对路径
        let mut head = format!("{} {} {}\r\n", method, relative_path, http_version);
        for h in &headers {
            head.push_str(h); // header lines keep their own CRLF
        }
        head.push_str("\r\n");

        HttpRequest {
            target,
            kind: HttpKind::Forward {
                head: head.into_bytes(),
            },
        }
    };

    // put back whatever the BufReader over-read (body bytes)
    let leftover = reader.buffer().to_vec();
    let inner = reader.into_inner();
    let stream: ProxyStream = if leftover.is_empty() {
        inner
    } else {
        Box::new(PrefixedStream::new(leftover, inner))
    };

    Ok((request, stream))
}

/// Parse "host[:port]" with a default port; empty host falls back to the
/// Host header.
fn parse_host_port_default(
    s: &str,
    host_header: Option<&str>,
    default_port: u16,
) -> Result<Address> {
    let s = if s.is_empty() {
        host_header.ok_or(ProxyError::BadRequest)?
    } else {
        s
    };
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(Address::Ip(addr));
    }
    if let Some((host, port_str)) = s.rsplit_once(':') {
        if let Ok(port) = port_str.parse::<u16>() {
            if let Ok(ip) = host.parse::<std::net::IpAddr>() {
                return Ok(Address::Ip(SocketAddr::new(ip, port)));
            }
            return Address::parse_host_port(&format!("{}:{}", host, port));
        }
    }
    if let Ok(ip) = s.parse::<std::net::IpAddr>() {
        return Ok(Address::Ip(SocketAddr::new(ip, default_port)));
    }
    Address::parse_host_port(&format!("{}:{}", s, default_port))
}

/// Resolve a forward-proxy URI to (target, relative path).
///
/// "http://example.com:8080/path?q=1" → (example.com:8080, "/path?q=1")
/// "/path" + Host header             → (host, "/path")
fn parse_forward_url(url: &str, host_header: Option<&str>) -> Result<(Address, String)> {
    if url.starts_with('/') {
        let host = host_header.ok_or(ProxyError::BadRequest)?;
        let target = parse_host_port_default(host, None, 80)?;
        return Ok((target, url.to_string()));
    }

    let without_scheme = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("HTTP://"))
        .ok_or(ProxyError::BadRequest)?;

    let (host_port, path) = match without_scheme.find('/') {
        Some(pos) => (&without_scheme[..pos], &without_scheme[pos..]),
        None => (without_scheme, "/"),
    };

    let target = parse_host_port_default(host_port, None, 80)?;
    Ok((target, path.to_string()))
}
