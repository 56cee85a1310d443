//! Opaque byte-forwarding paths: WS_UPGRADE, FORWARD_WS, CONNECT_PLAIN.
//! No frame/layer parsing — once the initial handshake bytes are on the
//! wire, both directions are forwarded raw until either side closes.

use tokio::io::{AsyncWriteExt, copy_bidirectional};
use tokio::net::TcpStream;

use crate::error::ProxyError;

/// WS_UPGRADE / FORWARD_WS: connect to the backend, replay the client's
/// already-accumulated buffer (header bytes plus whatever followed them),
/// then forward opaquely in both directions.
pub async fn pipe_upgrade(
    client: &mut TcpStream,
    target_port: u16,
    accumulated: &[u8],
) -> Result<(), ProxyError> {
    let mut backend = connect_backend(target_port).await?;
    backend
        .write_all(accumulated)
        .await
        .map_err(|_| ProxyError::BackendClosed)?;
    forward(client, &mut backend).await
}

/// CONNECT_PLAIN: reply 200, then forward raw bytes, rewriting `Host:`/
/// `Origin:` in the first client->backend chunk only.
pub async fn pipe_connect_plain(
    client: &mut TcpStream,
    target_port: u16,
) -> Result<(), ProxyError> {
    let mut backend = connect_backend(target_port).await?;
    client
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await
        .map_err(|_| ProxyError::ClientClosed)?;

    let mut buf = vec![0u8; 8192];
    let n = tokio::io::AsyncReadExt::read(client, &mut buf)
        .await
        .map_err(|_| ProxyError::ClientClosed)?;
    if n > 0 {
        let rewritten = rewrite_host_and_origin(&buf[..n], target_port);
        backend
            .write_all(&rewritten)
            .await
            .map_err(|_| ProxyError::BackendClosed)?;
    }

    forward(client, &mut backend).await
}

async fn connect_backend(port: u16) -> Result<TcpStream, ProxyError> {
    TcpStream::connect(("127.0.0.1", port))
        .await
        .map_err(|source| ProxyError::BackendConnectFailed { port, source })
}

async fn forward(client: &mut TcpStream, backend: &mut TcpStream) -> Result<(), ProxyError> {
    match copy_bidirectional(client, backend).await {
        Ok(_) => Ok(()),
        Err(_) => Err(ProxyError::BackendClosed),
    }
}

/// Rewrite `Host:` and `Origin:` header lines to `localhost:<port>` within
/// the header portion of `data` (up to the first `\r\n\r\n`, if present —
/// if the terminator hasn't arrived yet in this chunk, the whole chunk is
/// treated as header-candidate text). Bytes outside a matched header line,
/// and any bytes after the header block, are left untouched. Single-shot:
/// callers invoke this exactly once per connection, on the first chunk.
pub fn rewrite_host_and_origin(data: &[u8], port: u16) -> Vec<u8> {
    rewrite_headers(data, port, true, None)
}

/// Forward-proxy WebSocket upgrade: rewrite the request-line's absolute-URI
/// target down to `relative_target`, plus `Host:` and `Origin:` to
/// `localhost:<port>`, matching the same three rewrites FORWARD_HTTP
/// applies to every forward-proxy request, upgrade or not.
pub fn rewrite_forward_ws(data: &[u8], relative_target: &str, port: u16) -> Vec<u8> {
    rewrite_headers(data, port, true, Some(relative_target))
}

fn rewrite_headers(
    data: &[u8],
    port: u16,
    rewrite_origin: bool,
    rewrite_request_target: Option<&str>,
) -> Vec<u8> {
    let header_end = data
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| i + 4)
        .unwrap_or(data.len());

    let (head, tail) = data.split_at(header_end);
    let text = String::from_utf8_lossy(head);
    let replacement = format!("localhost:{port}");

    let mut out = String::with_capacity(text.len());
    for (first, (body, term)) in split_keep_terminator(&text).into_iter().enumerate() {
        if first == 0 {
            if let Some(new_target) = rewrite_request_target {
                out.push_str(&rewrite_request_line(body, new_target));
                out.push_str(term);
                continue;
            }
        }
        if strip_header_name(body, "host").is_some() {
            out.push_str("Host: ");
            out.push_str(&replacement);
        } else if rewrite_origin && strip_header_name(body, "origin").is_some() {
            out.push_str("Origin: http://");
            out.push_str(&replacement);
        } else {
            out.push_str(body);
        }
        out.push_str(term);
    }

    let mut result = out.into_bytes();
    result.extend_from_slice(tail);
    result
}

/// Replace the request-target (middle token) of a request-line with
/// `new_target`, leaving the method and HTTP version intact.
fn rewrite_request_line(line: &str, new_target: &str) -> String {
    let mut parts = line.splitn(3, ' ');
    let method = parts.next().unwrap_or("");
    let _old_target = parts.next().unwrap_or("");
    let version = parts.next().unwrap_or("");
    format!("{method} {new_target} {version}")
}

/// Split `text` into `(line_without_terminator, terminator)` pairs, where
/// terminator is `"\r\n"` for every line except a possible final line with
/// no trailing newline (terminator `""`).
fn split_keep_terminator(text: &str) -> Vec<(&str, &str)> {
    let mut out = Vec::new();
    let mut rest = text;
    while let Some(idx) = rest.find("\r\n") {
        out.push((&rest[..idx], "\r\n"));
        rest = &rest[idx + 2..];
    }
    if !rest.is_empty() {
        out.push((rest, ""));
    }
    out
}

fn strip_header_name<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let colon = line.find(':')?;
    if line[..colon].trim().eq_ignore_ascii_case(name) {
        Some(line[colon + 1..].trim())
    } else {
        None
    }
}
