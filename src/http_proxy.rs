//! HTTP proxy path: reverse and forward HTTP, and the identical
//! header-filtering rules reused by the TLS-MITM virtual server. The
//! outer listener isn't a hyper `Service` (it speaks whatever
//! protocol the connection state machine decided on), so requests are
//! built and dispatched through `hyper_util`'s legacy client, and
//! responses are serialized back to raw bytes for the caller to write to
//! the client socket.

use bytes::Bytes;
use http::{HeaderMap, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;

use crate::error::ProxyError;

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
];

const CONDITIONAL: &[&str] = &["if-none-match", "if-modified-since"];

pub type HttpClient = Client<HttpConnector, Full<Bytes>>;

pub fn new_client() -> HttpClient {
    Client::builder(TokioExecutor::new()).build(HttpConnector::new())
}

/// Build an [`http::HeaderMap`] from the parser's lowercased `HashMap`.
/// Entries with names/values that don't round-trip through `http`'s
/// strict header grammar are dropped rather than failing the request.
pub fn header_map_from(headers: &std::collections::HashMap<String, String>) -> http::HeaderMap {
    let mut map = http::HeaderMap::new();
    for (k, v) in headers {
        if let (Ok(name), Ok(value)) = (
            http::HeaderName::from_bytes(k.as_bytes()),
            http::HeaderValue::from_str(v),
        ) {
            map.insert(name, value);
        }
    }
    map
}

/// Outcome of one proxied request, ready to serialize onto the client
/// socket as raw HTTP/1.1 bytes.
pub struct ProxiedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Proxy one request to `http://localhost:<target_port><relative_target>`.
///
/// `host_override`: when `Some`, the outbound `Host` header is replaced
/// with it (forward-proxy requests, and every MITM virtual-server
/// request); reverse-proxy requests pass `None` and keep the client's
/// original Host.
pub async fn proxy_http(
    client: &HttpClient,
    method: &str,
    relative_target: &str,
    target_port: u16,
    client_headers: &http::HeaderMap,
    body: Bytes,
    host_override: Option<String>,
) -> Result<ProxiedResponse, ProxyError> {
    let uri: http::Uri = format!("http://localhost:{target_port}{relative_target}")
        .parse()
        .map_err(|e| ProxyError::BackendHttpFailed(format!("bad target uri: {e}")))?;

    let method: http::Method = method
        .parse()
        .map_err(|e| ProxyError::BackendHttpFailed(format!("bad method: {e}")))?;

    let forward_body = method != http::Method::GET && method != http::Method::HEAD && !body.is_empty();
    let out_body = if forward_body { body } else { Bytes::new() };

    let mut builder = Request::builder().method(method.clone()).uri(uri);
    {
        let out_headers = builder.headers_mut().expect("builder headers");
        let mut original_host: Option<http::HeaderValue> = None;
        for (name, value) in client_headers.iter() {
            let lower = name.as_str().to_ascii_lowercase();
            if HOP_BY_HOP.contains(&lower.as_str()) || CONDITIONAL.contains(&lower.as_str()) {
                continue;
            }
            if lower == "host" {
                original_host = Some(value.clone());
                continue; // re-added below, possibly rewritten
            }
            out_headers.append(name, value.clone());
        }
        // Forward-proxy requests get `Host` rewritten to the backend's
        // loopback address; reverse-proxy requests keep the client's
        // original `Host` value unchanged.
        let host_value = match host_override {
            Some(h) => http::HeaderValue::from_str(&h).ok(),
            None => original_host.or_else(|| http::HeaderValue::from_str(&format!("localhost:{target_port}")).ok()),
        };
        if let Some(v) = host_value {
            out_headers.insert(http::header::HOST, v);
        }
        out_headers.insert(http::header::CONNECTION, http::HeaderValue::from_static("close"));
    }

    let req = builder
        .body(Full::new(out_body))
        .map_err(|e| ProxyError::BackendHttpFailed(format!("bad request: {e}")))?;

    let resp = client
        .request(req)
        .await
        .map_err(|e| ProxyError::BackendHttpFailed(e.to_string()))?;

    let status = resp.status();
    let mut headers = resp.headers().clone();
    let collected = resp
        .into_body()
        .collect()
        .await
        .map_err(|e| ProxyError::BackendHttpFailed(e.to_string()))?;
    let body = collected.to_bytes();

    for name in [
        "connection",
        "keep-alive",
        "transfer-encoding",
        "content-length",
        "content-encoding",
    ] {
        headers.remove(name);
    }
    headers.insert(http::header::CONNECTION, http::HeaderValue::from_static("close"));

    Ok(ProxiedResponse {
        status,
        headers,
        body,
    })
}

/// Serialize a [`ProxiedResponse`] as raw HTTP/1.1 bytes (status line,
/// headers, blank line, body) ready to write to a plain `TcpStream`.
pub fn serialize_response(resp: &ProxiedResponse) -> Vec<u8> {
    let mut out = Vec::with_capacity(256 + resp.body.len());
    out.extend_from_slice(
        format!(
            "HTTP/1.1 {} {}\r\n",
            resp.status.as_u16(),
            resp.status.canonical_reason().unwrap_or("")
        )
        .as_bytes(),
    );
    for (name, value) in resp.headers.iter() {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    // No Content-Length: the body was decoded from whatever
    // Transfer-Encoding/Content-Encoding the backend used, so the original
    // length no longer applies. `Connection: close` (already set on
    // `resp.headers`) delimits the body instead.
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&resp.body);
    out
}
