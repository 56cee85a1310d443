//! Native WebSocket bridging for the TLS virtual server. Unlike the
//! raw-pipe WS paths, the MITM leg genuinely needs message-level framing:
//! the backend connection opens asynchronously, so client->backend
//! messages that arrive first must be buffered and flushed in order once
//! it does.
//!
//! Server-side handshake is done by hand (compute `Sec-WebSocket-Accept`,
//! write the `101` response ourselves) rather than replaying the request
//! through `tokio_tungstenite::accept_async` — the request bytes have
//! already been read and classified by the caller, and
//! `WebSocketStream::from_raw_socket` picks up framing from there without
//! re-reading the handshake.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::{Message, Role};

use crate::error::ProxyError;
use crate::header::ParsedHeaders;

/// Bridge an already-upgraded client TLS stream to a backend WebSocket at
/// `ws://localhost:<target_port><path>`.
pub async fn bridge<S>(
    client_stream: S,
    parsed: &ParsedHeaders,
    target_port: u16,
) -> Result<(), ProxyError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let accept_key = parsed
        .header("sec-websocket-key")
        .map(|k| derive_accept_key(k.as_bytes()))
        .ok_or_else(|| ProxyError::BackendHttpFailed("missing Sec-WebSocket-Key".into()))?;

    let mut client_stream = client_stream;
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {accept_key}\r\n\r\n"
    );
    client_stream
        .write_all(response.as_bytes())
        .await
        .map_err(|_| ProxyError::ClientClosed)?;

    let client_ws = WebSocketStream::from_raw_socket(client_stream, Role::Server, None).await;

    let ws_url = format!("ws://localhost:{target_port}{}", parsed.target);
    let mut request = ws_url
        .into_client_request()
        .map_err(|e| ProxyError::BackendHttpFailed(format!("bad ws url: {e}")))?;
    request.headers_mut().insert(
        "Host",
        format!("localhost:{target_port}").parse().unwrap(),
    );
    request.headers_mut().insert(
        "Origin",
        format!("http://localhost:{target_port}").parse().unwrap(),
    );
    if let Some(proto) = parsed.header("sec-websocket-protocol") {
        if let Ok(v) = proto.parse() {
            request.headers_mut().insert("Sec-WebSocket-Protocol", v);
        }
    }

    bridge_with_buffering(client_ws, request).await
}

async fn bridge_with_buffering<S>(
    mut client_ws: WebSocketStream<S>,
    request: http::Request<()>,
) -> Result<(), ProxyError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    // Buffer client->backend messages while the backend connection opens.
    let mut pending: Vec<Message> = Vec::new();
    let connect_fut = tokio_tungstenite::connect_async(request);
    tokio::pin!(connect_fut);
    let deadline = tokio::time::sleep(Duration::from_secs(5));
    tokio::pin!(deadline);

    let backend_ws = loop {
        tokio::select! {
            biased;
            connected = &mut connect_fut => {
                break match connected {
                    Ok((ws, _)) => ws,
                    Err(e) => return Err(ProxyError::BackendHttpFailed(e.to_string())),
                };
            }
            msg = client_ws.next() => {
                match msg {
                    Some(Ok(m)) => pending.push(m),
                    Some(Err(_)) => return Err(ProxyError::ClientClosed),
                    None => return Err(ProxyError::ClientClosed),
                }
            }
            _ = &mut deadline => {
                return Err(ProxyError::BackendHttpFailed("backend websocket open timed out".into()));
            }
        }
    };

    let (mut backend_write, mut backend_read) = backend_ws.split();
    for msg in pending {
        backend_write
            .send(msg)
            .await
            .map_err(|e| ProxyError::BackendHttpFailed(e.to_string()))?;
    }

    let (mut client_write, mut client_read) = client_ws.split();

    loop {
        tokio::select! {
            msg = client_read.next() => {
                match msg {
                    Some(Ok(m)) => {
                        let is_close = m.is_close();
                        if backend_write.send(m).await.is_err() {
                            break;
                        }
                        if is_close {
                            break;
                        }
                    }
                    _ => break,
                }
            }
            msg = backend_read.next() => {
                match msg {
                    Some(Ok(m)) => {
                        let is_close = m.is_close();
                        if client_write.send(m).await.is_err() {
                            break;
                        }
                        if is_close {
                            break;
                        }
                    }
                    _ => break,
                }
            }
        }
    }

    Ok(())
}
