//! Per-connection driver: accumulate header bytes, classify, respond.
//! Each accepted socket gets one of these tasks; nothing
//! here touches another connection's state beyond the two shared
//! resources ([`DiscoveryCache`] and [`TlsRegistry`]), both already
//! single-flight-safe.

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::classify::{self, RequestShape};
use crate::dashboard;
use crate::discovery::DiscoveryCache;
use crate::header::parse_headers;
use crate::http_proxy::{self, HttpClient};
use crate::mitm::TlsRegistry;
use crate::raw_pipe;
use crate::responses;

/// Refuse to keep buffering headers past this many bytes; guards against
/// a client that never sends `\r\n\r\n`.
const MAX_HEADER_BYTES: usize = 64 * 1024;

pub struct Dispatcher {
    pub discovery: Arc<DiscoveryCache>,
    pub tls_registry: Arc<TlsRegistry>,
    pub http_client: HttpClient,
    pub listen_port: u16,
    pub debug: bool,
}

impl Dispatcher {
    pub async fn handle(&self, mut stream: TcpStream) {
        if let Err(e) = self.handle_inner(&mut stream).await {
            if self.debug {
                eprintln!("connection: {e}");
            }
        }
    }

    async fn handle_inner(&self, stream: &mut TcpStream) -> anyhow::Result<()> {
        let mut buf = Vec::with_capacity(4096);
        let parsed = loop {
            let mut chunk = [0u8; 4096];
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Ok(()); // client closed before a full request arrived
            }
            buf.extend_from_slice(&chunk[..n]);
            let parsed = parse_headers(&buf);
            if parsed.complete {
                break parsed;
            }
            if buf.len() > MAX_HEADER_BYTES {
                stream
                    .write_all(&responses::bad_request("request headers too large"))
                    .await?;
                return Ok(());
            }
        };

        let mapping = self.discovery.get_mapping().await;
        let mitm_available = self.tls_registry.mitm_available();
        let shape = classify::classify(&parsed, &mapping, self.listen_port, mitm_available);

        match shape {
            RequestShape::Dashboard => {
                let resp = if parsed.target == "/proxy.pac" {
                    dashboard::pac_response(self.listen_port)
                } else {
                    dashboard::html_response(&mapping)
                };
                stream.write_all(&resp).await?;
            }

            RequestShape::HttpProxy { port, .. } => {
                self.proxy_and_respond(stream, &parsed, &buf, port, None, "/", true)
                    .await?;
            }

            RequestShape::ReverseNotFound { subdomain } => {
                stream.write_all(&responses::not_found(&subdomain)).await?;
            }

            RequestShape::WsUpgrade { port, .. } => {
                raw_pipe::pipe_upgrade(stream, port, &buf).await.ok();
            }

            RequestShape::ForwardHttp {
                relative_target,
                port,
                https_redirect,
                proxy_target,
            } => {
                if https_redirect {
                    let host_with_port = parsed.header("host").unwrap_or(&proxy_target).to_string();
                    stream
                        .write_all(&responses::redirect_to_https(&host_with_port, &relative_target))
                        .await?;
                } else {
                    self.proxy_and_respond(
                        stream,
                        &parsed,
                        &buf,
                        port,
                        Some(format!("localhost:{port}")),
                        &relative_target,
                        false,
                    )
                    .await?;
                }
            }

            RequestShape::ForwardWs {
                port,
                relative_target,
                ..
            } => {
                let rewritten = raw_pipe::rewrite_forward_ws(&buf, &relative_target, port);
                raw_pipe::pipe_upgrade(stream, port, &rewritten).await.ok();
            }

            RequestShape::ConnectPlain { port, .. } => {
                raw_pipe::pipe_connect_plain(stream, port).await.ok();
            }

            RequestShape::ConnectMitm { host, .. } => {
                crate::mitm::bridge_connect(stream, &self.tls_registry, &host)
                    .await
                    .ok();
            }

            RequestShape::ClosedUnknown => {
                // no bytes back to the client
            }

            RequestShape::ClosedDisallowedHost { host } => {
                stream.write_all(&responses::forbidden(&host)).await?;
            }
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn proxy_and_respond(
        &self,
        stream: &mut TcpStream,
        parsed: &crate::header::ParsedHeaders,
        buf: &[u8],
        target_port: u16,
        host_override: Option<String>,
        relative_target: &str,
        reverse: bool,
    ) -> anyhow::Result<()> {
        let target = if reverse { &parsed.target } else { relative_target };
        let body = Bytes::copy_from_slice(&buf[parsed.header_end_index..]);
        let client_headers = http_proxy::header_map_from(&parsed.headers);

        let result = http_proxy::proxy_http(
            &self.http_client,
            &parsed.method,
            target,
            target_port,
            &client_headers,
            body,
            host_override,
        )
        .await;

        let out = match result {
            Ok(resp) => http_proxy::serialize_response(&resp),
            Err(e) => responses::bad_gateway(&e.to_string()),
        };
        stream.write_all(&out).await?;
        Ok(())
    }
}
