//! TLS-MITM subsystem: a registry of per-hostname TLS virtual servers,
//! created on demand and kept for the life of the process, plus the
//! CONNECT_MITM bridge that hands a client's raw TCP bytes to one of
//! them.

pub mod cert_issuer;
pub mod ws_bridge;

use std::collections::HashMap;
use std::sync::Arc;

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_rustls::TlsAcceptor;

use crate::classify::is_upgrade;
use crate::dashboard;
use crate::discovery::DiscoveryCache;
use crate::error::ProxyError;
use crate::header::parse_headers;
use crate::http_proxy::{self, HttpClient};
use crate::responses;
use cert_issuer::CertIssuer;

/// Always resolves to the one cert this virtual server was built with —
/// each server only ever terminates TLS for a single hostname, so there
/// is no real SNI dispatch to do.
struct FixedCert(Arc<CertifiedKey>);

impl std::fmt::Debug for FixedCert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedCert").finish()
    }
}

impl ResolvesServerCert for FixedCert {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

/// Registry of per-hostname TLS virtual servers. At most one per
/// hostname; concurrent callers during creation see a single-flight
/// result, same as [`DiscoveryCache`]'s mapping refresh.
pub struct TlsRegistry {
    issuer: CertIssuer,
    discovery: Arc<DiscoveryCache>,
    http_client: HttpClient,
    listen_port: u16,
    servers: Mutex<HashMap<String, u16>>,
}

impl TlsRegistry {
    pub fn new(discovery: Arc<DiscoveryCache>, listen_port: u16) -> Self {
        // Idempotent: `ServerConfig::builder()` (used when a virtual server
        // is first spawned) and any rustls client config a caller builds
        // both need a process-default crypto provider installed before
        // their first use. Harmless if `main` (or an earlier registry, or a
        // test) already installed one.
        let _ = rustls::crypto::ring::default_provider().install_default();
        Self {
            issuer: CertIssuer::load_or_create(),
            discovery,
            http_client: http_proxy::new_client(),
            listen_port,
            servers: Mutex::new(HashMap::new()),
        }
    }

    pub fn mitm_available(&self) -> bool {
        self.issuer.mitm_available()
    }

    /// Get (or single-flight-create) the ephemeral port of the TLS
    /// virtual server for `hostname`.
    async fn get_or_create_port(self: &Arc<Self>, hostname: &str) -> Result<u16, ProxyError> {
        let mut servers = self.servers.lock().await;
        if let Some(&port) = servers.get(hostname) {
            return Ok(port);
        }
        let port = self.clone().spawn_virtual_server(hostname).await?;
        servers.insert(hostname.to_string(), port);
        Ok(port)
    }

    async fn spawn_virtual_server(self: Arc<Self>, hostname: &str) -> Result<u16, ProxyError> {
        let certified = self
            .issuer
            .get_cert(hostname)
            .map_err(|e| ProxyError::BackendHttpFailed(format!("cert issuance failed: {e:#}")))?;

        let mut server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(FixedCert(certified)));
        server_config.alpn_protocols = vec![b"http/1.1".to_vec()];
        let acceptor = TlsAcceptor::from(Arc::new(server_config));

        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|e| ProxyError::BackendHttpFailed(format!("bind TLS virtual server: {e}")))?;
        let port = listener
            .local_addr()
            .map_err(|e| ProxyError::BackendHttpFailed(format!("TLS virtual server addr: {e}")))?
            .port();

        let hostname = hostname.to_string();
        let registry = self.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(v) => v,
                    Err(_) => break,
                };
                let acceptor = acceptor.clone();
                let registry = registry.clone();
                let hostname = hostname.clone();
                tokio::spawn(async move {
                    if let Ok(tls_stream) = acceptor.accept(stream).await {
                        let _ = registry.serve_virtual_connection(tls_stream, &hostname).await;
                    }
                });
            }
        });

        Ok(port)
    }

    /// Serve every request the client sends over one TLS session, looping
    /// as long as the client keeps the connection open — a keep-alive
    /// tunnel may carry several sequential requests, not just one. A
    /// WebSocket upgrade hands the stream off to [`ws_bridge::bridge`]
    /// permanently; every other request is answered in place and the loop
    /// reads the next one.
    async fn serve_virtual_connection(
        &self,
        mut stream: tokio_rustls::server::TlsStream<TcpStream>,
        hostname: &str,
    ) -> Result<(), ProxyError> {
        let mut buf: Vec<u8> = Vec::with_capacity(8192);
        loop {
            let parsed = loop {
                let parsed = parse_headers(&buf);
                if parsed.complete {
                    break parsed;
                }
                let mut chunk = [0u8; 4096];
                let n = tokio::io::AsyncReadExt::read(&mut stream, &mut chunk)
                    .await
                    .map_err(|_| ProxyError::ClientClosed)?;
                if n == 0 {
                    // Clean close between requests is not an error.
                    return if buf.is_empty() {
                        Ok(())
                    } else {
                        Err(ProxyError::ClientClosed)
                    };
                }
                buf.extend_from_slice(&chunk[..n]);
            };

            let mapping = self.discovery.get_mapping().await;
            let Some(&target_port) = mapping.get(hostname) else {
                let resp = responses::bad_gateway("unknown hostname for TLS virtual server");
                stream.write_all(&resp).await.map_err(|_| ProxyError::ClientClosed)?;
                return Ok(());
            };

            if target_port == self.listen_port {
                let resp = if parsed.target == "/proxy.pac" {
                    dashboard::pac_response(self.listen_port)
                } else {
                    dashboard::html_response(&mapping)
                };
                stream.write_all(&resp).await.map_err(|_| ProxyError::ClientClosed)?;
                buf.clear();
                continue;
            }

            if is_upgrade(&parsed) {
                return ws_bridge::bridge(stream, &parsed, target_port).await;
            }

            let body = bytes::Bytes::copy_from_slice(&buf[parsed.header_end_index..]);
            let client_headers = http_proxy::header_map_from(&parsed.headers);
            let proxied = http_proxy::proxy_http(
                &self.http_client,
                &parsed.method,
                &parsed.target,
                target_port,
                &client_headers,
                body,
                Some(format!("localhost:{target_port}")),
            )
            .await;

            let out = match proxied {
                Ok(resp) => http_proxy::serialize_response(&resp),
                Err(e) => responses::bad_gateway(&e.to_string()),
            };
            stream.write_all(&out).await.map_err(|_| ProxyError::ClientClosed)?;
            // Every post-header byte was already forwarded as this
            // request's body, so nothing is left over for the next request.
            buf.clear();
        }
    }
}

/// CONNECT_MITM bridge: open a TCP connection to the hostname's TLS
/// virtual server, write the `200` response to the client *before*
/// relaying any bytes (so the client never sends its ClientHello before
/// the bridge exists), then forward opaquely in both directions.
pub async fn bridge_connect(
    client: &mut TcpStream,
    registry: &Arc<TlsRegistry>,
    hostname: &str,
) -> Result<(), ProxyError> {
    let port = registry.get_or_create_port(hostname).await?;
    let mut backend = TcpStream::connect(("127.0.0.1", port))
        .await
        .map_err(|source| ProxyError::BackendConnectFailed { port, source })?;

    client
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await
        .map_err(|_| ProxyError::ClientClosed)?;

    match tokio::io::copy_bidirectional(client, &mut backend).await {
        Ok(_) => Ok(()),
        Err(_) => Err(ProxyError::BackendClosed),
    }
}
