//! End-to-end tests driving the full [`Dispatcher`] over real loopback
//! sockets: a fake backend (hand-rolled HTTP/1.1, no framework) stands in
//! for a dev server, and requests flow through exactly the path a real
//! client's connection would.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use localhome::connection::Dispatcher;
use localhome::discovery::probe::{PortLister, ProcessEnvReader};
use localhome::discovery::DiscoveryCache;
use localhome::http_proxy;
use localhome::mitm::TlsRegistry;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// A `PortLister`/`ProcessEnvReader` pair that reports one fixed
/// `NAME=<name>` process listening on `port`, independent of anything
/// actually running on the host.
struct FixedService {
    pid: u32,
    port: u16,
    name: String,
}

impl PortLister for FixedService {
    fn listening_ports(&self) -> anyhow::Result<Vec<(u32, u16)>> {
        Ok(vec![(self.pid, self.port)])
    }
}

impl ProcessEnvReader for FixedService {
    fn read_env(&self, pid: u32) -> anyhow::Result<String> {
        if pid == self.pid {
            Ok(format!("NAME={}", self.name))
        } else {
            anyhow::bail!("no such pid")
        }
    }
}

/// Spawn a plain-TCP backend that always replies with a fixed status,
/// headers and body, echoing the request path into the body so tests can
/// confirm the proxy forwarded it unmodified.
async fn spawn_echo_backend() -> u16 {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = Vec::with_capacity(4096);
                let mut chunk = [0u8; 4096];
                loop {
                    let n = stream.read(&mut chunk).await.unwrap_or(0);
                    if n == 0 {
                        return;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                let text = String::from_utf8_lossy(&buf);
                let path = text.lines().next().unwrap_or("").to_string();
                let body = format!("echo:{path}");
                let resp = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: {}\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(resp.as_bytes()).await;
            });
        }
    });
    port
}

/// Like [`spawn_echo_backend`], but the body reports the inbound `Host:`
/// header value instead of the request path — used to assert on the
/// Host-rewrite rules (forward-proxy rewritten, reverse-proxy untouched)
/// without entangling that assertion with the round-trip body-equality law.
async fn spawn_host_echo_backend() -> u16 {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = Vec::with_capacity(4096);
                let mut chunk = [0u8; 4096];
                loop {
                    let n = stream.read(&mut chunk).await.unwrap_or(0);
                    if n == 0 {
                        return;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                let text = String::from_utf8_lossy(&buf);
                let host = text
                    .lines()
                    .find_map(|l| l.strip_prefix("host: "))
                    .unwrap_or("")
                    .to_string();
                let body = format!("host-seen:{host}");
                let resp = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: {}\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(resp.as_bytes()).await;
            });
        }
    });
    port
}

fn build_dispatcher(service_name: &str, backend_port: u16, listen_port: u16) -> Arc<Dispatcher> {
    let fixed = FixedService {
        pid: 1,
        port: backend_port,
        name: service_name.to_string(),
    };
    let discovery = Arc::new(DiscoveryCache::new(
        Arc::new(fixed_clone_ports(&fixed)),
        Arc::new(fixed_clone_env(&fixed)),
        Duration::from_secs(60),
        false,
    ));
    let tls_registry = Arc::new(TlsRegistry::new(discovery.clone(), listen_port));
    Arc::new(Dispatcher {
        discovery,
        tls_registry,
        http_client: http_proxy::new_client(),
        listen_port,
        debug: true,
    })
}

// `FixedService` isn't `Clone` (trait objects need owned boxes); these
// helpers just build fresh equivalent instances for the two trait slots.
fn fixed_clone_ports(f: &FixedService) -> FixedService {
    FixedService {
        pid: f.pid,
        port: f.port,
        name: f.name.clone(),
    }
}
fn fixed_clone_env(f: &FixedService) -> FixedService {
    fixed_clone_ports(f)
}

async fn send_and_read(listen_port: u16, request: &str) -> String {
    let mut client = TcpStream::connect(("127.0.0.1", listen_port)).await.unwrap();
    client.write_all(request.as_bytes()).await.unwrap();
    client.shutdown().await.ok();
    let mut out = Vec::new();
    client.read_to_end(&mut out).await.ok();
    String::from_utf8_lossy(&out).into_owned()
}

#[tokio::test]
async fn reverse_http_round_trip() {
    let backend_port = spawn_echo_backend().await;
    let front_listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let listen_port = front_listener.local_addr().unwrap().port();
    let dispatcher = build_dispatcher("testapp", backend_port, listen_port);

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = front_listener.accept().await else {
                break;
            };
            let d = dispatcher.clone();
            tokio::spawn(async move { d.handle(stream).await });
        }
    });

    let resp = send_and_read(
        listen_port,
        "GET /widgets HTTP/1.1\r\nHost: testapp.localhost\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(resp.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(resp.contains("echo:GET /widgets HTTP/1.1"));
}

#[tokio::test]
async fn reverse_unknown_subdomain_is_404() {
    let backend_port = spawn_echo_backend().await;
    let front_listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let listen_port = front_listener.local_addr().unwrap().port();
    let dispatcher = build_dispatcher("testapp", backend_port, listen_port);

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = front_listener.accept().await else {
                break;
            };
            let d = dispatcher.clone();
            tokio::spawn(async move { d.handle(stream).await });
        }
    });

    let resp = send_and_read(
        listen_port,
        "GET / HTTP/1.1\r\nHost: ghost.localhost\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(resp.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(resp.contains("ghost.localhost"));
}

#[tokio::test]
async fn disallowed_host_is_403() {
    let backend_port = spawn_echo_backend().await;
    let front_listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let listen_port = front_listener.local_addr().unwrap().port();
    let dispatcher = build_dispatcher("testapp", backend_port, listen_port);

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = front_listener.accept().await else {
                break;
            };
            let d = dispatcher.clone();
            tokio::spawn(async move { d.handle(stream).await });
        }
    });

    let resp = send_and_read(
        listen_port,
        "GET / HTTP/1.1\r\nHost: evil.example.com\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(resp.starts_with("HTTP/1.1 403 Forbidden\r\n"));
}

#[tokio::test]
async fn dashboard_pac_served_on_bare_host() {
    let backend_port = spawn_echo_backend().await;
    let front_listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let listen_port = front_listener.local_addr().unwrap().port();
    let dispatcher = build_dispatcher("testapp", backend_port, listen_port);

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = front_listener.accept().await else {
                break;
            };
            let d = dispatcher.clone();
            tokio::spawn(async move { d.handle(stream).await });
        }
    });

    let resp = send_and_read(
        listen_port,
        &format!(
            "GET /proxy.pac HTTP/1.1\r\nHost: localhost:{listen_port}\r\nConnection: close\r\n\r\n"
        ),
    )
    .await;
    assert!(resp.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(resp.contains("application/x-ns-proxy-autoconfig"));
    assert!(resp.contains("FindProxyForURL"));
}

#[tokio::test]
async fn bad_gateway_when_backend_is_down() {
    // Bind and immediately drop to get a port nothing is listening on.
    let probe = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let dead_port = probe.local_addr().unwrap().port();
    drop(probe);

    let front_listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let listen_port = front_listener.local_addr().unwrap().port();
    let dispatcher = build_dispatcher("testapp", dead_port, listen_port);

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = front_listener.accept().await else {
                break;
            };
            let d = dispatcher.clone();
            tokio::spawn(async move { d.handle(stream).await });
        }
    });

    let resp = send_and_read(
        listen_port,
        "GET / HTTP/1.1\r\nHost: testapp.localhost\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(resp.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
}

#[tokio::test]
async fn reverse_proxy_strips_length_and_encoding_headers() {
    let backend_port = spawn_echo_backend().await;
    let front_listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let listen_port = front_listener.local_addr().unwrap().port();
    let dispatcher = build_dispatcher("testapp", backend_port, listen_port);

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = front_listener.accept().await else {
                break;
            };
            let d = dispatcher.clone();
            tokio::spawn(async move { d.handle(stream).await });
        }
    });

    let resp = send_and_read(
        listen_port,
        "GET / HTTP/1.1\r\nHost: testapp.localhost\r\nConnection: close\r\n\r\n",
    )
    .await;
    let lower = resp.to_ascii_lowercase();
    assert!(!lower.contains("content-length:"));
    assert!(!lower.contains("transfer-encoding:"));
    assert!(!lower.contains("content-encoding:"));
    assert!(lower.contains("connection: close"));
}

#[tokio::test]
async fn forward_http_rewrites_host_and_matches_reverse_body() {
    let backend_port = spawn_echo_backend().await;
    let front_listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let listen_port = front_listener.local_addr().unwrap().port();
    let dispatcher = build_dispatcher("testapp", backend_port, listen_port);

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = front_listener.accept().await else {
                break;
            };
            let d = dispatcher.clone();
            tokio::spawn(async move { d.handle(stream).await });
        }
    });

    let forward_resp = send_and_read(
        listen_port,
        "GET http://testapp/widgets HTTP/1.1\r\nHost: testapp\r\nConnection: close\r\n\r\n",
    )
    .await;
    let reverse_resp = send_and_read(
        listen_port,
        "GET /widgets HTTP/1.1\r\nHost: testapp.localhost\r\nConnection: close\r\n\r\n",
    )
    .await;

    let forward_body = forward_resp.rsplit("\r\n\r\n").next().unwrap();
    let reverse_body = reverse_resp.rsplit("\r\n\r\n").next().unwrap();
    assert_eq!(forward_body, reverse_body);
}

#[tokio::test]
async fn forward_proxy_rewrites_host_reverse_proxy_keeps_it() {
    let backend_port = spawn_host_echo_backend().await;
    let front_listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let listen_port = front_listener.local_addr().unwrap().port();
    let dispatcher = build_dispatcher("testapp", backend_port, listen_port);

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = front_listener.accept().await else {
                break;
            };
            let d = dispatcher.clone();
            tokio::spawn(async move { d.handle(stream).await });
        }
    });

    let forward_resp = send_and_read(
        listen_port,
        "GET http://testapp/ HTTP/1.1\r\nHost: testapp\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(forward_resp.contains(&format!("host-seen:localhost:{backend_port}")));

    let reverse_resp = send_and_read(
        listen_port,
        "GET / HTTP/1.1\r\nHost: testapp.localhost\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(reverse_resp.contains("host-seen:testapp.localhost"));
}

#[tokio::test]
async fn forward_proxy_unknown_host_closes_with_no_bytes() {
    let backend_port = spawn_echo_backend().await;
    let front_listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let listen_port = front_listener.local_addr().unwrap().port();
    let dispatcher = build_dispatcher("testapp", backend_port, listen_port);

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = front_listener.accept().await else {
                break;
            };
            let d = dispatcher.clone();
            tokio::spawn(async move { d.handle(stream).await });
        }
    });

    let resp = send_and_read(
        listen_port,
        "GET http://nonexistent/ HTTP/1.1\r\nHost: nonexistent\r\n\r\n",
    )
    .await;
    assert!(resp.is_empty());
}

#[tokio::test]
async fn reverse_websocket_upgrade_pipes_raw_bytes_to_backend() {
    // The raw-pipe WS path never parses frames; a backend that just echoes
    // whatever bytes arrive after the handshake line is enough to prove the
    // proxy replayed the accumulated buffer and then forwarded opaquely.
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let backend_port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        let mut buf = vec![0u8; 4096];
        let n = stream.read(&mut buf).await.unwrap_or(0);
        // Echo back a 101 plus whatever request bytes it saw, so the test
        // can confirm the handshake reached the backend untouched.
        let mut out = b"HTTP/1.1 101 Switching Protocols\r\n\r\n".to_vec();
        out.extend_from_slice(&buf[..n]);
        let _ = stream.write_all(&out).await;
    });

    let front_listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let listen_port = front_listener.local_addr().unwrap().port();
    let dispatcher = build_dispatcher("testapp", backend_port, listen_port);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = front_listener.accept().await else {
                break;
            };
            let d = dispatcher.clone();
            tokio::spawn(async move { d.handle(stream).await });
        }
    });

    let resp = send_and_read(
        listen_port,
        "GET /ws HTTP/1.1\r\nHost: testapp.localhost\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
    )
    .await;
    assert!(resp.starts_with("HTTP/1.1 101"));
    assert!(resp.contains("GET /ws HTTP/1.1"));
    assert!(resp.contains("Host: testapp.localhost"));
}

#[tokio::test]
async fn connect_plain_tunnel_reaches_backend() {
    let backend_port = spawn_echo_backend().await;
    let front_listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let listen_port = front_listener.local_addr().unwrap().port();
    let dispatcher = build_dispatcher("testapp", backend_port, listen_port);

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = front_listener.accept().await else {
                break;
            };
            let d = dispatcher.clone();
            tokio::spawn(async move { d.handle(stream).await });
        }
    });

    let mut client = TcpStream::connect(("127.0.0.1", listen_port)).await.unwrap();
    client
        .write_all(b"CONNECT testapp:80 HTTP/1.1\r\n\r\n")
        .await
        .unwrap();

    let mut head = [0u8; 64];
    let n = client.read(&mut head).await.unwrap();
    let greeting = String::from_utf8_lossy(&head[..n]);
    assert!(greeting.starts_with("HTTP/1.1 200"));

    client
        .write_all(b"GET /tunneled HTTP/1.1\r\nHost: testapp\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    client.shutdown().await.ok();
    let mut out = Vec::new();
    client.read_to_end(&mut out).await.ok();
    let text = String::from_utf8_lossy(&out);
    assert!(text.contains("echo:GET /tunneled HTTP/1.1"));
}

/// Accepts any leaf certificate — these tests terminate TLS against a
/// freshly-generated, never-trust-stored local CA, so the point being
/// verified is "the TLS virtual server speaks TLS and proxies correctly",
/// not certificate trust (which `cert_issuer.rs`'s own unit test covers).
#[derive(Debug)]
struct AcceptAnyCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

fn insecure_tls_connector() -> tokio_rustls::TlsConnector {
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth();
    tokio_rustls::TlsConnector::from(Arc::new(config))
}

/// `LOCALHOME_HOME` is process-wide; cargo's test harness runs these `#[tokio::test]`
/// functions on concurrent native threads, so mutating it needs a lock —
/// otherwise two tests could each bootstrap their CA under the other's
/// directory.
static LOCALHOME_HOME_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// Build a dispatcher backed by an isolated, per-test CA store directory
/// so concurrent tests never race on `$LOCALHOME_HOME/ca`.
fn build_mitm_dispatcher(
    service_name: &str,
    backend_port: u16,
    listen_port: u16,
    ca_home: &std::path::Path,
) -> Arc<Dispatcher> {
    let _guard = LOCALHOME_HOME_LOCK.lock().unwrap();
    std::env::set_var("LOCALHOME_HOME", ca_home);
    let dispatcher = build_dispatcher(service_name, backend_port, listen_port);
    std::env::remove_var("LOCALHOME_HOME");
    assert!(
        dispatcher.tls_registry.mitm_available(),
        "CA bootstrap under a throwaway LOCALHOME_HOME should always succeed"
    );
    dispatcher
}

/// Drive one CONNECT testapp:443, complete the client-side TLS handshake
/// over the tunnel, send `request`, and return the decoded response text.
async fn connect_mitm_and_send(listen_port: u16, hostname: &str, request: &str) -> String {
    let mut client = TcpStream::connect(("127.0.0.1", listen_port)).await.unwrap();
    client
        .write_all(format!("CONNECT {hostname}:443 HTTP/1.1\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let mut head = [0u8; 64];
    let n = client.read(&mut head).await.unwrap();
    assert!(String::from_utf8_lossy(&head[..n]).starts_with("HTTP/1.1 200"));

    let connector = insecure_tls_connector();
    let server_name = rustls::pki_types::ServerName::try_from(hostname.to_string()).unwrap();
    let mut tls = connector.connect(server_name, client).await.unwrap();

    tls.write_all(request.as_bytes()).await.unwrap();
    let mut out = Vec::new();
    tls.read_to_end(&mut out).await.ok();
    String::from_utf8_lossy(&out).into_owned()
}

#[tokio::test]
async fn connect_mitm_tls_round_trip() {
    let ca_home = tempfile::tempdir().unwrap();
    let backend_port = spawn_echo_backend().await;
    let front_listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let listen_port = front_listener.local_addr().unwrap().port();
    let dispatcher = build_mitm_dispatcher("testapp", backend_port, listen_port, ca_home.path());

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = front_listener.accept().await else { break };
            let d = dispatcher.clone();
            tokio::spawn(async move { d.handle(stream).await });
        }
    });

    let resp = connect_mitm_and_send(
        listen_port,
        "testapp",
        "GET /secure HTTP/1.1\r\nHost: testapp\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(resp.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(resp.contains("echo:GET /secure HTTP/1.1"));
}

#[tokio::test]
async fn connect_mitm_tunnel_serves_three_sequential_requests() {
    // A keep-alive CONNECT+TLS tunnel must serve more than one request
    // over the same session.
    let ca_home = tempfile::tempdir().unwrap();
    let backend_port = spawn_echo_backend().await;
    let front_listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let listen_port = front_listener.local_addr().unwrap().port();
    let dispatcher = build_mitm_dispatcher("testapp", backend_port, listen_port, ca_home.path());

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = front_listener.accept().await else { break };
            let d = dispatcher.clone();
            tokio::spawn(async move { d.handle(stream).await });
        }
    });

    let mut client = TcpStream::connect(("127.0.0.1", listen_port)).await.unwrap();
    client
        .write_all(b"CONNECT testapp:443 HTTP/1.1\r\n\r\n")
        .await
        .unwrap();
    let mut head = [0u8; 64];
    let n = client.read(&mut head).await.unwrap();
    assert!(String::from_utf8_lossy(&head[..n]).starts_with("HTTP/1.1 200"));

    let connector = insecure_tls_connector();
    let server_name = rustls::pki_types::ServerName::try_from("testapp").unwrap();
    let mut tls = connector.connect(server_name, client).await.unwrap();

    for i in 0..3 {
        let path = format!("/seq{i}");
        tls.write_all(
            format!("GET {path} HTTP/1.1\r\nHost: testapp\r\n\r\n").as_bytes(),
        )
        .await
        .unwrap();

        let mut buf = vec![0u8; 4096];
        let n = tls.read(&mut buf).await.unwrap();
        let text = String::from_utf8_lossy(&buf[..n]);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "request {i} failed: {text}");
        assert!(text.contains(&format!("echo:GET {path} HTTP/1.1")), "request {i}: {text}");
    }
}

#[tokio::test]
async fn five_concurrent_mitm_tunnels_to_same_host_all_succeed() {
    // Exercises the registry's single-flight virtual-server creation
    // under concurrent first use against the same hostname.
    let ca_home = tempfile::tempdir().unwrap();
    let backend_port = spawn_echo_backend().await;
    let front_listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let listen_port = front_listener.local_addr().unwrap().port();
    let dispatcher = build_mitm_dispatcher("testapp", backend_port, listen_port, ca_home.path());

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = front_listener.accept().await else { break };
            let d = dispatcher.clone();
            tokio::spawn(async move { d.handle(stream).await });
        }
    });

    let mut tasks = Vec::new();
    for i in 0..5 {
        tasks.push(tokio::spawn(async move {
            connect_mitm_and_send(
                listen_port,
                "testapp",
                &format!("GET /c{i} HTTP/1.1\r\nHost: testapp\r\nConnection: close\r\n\r\n"),
            )
            .await
        }));
    }

    for (i, task) in tasks.into_iter().enumerate() {
        let resp = task.await.unwrap();
        assert!(resp.starts_with("HTTP/1.1 200 OK\r\n"), "tunnel {i}: {resp}");
        assert!(resp.contains(&format!("echo:GET /c{i} HTTP/1.1")), "tunnel {i}: {resp}");
    }
}
