//! Turns a parsed request-header block into a tagged [`RequestShape`].
//!
//! Classification is a pure function producing one tagged variant per
//! request, carrying only the fields that variant needs, rather than
//! branching on string prefixes at the point of use.

use crate::discovery::Mapping;
use crate::header::ParsedHeaders;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestShape {
    /// Dashboard HTML or `/proxy.pac`, decided by path at response time.
    Dashboard,
    /// Reverse-proxy plain HTTP to a known service.
    HttpProxy { subdomain: String, port: u16 },
    /// Reverse-proxy WebSocket upgrade to a known service.
    WsUpgrade { subdomain: String, port: u16 },
    /// Reverse-proxy lookup for an unregistered subdomain -> 404.
    ReverseNotFound { subdomain: String },
    /// Forward-proxy absolute-URI HTTP request.
    ForwardHttp {
        relative_target: String,
        port: u16,
        /// Redirect to https:// instead of proxying (MITM available, not an upgrade).
        https_redirect: bool,
        proxy_target: String,
    },
    /// Forward-proxy absolute-URI WebSocket upgrade.
    ForwardWs {
        relative_target: String,
        port: u16,
        proxy_target: String,
    },
    /// CONNECT to a non-443 (or MITM-unavailable) target: raw TCP tunnel.
    ConnectPlain { host: String, port: u16 },
    /// CONNECT to port 443 with MITM available: TLS-terminating tunnel.
    ConnectMitm { host: String, port: u16 },
    /// CONNECT or forward-proxy target that isn't a known service: silent close.
    ClosedUnknown,
    /// Host header outside the allowlist: 403.
    ClosedDisallowedHost { host: String },
}

/// `Upgrade: websocket` + `Connection:` containing the `upgrade` token
/// (case-insensitive both ways).
pub fn is_upgrade(headers: &ParsedHeaders) -> bool {
    let upgrade_ws = headers
        .header("upgrade")
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let connection_has_upgrade = headers
        .header("connection")
        .map(|v| {
            v.split(',')
                .any(|tok| tok.trim().eq_ignore_ascii_case("upgrade"))
        })
        .unwrap_or(false);
    upgrade_ws && connection_has_upgrade
}

/// Host header allowlist for non-proxy requests:
/// `localhost`, `*.localhost`, `127.0.0.1`, `::1`, or any bare label with
/// no dot.
fn host_allowed(host: &str) -> bool {
    let h = host.to_ascii_lowercase();
    h == "localhost"
        || h == "127.0.0.1"
        || h == "::1"
        || h.ends_with(".localhost")
        || !h.contains('.')
}

fn strip_port(host: &str) -> &str {
    // IPv6 literals like "::1" have no port suffix in our inputs; plain
    // "host:port" is the only form we need to handle here.
    if host.starts_with('[') {
        return host.split(']').next().map(|s| &s[1..]).unwrap_or(host);
    }
    host.split(':').next().unwrap_or(host)
}

fn subdomain_of(host: &str) -> String {
    let host = strip_port(host);
    host.strip_suffix(".localhost").unwrap_or(host).to_string()
}

/// Parse an absolute-URI request-target (`http://host[:port]/path`) into
/// `(host_with_port, relative_target)`.
fn parse_absolute_target(target: &str) -> Option<(String, String)> {
    let rest = target
        .strip_prefix("http://")
        .or_else(|| target.strip_prefix("https://"))?;
    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    Some((authority.to_string(), path.to_string()))
}

fn parse_connect_target(target: &str) -> Option<(String, u16)> {
    let (host, port_str) = target.rsplit_once(':')?;
    let port = port_str.parse::<u16>().ok()?;
    Some((host.to_string(), port))
}

pub fn classify(
    parsed: &ParsedHeaders,
    mapping: &Mapping,
    listen_port: u16,
    mitm_available: bool,
) -> RequestShape {
    // Rule 1: CONNECT tunnels.
    if parsed.method.eq_ignore_ascii_case("CONNECT") {
        let Some((host, _client_requested_port)) = parse_connect_target(&parsed.target) else {
            return RequestShape::ClosedUnknown;
        };
        let Some(&mapped_port) = mapping.get(&host) else {
            return RequestShape::ClosedUnknown;
        };
        if _client_requested_port == 443 && mitm_available {
            return RequestShape::ConnectMitm {
                host,
                port: mapped_port,
            };
        }
        return RequestShape::ConnectPlain {
            host,
            port: mapped_port,
        };
    }

    // Rule 2: forward-proxy absolute-URI request.
    if let Some((authority, relative_target)) = parse_absolute_target(&parsed.target) {
        let proxy_target = strip_port(&authority).to_string();

        let Some(&port) = mapping.get(&proxy_target) else {
            return RequestShape::ClosedUnknown;
        };

        if port == listen_port {
            return RequestShape::Dashboard;
        }

        if is_upgrade(parsed) {
            return RequestShape::ForwardWs {
                relative_target,
                port,
                proxy_target,
            };
        }
        return RequestShape::ForwardHttp {
            relative_target,
            port,
            https_redirect: mitm_available,
            proxy_target,
        };
    }

    // Rule 3: Host allowlist for everything else.
    let host = parsed.header("host").unwrap_or("").to_string();
    if !host_allowed(strip_port(&host)) {
        return RequestShape::ClosedDisallowedHost { host };
    }

    // Rule 4: dashboard.
    let host_no_port = strip_port(&host).to_ascii_lowercase();
    let is_bare_localhost = host_no_port == "localhost" || host_no_port == "127.0.0.1" || host_no_port == "::1";
    let subdomain = subdomain_of(&host);
    let subdomain_is_self = mapping.get(&subdomain).copied() == Some(listen_port);
    let has_no_subdomain = !host_no_port.contains('.');
    if is_bare_localhost || subdomain_is_self || has_no_subdomain {
        return RequestShape::Dashboard;
    }

    // Rule 5: reverse-proxy lookup.
    match mapping.get(&subdomain).copied() {
        None => RequestShape::ReverseNotFound { subdomain },
        Some(port) if is_upgrade(parsed) => RequestShape::WsUpgrade { subdomain, port },
        Some(port) => RequestShape::HttpProxy { subdomain, port },
    }
}
