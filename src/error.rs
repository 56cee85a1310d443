//! Error kinds the connection state machine branches on.
//!
//! Discovery, cert issuance, and other leaf modules keep using
//! `anyhow::Result` with `.context(...)` — their failures are always
//! logged-and-degraded, never branched on by a caller, so they never need a
//! `ProxyError` variant of their own. Unknown-service and disallowed-host
//! outcomes are likewise not modeled here: they're routing decisions the
//! classifier already resolves into a `RequestShape` variant, not failures
//! a backend call can raise. `ProxyError` covers only the outcomes that
//! actually arise from driving a backend connection.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("could not connect to backend on port {port}: {source}")]
    BackendConnectFailed {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("backend request failed: {0}")]
    BackendHttpFailed(String),

    #[error("backend closed the connection")]
    BackendClosed,

    #[error("client closed the connection")]
    ClientClosed,
}
