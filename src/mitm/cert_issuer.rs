//! Local CA bootstrap and per-hostname leaf certificate issuance: an
//! `rcgen`-generated self-signed CA, leaf certs signed by it. One implicit
//! CA (no named-CA management, no CLI), leaf certs cached in memory only
//! (the TLS virtual-server registry they back isn't persisted across
//! restarts either).

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use rcgen::{CertificateParams, IsCa, KeyPair};
use rustls::sign::CertifiedKey;

use crate::config::ca_store_dir;

struct LoadedCa {
    cert_pem: String,
    key_pem: String,
}

/// Issues per-hostname leaf certificates signed by a lazily-bootstrapped
/// local CA. `mitm_available()` degrades to `false` on any CA load/create
/// failure rather than panicking — MITM is an optional adjunct, never
/// something the rest of the proxy depends on.
pub struct CertIssuer {
    ca: Result<LoadedCa, String>,
    leaf_cache: Mutex<HashMap<String, Arc<CertifiedKey>>>,
}

impl CertIssuer {
    pub fn load_or_create() -> Self {
        let ca = load_or_create_ca().map_err(|e| format!("{e:#}"));
        Self {
            ca,
            leaf_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn mitm_available(&self) -> bool {
        self.ca.is_ok()
    }

    /// Issue (or return a cached) leaf certificate for `hostname`, valid
    /// for the TLS virtual server registry's whole process lifetime.
    pub fn get_cert(&self, hostname: &str) -> Result<Arc<CertifiedKey>> {
        if let Some(cached) = self.leaf_cache.lock().unwrap().get(hostname) {
            return Ok(cached.clone());
        }

        let ca = self
            .ca
            .as_ref()
            .map_err(|e| anyhow::anyhow!("CA unavailable: {e}"))?;

        let issuer_key = KeyPair::from_pem(&ca.key_pem).context("parse CA key")?;
        let issuer_params =
            CertificateParams::from_ca_cert_pem(&ca.cert_pem).context("parse CA cert")?;
        let issuer_cert = issuer_params
            .self_signed(&issuer_key)
            .context("reconstruct issuer cert")?;

        let subject_key = KeyPair::generate().context("generate leaf key")?;
        let mut params = CertificateParams::new(vec![hostname.to_string()])
            .context("create leaf cert params")?;
        params.distinguished_name = rcgen::DistinguishedName::new();
        params.distinguished_name.push(
            rcgen::DnType::CommonName,
            rcgen::DnValue::Utf8String(hostname.to_string()),
        );
        params.is_ca = IsCa::NoCa;
        let now = time::OffsetDateTime::now_utc();
        params.not_after = now.saturating_add(time::Duration::days(397));

        let cert = params
            .signed_by(&subject_key, &issuer_cert, &issuer_key)
            .context("sign leaf cert")?;

        let cert_der = cert.der().clone();
        let key_der = rustls::pki_types::PrivateKeyDer::try_from(subject_key.serialize_der())
            .map_err(|e| anyhow::anyhow!("key to der: {e}"))?;
        let provider = rustls::crypto::CryptoProvider::get_default()
            .cloned()
            .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()));
        let signing_key = provider
            .key_provider
            .load_private_key(key_der)
            .context("load leaf private key")?;
        let certified = Arc::new(CertifiedKey::new(vec![cert_der], signing_key));

        self.leaf_cache
            .lock()
            .unwrap()
            .insert(hostname.to_string(), certified.clone());
        Ok(certified)
    }
}

fn load_or_create_ca() -> Result<LoadedCa> {
    let dir = ca_store_dir();
    fs::create_dir_all(&dir).with_context(|| format!("create CA dir {}", dir.display()))?;
    let ca_path = dir.join("ca.pem");
    let key_path = dir.join("ca-key.pem");

    if ca_path.is_file() && key_path.is_file() {
        let cert_pem = fs::read_to_string(&ca_path).context("read ca.pem")?;
        let key_pem = fs::read_to_string(&key_path).context("read ca-key.pem")?;
        return Ok(LoadedCa { cert_pem, key_pem });
    }

    let key_pair = KeyPair::generate().context("generate CA key pair")?;
    let mut params = CertificateParams::default();
    params.distinguished_name = rcgen::DistinguishedName::new();
    params.distinguished_name.push(
        rcgen::DnType::CommonName,
        rcgen::DnValue::Utf8String("localhome CA".to_string()),
    );
    params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    params.key_usages = vec![
        rcgen::KeyUsagePurpose::KeyCertSign,
        rcgen::KeyUsagePurpose::CrlSign,
    ];
    let cert = params
        .self_signed(&key_pair)
        .context("create CA certificate")?;

    let cert_pem = cert.pem();
    let key_pem = key_pair.serialize_pem();

    fs::File::create(&ca_path)
        .and_then(|mut f| f.write_all(cert_pem.as_bytes()))
        .with_context(|| format!("write {}", ca_path.display()))?;
    fs::File::create(&key_path)
        .and_then(|mut f| f.write_all(key_pem.as_bytes()))
        .with_context(|| format!("write {}", key_path.display()))?;

    Ok(LoadedCa { cert_pem, key_pem })
}
