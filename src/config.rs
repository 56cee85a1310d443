//! Runtime configuration, resolved once at startup from the environment.
//!
//! No config.toml, no persisted mapping file — this process carries no
//! state across restarts, so its only configuration surface is env vars.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

/// Default listen port when `PORT` is unset or unparseable.
pub const DEFAULT_PORT: u16 = 9090;

/// Default bind host when `BIND_HOST` is unset or unparseable.
pub const DEFAULT_BIND_HOST: IpAddr = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));

/// Default discovery mapping cache TTL.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5);

/// Resolved process configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub listen_port: u16,
    pub bind_host: IpAddr,
    pub debug: bool,
    pub cache_ttl: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_PORT,
            bind_host: DEFAULT_BIND_HOST,
            debug: false,
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }
}

impl Settings {
    /// Build settings from the environment. A missing or unparseable value
    /// falls back to its default and is logged, never a hard error — a
    /// malformed `PORT` should not stop the proxy from starting.
    pub fn from_env() -> Self {
        let mut settings = Settings::default();

        if let Ok(raw) = std::env::var("PORT") {
            match raw.parse::<u16>() {
                Ok(p) => settings.listen_port = p,
                Err(e) => eprintln!("ignoring invalid PORT={raw:?}: {e}"),
            }
        }

        if let Ok(raw) = std::env::var("BIND_HOST") {
            match raw.parse::<IpAddr>() {
                Ok(h) => settings.bind_host = h,
                Err(e) => eprintln!("ignoring invalid BIND_HOST={raw:?}: {e}"),
            }
        }

        if let Ok(raw) = std::env::var("DEBUG") {
            settings.debug = matches!(raw.as_str(), "1" | "true" | "TRUE" | "yes");
        }

        if let Ok(raw) = std::env::var("DISCOVERY_CACHE_TTL_SECS") {
            match raw.parse::<u64>() {
                Ok(secs) => settings.cache_ttl = Duration::from_secs(secs),
                Err(e) => eprintln!("ignoring invalid DISCOVERY_CACHE_TTL_SECS={raw:?}: {e}"),
            }
        }

        settings
    }
}

/// Base directory for the CA/leaf-cert store this process maintains.
/// Respects `LOCALHOME_HOME` (handy for tests) before falling back to the
/// platform data dir, a common env-override-then-platform-dir resolution order.
pub fn ca_store_dir() -> PathBuf {
    if let Ok(home) = std::env::var("LOCALHOME_HOME") {
        return PathBuf::from(home).join("ca");
    }
    if let Some(dirs) = directories::ProjectDirs::from("com", "bjoernf", "localhome") {
        return dirs.data_dir().join("ca");
    }
    PathBuf::from(".localhome").join("ca")
}
