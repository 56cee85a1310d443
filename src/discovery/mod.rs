//! Service discovery: `NAME=<label>`-tagged processes -> listening port.
//!
//! Pure function of OS state (via [`probe`]) plus a TTL cache. Never fails
//! the caller — a scan error degrades to the previous mapping (or an empty
//! one on first run); discovery logs and degrades, it never raises.

pub mod probe;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use probe::{PortLister, ProcessEnvReader};

/// Known debug ports excluded from port selection.
const DEBUG_PORTS: &[u16] = &[9229, 9222, 5858];

/// Ports at or above this are considered ephemeral/transient.
const EPHEMERAL_THRESHOLD: u16 = 49152;

/// A single process/port belonging to a named service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEntry {
    pub name: String,
    pub port: u16,
    pub pid: u32,
}

/// `name -> port` snapshot produced by one scan.
pub type Mapping = HashMap<String, u16>;

/// Choose one port for a name from the set of ports its processes expose.
///
/// 1. Remove known debug ports and ephemeral ports (>= 49152).
/// 2. If any survive, pick the smallest.
/// 3. Otherwise every port was debug/ephemeral — fall back to the smallest
///    port from the unfiltered set.
fn select_port(ports: &HashSet<u16>) -> u16 {
    let filtered: Vec<u16> = ports
        .iter()
        .copied()
        .filter(|p| !DEBUG_PORTS.contains(p) && *p < EPHEMERAL_THRESHOLD)
        .collect();
    if let Some(p) = filtered.into_iter().min() {
        return p;
    }
    // Fallback: every candidate was debug/ephemeral. Still must pick one.
    *ports.iter().min().expect("select_port called with empty port set")
}

/// Scan the host for `NAME`-tagged listening processes.
///
/// Returns an empty list (not an error) when the underlying OS probe
/// fails — errors are logged by the caller, never propagated into the
/// connection path.
pub fn scan(
    ports: &dyn PortLister,
    env_reader: &dyn ProcessEnvReader,
    debug: bool,
) -> Vec<ServiceEntry> {
    let listening = match ports.listening_ports() {
        Ok(v) => v,
        Err(e) => {
            if debug {
                eprintln!("discovery: listening_ports failed: {e:#}");
            }
            return Vec::new();
        }
    };

    // Dedupe ports per pid.
    let mut ports_by_pid: HashMap<u32, HashSet<u16>> = HashMap::new();
    for (pid, port) in listening {
        ports_by_pid.entry(pid).or_default().insert(port);
    }

    // Read NAME from each distinct pid's environment; ignore pids without it.
    let mut ports_by_name: HashMap<String, HashSet<u16>> = HashMap::new();
    let mut pid_by_name: HashMap<String, u32> = HashMap::new();
    for (pid, pid_ports) in ports_by_pid {
        let env_line = match env_reader.read_env(pid) {
            Ok(s) => s,
            Err(e) => {
                if debug {
                    eprintln!("discovery: read_env({pid}) failed: {e:#}");
                }
                continue;
            }
        };
        let Some(name) = probe::extract_name_var(&env_line) else {
            continue;
        };
        ports_by_name.entry(name.clone()).or_default().extend(pid_ports);
        // Arbitrary representative pid: last one visited for this name.
        pid_by_name.insert(name, pid);
    }

    ports_by_name
        .into_iter()
        .map(|(name, port_set)| {
            let port = select_port(&port_set);
            let pid = pid_by_name.get(&name).copied().unwrap_or(0);
            ServiceEntry { name, port, pid }
        })
        .collect()
}

/// Build the `name -> port` mapping from a list of service entries.
/// Last-writer wins on duplicate names — acceptable because scans are
/// idempotent within a TTL window.
pub fn build_mapping(entries: &[ServiceEntry]) -> Mapping {
    entries.iter().map(|e| (e.name.clone(), e.port)).collect()
}

/// TTL-cached, single-flight-guarded mapping snapshot.
///
/// Concurrent readers during a refresh see either the previous mapping or
/// the freshly-built one, never a torn/partial map — the refresh builds a
/// brand new `Arc<Mapping>` and swaps it in only once fully built.
pub struct DiscoveryCache {
    ports: Arc<dyn PortLister>,
    env_reader: Arc<dyn ProcessEnvReader>,
    ttl: Duration,
    debug: bool,
    state: Mutex<CacheState>,
}

struct CacheState {
    mapping: Arc<Mapping>,
    last_scan: Option<Instant>,
}

impl DiscoveryCache {
    pub fn new(ports: Arc<dyn PortLister>, env_reader: Arc<dyn ProcessEnvReader>, ttl: Duration, debug: bool) -> Self {
        Self {
            ports,
            env_reader,
            ttl,
            debug,
            state: Mutex::new(CacheState {
                mapping: Arc::new(Mapping::new()),
                last_scan: None,
            }),
        }
    }

    pub fn with_defaults(ttl: Duration, debug: bool) -> Self {
        Self::new(
            Arc::new(probe::LsofPortLister),
            Arc::new(probe::SystemEnvReader),
            ttl,
            debug,
        )
    }

    /// Return the cached mapping if still fresh, otherwise perform a single
    /// scan shared by all concurrent callers (the lock itself is the
    /// single-flight: whoever gets it first refreshes, everyone else who
    /// was waiting sees the now-fresh result instead of re-scanning).
    ///
    /// The scan itself runs via `spawn_blocking` — it shells out to `lsof`/
    /// `ps` and reads `/proc`, none of which may run on the async
    /// executor's thread without stalling every other connection's
    /// progress.
    pub async fn get_mapping(&self) -> Arc<Mapping> {
        let mut state = self.state.lock().await;
        let fresh = state
            .last_scan
            .map(|t| t.elapsed() <= self.ttl)
            .unwrap_or(false);
        if fresh {
            return state.mapping.clone();
        }

        let ports = self.ports.clone();
        let env_reader = self.env_reader.clone();
        let debug = self.debug;
        let entries = tokio::task::spawn_blocking(move || scan(ports.as_ref(), env_reader.as_ref(), debug))
            .await
            .unwrap_or_default();
        let new_mapping = build_mapping(&entries);
        // On a scan that yields nothing because the probe itself errored,
        // `scan` already logged and returned an empty list — but an empty
        // *environment* (no NAME-tagged processes at all) is also a valid,
        // legitimately empty mapping. Either way we still refresh
        // `last_scan` so we don't hot-loop retrying every call.
        state.mapping = Arc::new(new_mapping);
        state.last_scan = Some(Instant::now());
        state.mapping.clone()
    }
}
