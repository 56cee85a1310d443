//! OS-facing collaborators discovery needs: "list listening sockets with
//! PIDs" and "read a process's environment". Kept behind traits so the
//! selection/grouping logic in `discovery::mod` is unit-testable without a
//! live process tree: a trait, a `Command`-backed impl, an injectable
//! alternative for tests.

use anyhow::{Context, Result};
use std::process::Command;

/// Enumerates listening TCP sockets on the local host as `(pid, port)` pairs.
pub trait PortLister: Send + Sync {
    fn listening_ports(&self) -> Result<Vec<(u32, u16)>>;
}

/// Reads the full environment of a process as one space-separated line
/// (one space-separated line: `KEY1=value with spaces KEY2=value2 ...`).
pub trait ProcessEnvReader: Send + Sync {
    fn read_env(&self, pid: u32) -> Result<String>;
}

/// Default `PortLister`: shells out to `lsof`, the same
/// spawn-an-external-tool idiom used elsewhere for platform-specific
/// commands.
pub struct LsofPortLister;

impl PortLister for LsofPortLister {
    fn listening_ports(&self) -> Result<Vec<(u32, u16)>> {
        let output = Command::new("lsof")
            .args(["-iTCP", "-sTCP:LISTEN", "-P", "-n"])
            .output()
            .context("spawn lsof")?;
        if !output.status.success() {
            anyhow::bail!("lsof exited with status {}", output.status);
        }
        let text = String::from_utf8_lossy(&output.stdout);
        Ok(parse_lsof_output(&text))
    }
}

/// Parse `lsof -iTCP -sTCP:LISTEN -P -n` output:
/// `COMMAND   PID  USER   FD   TYPE DEVICE SIZE/OFF NODE NAME`
/// `NAME` ends in e.g. `*:3000 (LISTEN)` or `127.0.0.1:3000 (LISTEN)`.
fn parse_lsof_output(text: &str) -> Vec<(u32, u16)> {
    let mut out = Vec::new();
    for line in text.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 9 {
            continue;
        }
        let Ok(pid) = fields[1].parse::<u32>() else {
            continue;
        };
        let name = fields[8];
        let Some(addr) = name.split(':').next_back() else {
            continue;
        };
        if let Ok(port) = addr.parse::<u16>() {
            out.push((pid, port));
        }
    }
    out
}

/// Default `ProcessEnvReader`: `/proc/<pid>/environ` where present (Linux),
/// falling back to `ps -ww -o command=` (macOS, no `/proc`). Both are
/// normalized to one space-separated line so a single parser serves them.
pub struct SystemEnvReader;

impl ProcessEnvReader for SystemEnvReader {
    fn read_env(&self, pid: u32) -> Result<String> {
        let proc_path = format!("/proc/{pid}/environ");
        if let Ok(bytes) = std::fs::read(&proc_path) {
            let joined = bytes
                .split(|&b| b == 0)
                .filter(|s| !s.is_empty())
                .map(|s| String::from_utf8_lossy(s).into_owned())
                .collect::<Vec<_>>()
                .join(" ");
            return Ok(joined);
        }

        let output = Command::new("ps")
            .args(["-ww", "-o", "command=", "-p", &pid.to_string()])
            .output()
            .context("spawn ps")?;
        if !output.status.success() {
            anyhow::bail!("ps exited with status {}", output.status);
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Extract the value of `NAME` from a one-line, space-separated
/// `KEY=value KEY2=value with spaces` environment dump.
///
/// Splits on the pattern "space followed by an identifier followed by =";
/// the leading segment belongs to the preceding key. This tolerates
/// arbitrary value contents except values that themselves contain a
/// ` KEY=`-shaped substring (documented, accepted limitation).
pub fn extract_name_var(env_line: &str) -> Option<String> {
    let pairs = split_env_pairs(env_line);
    for (key, value) in pairs {
        if key == "NAME" {
            return Some(value);
        }
    }
    None
}

/// Split a `KEY=value KEY2=value2 ...` line into `(key, value)` pairs,
/// tolerating values that contain spaces.
fn split_env_pairs(line: &str) -> Vec<(String, String)> {
    // Find every index where a new `IDENT=` starts right after a space
    // (or at the very start of the line).
    let bytes = line.as_bytes();
    let mut starts = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if i == 0 || bytes[i - 1] == b' ' {
            if let Some(eq) = find_key_end(&line[i..]) {
                starts.push((i, i + eq));
            }
        }
        i += 1;
    }

    let mut out = Vec::new();
    for idx in 0..starts.len() {
        let (key_start, eq_pos) = starts[idx];
        let key = line[key_start..eq_pos].to_string();
        let value_start = eq_pos + 1;
        let value_end = if idx + 1 < starts.len() {
            // trim the trailing space before the next key
            starts[idx + 1].0.saturating_sub(1)
        } else {
            line.len()
        };
        let value_end = value_end.max(value_start);
        out.push((key, line[value_start..value_end].to_string()));
    }
    out
}

/// If `s` starts with a bare identifier (`[A-Za-z_][A-Za-z0-9_]*`) followed
/// by `=`, return the byte offset of that `=`.
fn find_key_end(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    if bytes.is_empty() {
        return None;
    }
    let mut i = 0;
    if !(bytes[0].is_ascii_alphabetic() || bytes[0] == b'_') {
        return None;
    }
    i += 1;
    while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
        i += 1;
    }
    if i < bytes.len() && bytes[i] == b'=' {
        Some(i)
    } else {
        None
    }
}
