//! Minimal HTTP/1.1 request-header parsing over an accumulating byte buffer.
//!
//! Only enough to classify and route a request: method, request-target,
//! and a case-insensitive header map. No chunked-body parsing, no
//! body-streaming — whatever body bytes have already arrived by the time
//! headers complete are forwarded as-is by the caller.

use std::collections::HashMap;

/// A parsed request-header block.
#[derive(Debug, Clone, Default)]
pub struct ParsedHeaders {
    pub complete: bool,
    pub method: String,
    pub target: String,
    /// Lowercased header names -> trimmed values. Last-wins on duplicates.
    pub headers: HashMap<String, String>,
    /// Byte offset of the end of the header block (just past `\r\n\r\n`),
    /// i.e. where the body (if any) begins in the source buffer.
    pub header_end_index: usize,
}

impl ParsedHeaders {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }
}

/// Look for a complete `\r\n\r\n`-terminated request-header block in `buf`.
/// Returns `complete: false` (not an error — wait for more bytes) when the
/// terminator hasn't arrived yet.
pub fn parse_headers(buf: &[u8]) -> ParsedHeaders {
    let Some(term_pos) = find_header_terminator(buf) else {
        return ParsedHeaders {
            complete: false,
            ..Default::default()
        };
    };

    let header_end_index = term_pos + 4;
    let head = &buf[..term_pos];
    let text = String::from_utf8_lossy(head);
    let mut lines = text.split("\r\n");

    let request_line = lines.next().unwrap_or("");
    let mut parts = request_line.splitn(3, ' ');
    let method = parts.next().unwrap_or("").to_string();
    let target = parts.next().unwrap_or("").to_string();

    let mut headers = HashMap::new();
    for line in lines {
        let Some(colon) = line.find(':') else {
            continue; // a line without ':' is ignored
        };
        let key = line[..colon].trim().to_ascii_lowercase();
        if key.is_empty() {
            continue;
        }
        let value = line[colon + 1..].trim().to_string();
        headers.insert(key, value);
    }

    ParsedHeaders {
        complete: true,
        method,
        target,
        headers,
        header_end_index,
    }
}

fn find_header_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}
