//! Dashboard HTML and `/proxy.pac`.

use crate::discovery::Mapping;

/// `GET /proxy.pac` body: routes any bare (dot-less) hostname except
/// `localhost` itself through `<host>.localhost:<listen_port>`, direct
/// otherwise. Browsers parse this body as JavaScript.
pub fn pac_body(listen_port: u16) -> String {
    format!(
        "function FindProxyForURL(url, host) {{ if (host.indexOf(\".\") === -1 && host !== \"localhost\") return \"PROXY \" + host + \".localhost:{listen_port}; DIRECT\"; return \"DIRECT\"; }}"
    )
}

pub fn pac_response(listen_port: u16) -> Vec<u8> {
    let body = pac_body(listen_port);
    format!(
        "HTTP/1.1 200 OK\r\ncontent-type: application/x-ns-proxy-autoconfig\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
        body.len(),
        body
    )
    .into_bytes()
}

/// Any other dashboard path: an HTML page listing known services, with a
/// placeholder invocation hint when the mapping is empty.
pub fn html_response(mapping: &Mapping) -> Vec<u8> {
    let body = html_body(mapping);
    format!(
        "HTTP/1.1 200 OK\r\ncontent-type: text/html; charset=utf-8\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
        body.len(),
        body
    )
    .into_bytes()
}

fn html_body(mapping: &Mapping) -> String {
    let mut names: Vec<&String> = mapping.keys().collect();
    names.sort();

    let list = if names.is_empty() {
        "<p>No services found yet. Start one with <code>NAME=myapp your-dev-server</code>.</p>"
            .to_string()
    } else {
        let items: String = names
            .iter()
            .map(|name| format!("<li><a href=\"http://{name}/\">{name}</a></li>"))
            .collect();
        format!("<ul>{items}</ul>")
    };

    format!(
        "<html><head><title>localhome</title></head><body><h1>localhome</h1>{list}</body></html>"
    )
}
