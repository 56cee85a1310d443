//! Shared plain-text/HTML response builders for the handful of statuses
//! the connection state machine itself produces: `400`, `403`, `404`,
//! `302`, `502`. These are serialized directly — there's no
//! hyper `Service` on the front-end connection to hand a `Response<_>` to.

pub fn bad_request(msg: &str) -> Vec<u8> {
    plain_text(400, "Bad Request", msg)
}

pub fn forbidden(host: &str) -> Vec<u8> {
    plain_text(
        403,
        "Forbidden",
        &format!("Host {host:?} is not allowed"),
    )
}

pub fn not_found(subdomain: &str) -> Vec<u8> {
    plain_text(
        404,
        "Not Found",
        &format!("No server found for \"{subdomain}.localhost\""),
    )
}

pub fn bad_gateway(reason: &str) -> Vec<u8> {
    plain_text(502, "Bad Gateway", &format!("Bad gateway: {reason}"))
}

pub fn redirect_to_https(host_with_port: &str, relative_target: &str) -> Vec<u8> {
    let location = format!("https://{host_with_port}{relative_target}");
    format!(
        "HTTP/1.1 302 Found\r\nLocation: {location}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
    )
    .into_bytes()
}

fn plain_text(status: u16, reason: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {status} {reason}\r\ncontent-type: text/plain\r\ncontent-length: {len}\r\nconnection: close\r\n\r\n{body}",
        len = body.len()
    )
    .into_bytes()
}
