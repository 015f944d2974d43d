//! Re-serialisation of the client's request head for the upstream host.

use crate::server::head::RequestHead;

/// Encode `head` as it should be sent upstream: the request target becomes
/// `upstream_path` (query string kept) and `Host` names the upstream.  All
/// other headers are forwarded byte for byte, in order.
pub fn encode_upstream_request(
    head: &RequestHead,
    upstream_host: &str,
    upstream_path: &str,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(256 + head.headers.len() * 32);

    out.extend_from_slice(head.method.as_bytes());
    out.push(b' ');
    out.extend_from_slice(upstream_path.as_bytes());
    if let Some(query) = head.query() {
        out.push(b'?');
        out.extend_from_slice(query.as_bytes());
    }
    out.extend_from_slice(format!(" HTTP/1.{}\r\n", head.version).as_bytes());

    let mut saw_host = false;
    for (name, value) in &head.headers {
        if name.eq_ignore_ascii_case("host") {
            if saw_host {
                continue;
            }
            saw_host = true;
            push_header(&mut out, "Host", upstream_host.as_bytes());
        } else {
            push_header(&mut out, name, value);
        }
    }
    if !saw_host {
        push_header(&mut out, "Host", upstream_host.as_bytes());
    }

    out.extend_from_slice(b"\r\n");
    out
}

fn push_header(out: &mut Vec<u8>, name: &str, value: &[u8]) {
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value);
    out.extend_from_slice(b"\r\n");
}
