//! Response body rewriting
//!
//! Backends describe themselves with addresses only reachable from the gateway
//! (`ws://127.0.0.1:41000/devtools/...`). Clients need those URLs pointed back
//! at the gateway, so the backend authority is swapped for the public host
//! wherever it appears in a socket URL.

/// URL shapes an authority is recognized in.
///
/// Scheme forms: `ws://{addr}`, `wss://{addr}`.
/// Query forms (DevTools `devtoolsFrontendUrl`): `ws={addr}`, `wss={addr}`.
const PREFIXES: [&[u8]; 4] = [b"wss://", b"ws://", b"wss=", b"ws="];

/// Replace `backend_address` with `public_host` inside recognized socket URLs.
///
/// Content without `backend_address` comes back byte-identical, and applying
/// the function to its own output is a no-op. When `public_host` extends
/// `backend_address` with a path, URLs already carrying that path are left
/// alone.
pub fn rewrite(body: &[u8], backend_address: &str, public_host: &str) -> Vec<u8> {
    let addr = backend_address.as_bytes();
    if addr.is_empty() || backend_address == public_host {
        return body.to_vec();
    }

    // The part of `public_host` past `backend_address`, if it extends it
    let extension = public_host
        .strip_prefix(backend_address)
        .filter(|rest| rest.starts_with('/'))
        .map(str::as_bytes);

    let mut out = Vec::with_capacity(body.len());
    let mut i = 0;

    while i < body.len() {
        match match_at(body, i, addr, extension) {
            Some(prefix) => {
                out.extend_from_slice(prefix);
                out.extend_from_slice(public_host.as_bytes());
                i += prefix.len() + addr.len();
            }
            None => {
                out.push(body[i]);
                i += 1;
            }
        }
    }

    out
}

/// Apply [`rewrite`] once for each address in order
pub fn rewrite_all(body: &[u8], backend_addresses: &[String], public_host: &str) -> Vec<u8> {
    backend_addresses
        .iter()
        .fold(body.to_vec(), |acc, addr| rewrite(&acc, addr, public_host))
}

/// The prefix matched at `i` when it is followed by exactly `addr` and not
/// already by the rewritten form
fn match_at(
    body: &[u8],
    i: usize,
    addr: &[u8],
    extension: Option<&[u8]>,
) -> Option<&'static [u8]> {
    let rest = &body[i..];
    let prev = i.checked_sub(1).map(|p| body[p]);

    PREFIXES.into_iter().find(|prefix| {
        if !rest.starts_with(prefix) || !prefix_boundary(prefix, prev) {
            return false;
        }
        let after_prefix = &rest[prefix.len()..];
        if !after_prefix.starts_with(addr) {
            return false;
        }
        let after_addr = &after_prefix[addr.len()..];
        if extension.is_some_and(|ext| after_addr.starts_with(ext)) {
            return false;
        }
        authority_ends(after_addr.first().copied())
    })
}

fn prefix_boundary(prefix: &[u8], prev: Option<u8>) -> bool {
    match prev {
        None => true,
        // Query forms only count as their own parameter
        Some(b) if prefix.ends_with(b"=") => matches!(b, b'?' | b'&' | b';'),
        Some(b) => !b.is_ascii_alphanumeric(),
    }
}

fn authority_ends(next: Option<u8>) -> bool {
    match next {
        None => true,
        Some(b) => {
            b.is_ascii_whitespace()
                || matches!(b, b'/' | b'"' | b'\'' | b'?' | b'#' | b'&' | b'\\' | b'<')
        }
    }
}

/// Whether a response with this content type carries rewritable text
pub fn is_text_content_type(content_type: &str) -> bool {
    let ct = content_type.to_lowercase();
    ct.contains("json")
        || ct.contains("html")
        || ct.contains("xml")
        || ct.contains("text/")
        || ct.contains("javascript")
        || ct.contains("css")
}
