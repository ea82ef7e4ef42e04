//! Rewriting browser request headers for a backend connection.

use crate::auth::parse_cookie_pairs;
use tokio_tungstenite::tungstenite::http::Uri;

/// Headers the backend handshake sets itself.
fn is_handshake_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.contains("sec-websocket")
        || lower.contains("upgrade")
        || matches!(lower.as_str(), "connection" | "host" | "content-length")
}

/// `host:port` of a backend base URL such as `ws://localhost:8888`.
pub fn backend_authority(target_base: &str) -> Option<String> {
    let uri: Uri = target_base.parse().ok()?;
    let authority = uri.authority()?;
    Some(authority.as_str().to_string())
}

/// Point a header value at the backend: public host → backend authority,
/// https → http, `%7C` → `|`.
fn rewrite_value(value: &str, public_host: &str, authority: Option<&str>) -> String {
    let mut out = value.to_string();
    if let (false, Some(authority)) = (public_host.is_empty(), authority) {
        out = out.replace(public_host, authority);
    }
    out.replace("https", "http").replace("%7C", "|")
}

/// Build the header list for the backend request.
///
/// Handshake headers are dropped. `Cookie` headers are parsed and merged into
/// one rebuilt `Cookie` header placed last.
pub fn rewrite_headers(
    headers: &[(String, String)],
    public_host: &str,
    target_base: &str,
) -> Vec<(String, String)> {
    let authority = backend_authority(target_base);
    let mut out = Vec::with_capacity(headers.len());
    let mut cookies = Vec::new();

    for (name, value) in headers {
        if name.eq_ignore_ascii_case("cookie") {
            let rewritten = rewrite_value(value, public_host, authority.as_deref());
            cookies.extend(parse_cookie_pairs(&rewritten));
            continue;
        }
        if is_handshake_header(name) {
            continue;
        }
        out.push((
            name.clone(),
            rewrite_value(value, public_host, authority.as_deref()),
        ));
    }

    if !cookies.is_empty() {
        let joined = cookies
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("; ");
        out.push(("Cookie".to_string(), joined));
    }
    out
}
