use axum::http::HeaderMap;

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_REAL_IP: &str = "x-real-ip";

// Fallback key when the connection address is unknown
const UNKNOWN_CLIENT: &str = "unknown";

/// Rate-limit key for a request.
///
/// Order: first hop of `X-Forwarded-For`, then `X-Real-IP`, then the remote
/// address without its `:port` suffix. Header values are taken verbatim and
/// not checked for being well-formed addresses.
pub fn client_key(headers: &HeaderMap, remote_addr: Option<&str>) -> String {
    // X-Forwarded-For: "client, proxy1, proxy2" - keep the original client
    if let Some(forwarded_for) = header_str(headers, X_FORWARDED_FOR) {
        let first = forwarded_for.split(',').next().unwrap_or(forwarded_for);
        if !first.is_empty() {
            return first.to_string();
        }
    }

    if let Some(real_ip) = header_str(headers, X_REAL_IP) {
        return real_ip.to_string();
    }

    match remote_addr {
        Some(addr) if !addr.is_empty() => strip_port(addr).to_string(),
        _ => UNKNOWN_CLIENT.to_string(),
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

// "10.0.0.1:5000" -> "10.0.0.1"; split at the last colon
fn strip_port(addr: &str) -> &str {
    match addr.rsplit_once(':') {
        Some((host, _)) if !host.is_empty() => host,
        _ => addr,
    }
}
