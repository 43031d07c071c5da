use axum::http::HeaderMap;
use std::net::{IpAddr, SocketAddr};

/// Picks the client address: the first hop of the first trusted header that parses, else the
/// socket peer.
#[must_use]
pub fn client_ip(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trusted: &[String],
) -> Option<IpAddr> {
    for name in trusted {
        let Some(value) = headers.get(name.as_str()).and_then(|v| v.to_str().ok()) else {
            continue;
        };
        let first = value.split(',').next().unwrap_or_default().trim();
        if let Ok(ip) = first.parse::<IpAddr>() {
            return Some(ip);
        }
        if let Ok(addr) = first.parse::<SocketAddr>() {
            return Some(addr.ip());
        }
    }
    peer.map(|p| p.ip())
}
