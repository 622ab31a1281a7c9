use std::net::SocketAddr;

use super::http::RequestHead;

// First present header wins; multi-valued headers contribute their first
// comma-separated entry
const IP_HEADERS: &[&str] = &[
    "CF-Connecting-IP",
    "X-Forwarded-For",
    "X-Real-IP",
    "X-Forwarded",
    "X-Cluster-Client-IP",
    "True-Client-IP",
    "X-CloudFront-Forwarded-For",
];

/// The client address a request entered the network with, as far as the
/// forwarding headers can be trusted. The value is relayed opaquely, so the
/// first non-empty header is taken as is; only a request with none of them
/// falls back to the socket peer.
pub fn resolve(req: &RequestHead, peer: SocketAddr) -> String {
    for name in IP_HEADERS {
        if let Some(value) = req.header(name) {
            let first = value.split(',').next().unwrap_or("").trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    peer.ip().to_string()
}
