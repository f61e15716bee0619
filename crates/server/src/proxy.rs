//! Reverse proxy to the cluster API host, gated by a client-IP allowlist.
//!
//! Responses stream through, so long-lived watch requests work. The
//! configured prefix is stripped before forwarding unless it is already
//! `/api`, which maps directly onto the API host paths.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::body::Body;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use manta_cluster::ClusterClient;
use tracing::{debug, warn};

pub(crate) struct ProxyState {
    pub cluster: Arc<dyn ClusterClient>,
    pub allow: AllowList,
    pub strip_prefix: Option<String>,
}

pub(crate) async fn forward(
    state: &ProxyState,
    client_ip: IpAddr,
    request: axum::extract::Request,
) -> Response {
    if !state.allow.permits(client_ip) {
        return (
            StatusCode::FORBIDDEN,
            format!("client addr {client_ip} not allowed"),
        )
            .into_response();
    }
    match forward_inner(state, request).await {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, "api proxy request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                axum::Json(serde_json::json!({"error": e.to_string()})),
            )
                .into_response()
        }
    }
}

async fn forward_inner(
    state: &ProxyState,
    request: axum::extract::Request,
) -> anyhow::Result<Response> {
    let (parts, body) = request.into_parts();
    let path = parts.uri.path();
    let forwarded_path = match &state.strip_prefix {
        Some(prefix) => {
            let stripped = path.strip_prefix(prefix.as_str());
            match stripped {
                Some(rest) if rest.len() < path.len() => {
                    if rest.starts_with('/') { rest.to_string() } else { format!("/{rest}") }
                }
                _ => return Ok(StatusCode::NOT_FOUND.into_response()),
            }
        }
        None => path.to_string(),
    };
    let uri = match parts.uri.query() {
        Some(query) => format!("{forwarded_path}?{query}"),
        None => forwarded_path,
    }
    .parse::<http::Uri>()?;
    debug!(method = %parts.method, uri = %uri, "proxying to cluster api");

    let bytes = axum::body::to_bytes(body, 8 * 1024 * 1024).await?;
    let mut outbound = http::Request::builder().method(parts.method).uri(uri).body(bytes)?;
    *outbound.headers_mut() = parts.headers;

    let upstream = state.cluster.proxy(outbound).await?;
    let (parts, stream) = upstream.into_parts();
    Ok(Response::from_parts(parts, Body::from_stream(stream)))
}

/// Client-IP allowlist: individual addresses and CIDR blocks, parsed from a
/// comma/semicolon/whitespace-separated list. Unparseable entries are
/// ignored.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    ips: Vec<IpAddr>,
    cidrs: Vec<(IpAddr, u8)>,
}

impl AllowList {
    pub fn parse(allow: &str) -> Self {
        let mut list = AllowList::default();
        for token in allow.split(|c: char| c == ',' || c == ';' || c.is_whitespace()) {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            if let Ok(ip) = token.parse::<IpAddr>() {
                list.ips.push(ip);
                continue;
            }
            if let Some((net, len)) = token.split_once('/') {
                if let (Ok(net), Ok(len)) = (net.parse::<IpAddr>(), len.parse::<u8>()) {
                    list.cidrs.push((net, len));
                    continue;
                }
            }
            debug!(entry = %token, "ignoring unparseable allowlist entry");
        }
        list
    }

    pub fn permits(&self, addr: IpAddr) -> bool {
        let addr = canonical(addr);
        for ip in &self.ips {
            if *ip == addr || (ip.is_loopback() && addr.is_loopback()) {
                return true;
            }
        }
        self.cidrs.iter().any(|(net, len)| cidr_contains(*net, *len, addr))
    }
}

/// V4-mapped V6 addresses compare as their V4 form.
fn canonical(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

fn cidr_contains(network: IpAddr, prefix_len: u8, addr: IpAddr) -> bool {
    match (canonical(network), addr) {
        (IpAddr::V4(net), IpAddr::V4(ip)) => {
            if prefix_len == 0 {
                return true;
            }
            if prefix_len > 32 {
                return false;
            }
            let mask = u32::MAX << (32 - u32::from(prefix_len));
            (u32::from(net) & mask) == (u32::from(ip) & mask)
        }
        (IpAddr::V6(net), IpAddr::V6(ip)) => {
            if prefix_len == 0 {
                return true;
            }
            if prefix_len > 128 {
                return false;
            }
            let mask = u128::MAX << (128 - u32::from(prefix_len));
            (u128::from(net) & mask) == (u128::from(ip) & mask)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn parses_mixed_separators() {
        let list = AllowList::parse("127.0.0.1, 10.0.0.0/8; 192.168.1.5 2001:db8::/32");
        assert!(list.permits(ip("127.0.0.1")));
        assert!(list.permits(ip("10.42.0.7")));
        assert!(list.permits(ip("192.168.1.5")));
        assert!(list.permits(ip("2001:db8::1")));
        assert!(!list.permits(ip("192.168.1.6")));
        assert!(!list.permits(ip("11.0.0.1")));
    }

    #[test]
    fn loopback_entries_match_any_loopback() {
        let list = AllowList::parse("127.0.0.1");
        assert!(list.permits(ip("127.0.0.53")));
        assert!(list.permits(ip("::1")));

        let list = AllowList::parse("::1");
        assert!(list.permits(ip("127.0.0.1")));
    }

    #[test]
    fn mapped_v4_addresses_are_canonicalized() {
        let list = AllowList::parse("10.0.0.0/8");
        assert!(list.permits(ip("::ffff:10.1.2.3")));
    }

    #[test]
    fn bad_entries_are_ignored() {
        let list = AllowList::parse("not-an-ip, 10.0.0.0/8");
        assert!(list.permits(ip("10.0.0.1")));
    }

    #[test]
    fn empty_list_denies_everything() {
        let list = AllowList::parse("");
        assert!(!list.permits(ip("127.0.0.1")));
    }
}
