//! Client IP resolution.
//!
//! Exactly one [`ClientIpSource`] is active per deployment. When the active source disagrees
//! with what the other sources would report, a warning is logged; the request is never blocked
//! on it.

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Request},
    http::HeaderMap,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const FORWARDED_FOR: &str = "x-forwarded-for";
pub const CF_CONNECTING_IP: &str = "cf-connecting-ip";

/// Fallback when no address can be determined, so such clients still share one IP bucket.
pub const UNKNOWN_IP: &str = "unknown";

/// Where the client address comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientIpSource {
    /// The TCP peer address.
    #[default]
    Direct,
    /// First entry of `X-Forwarded-For`, as set by a generic reverse proxy.
    AnyProxy,
    /// `CF-Connecting-IP`, as set by Cloudflare.
    Cloudflare,
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim).filter(|v| !v.is_empty())
}

fn forwarded_for(headers: &HeaderMap) -> Option<&str> {
    header_value(headers, FORWARDED_FOR)
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Resolve the client IP under `source`.
pub fn resolve_client_ip(source: ClientIpSource, headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let direct = peer.map(|addr| addr.ip().to_string());
    let proxied = forwarded_for(headers);
    let cloudflare = header_value(headers, CF_CONNECTING_IP);

    let resolved = match source {
        ClientIpSource::Direct => {
            if proxied.is_some() || cloudflare.is_some() {
                warn!(
                    forwarded_for = proxied,
                    cf_connecting_ip = cloudflare,
                    "Proxy headers present but client IP source is direct"
                );
            }
            direct
        }
        ClientIpSource::AnyProxy => {
            if proxied.is_none() {
                warn!("Client IP source is any_proxy but X-Forwarded-For is missing");
            } else if cloudflare.is_some_and(|cf| Some(cf) != proxied) {
                warn!(
                    forwarded_for = proxied,
                    cf_connecting_ip = cloudflare,
                    "X-Forwarded-For disagrees with CF-Connecting-IP"
                );
            }
            proxied.map(str::to_string)
        }
        ClientIpSource::Cloudflare => {
            if cloudflare.is_none() {
                warn!("Client IP source is cloudflare but CF-Connecting-IP is missing");
            }
            cloudflare.map(str::to_string)
        }
    };

    resolved.unwrap_or_else(|| UNKNOWN_IP.to_string())
}

/// Resolve the client IP of a request, using the peer address recorded by
/// `into_make_service_with_connect_info` when present.
pub fn request_client_ip(source: ClientIpSource, request: &Request) -> String {
    let peer = request.extensions().get::<ConnectInfo<SocketAddr>>().map(|info| info.0);
    resolve_client_ip(source, request.headers(), peer)
}
