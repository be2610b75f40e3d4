//! HTTP helpers for CORS, client-IP resolution, and request accounting.

use axum::body::Body as AxumBody;
use axum::extract::{Extension, connect_info::ConnectInfo};
use axum::http::{HeaderMap, Method, Request, header};
use axum::{middleware, response::Response};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::bridge::client_from_header_value;
use crate::stats::Stats;

/// Whether proxy-protocol-v2 enforcement is active for this process.
#[derive(Clone, Copy, Debug)]
pub struct ProxyMode(pub bool);

/// Permissive CORS policy shared by every route.
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::HEAD, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::RANGE,
            header::AUTHORIZATION,
        ])
        .expose_headers([
            header::CONTENT_RANGE,
            header::CONTENT_LENGTH,
            header::ACCEPT_RANGES,
        ])
}

fn forwarded_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn real_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn proxy_header_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-proxy-protocol-v2")
        .and_then(|value| value.to_str().ok())
        .and_then(client_from_header_value)
}

/// Best-effort client address for rate limiting and statistics.
///
/// With proxy enforcement on, the injected v2 header wins, then the
/// forwarding headers the bridge writes. Without it, the TCP peer is
/// authoritative.
pub fn client_ip(headers: &HeaderMap, peer: Option<IpAddr>, proxy_enabled: bool) -> String {
    if proxy_enabled {
        if let Some(ip) = proxy_header_ip(headers) {
            return ip.to_string();
        }
        if let Some(ip) = forwarded_ip(headers) {
            return ip;
        }
        if let Some(ip) = real_ip(headers) {
            return ip;
        }
        return peer
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "unknown".to_string());
    }
    if let Some(ip) = peer {
        return ip.to_string();
    }
    forwarded_ip(headers)
        .or_else(|| real_ip(headers))
        .unwrap_or_else(|| "unknown".to_string())
}

/// 请求统计中间件：维护活跃请求与活跃客户端。
pub async fn track_requests(
    Extension(stats): Extension<Arc<Stats>>,
    Extension(proxy): Extension<ProxyMode>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<AxumBody>,
    next: middleware::Next,
) -> Response {
    let ip = client_ip(request.headers(), Some(addr.ip()), proxy.0);
    stats.touch_client(&ip).await;
    let _guard = stats.request_guard();
    next.run(request).await
}
