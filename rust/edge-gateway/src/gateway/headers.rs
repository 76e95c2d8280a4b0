//! Header rewriting between the client and the private upstream.

use axum::http::{HeaderMap, HeaderName, HeaderValue, header};

/// Marker telling the upstream the request came through the gateway.
pub const GATEWAY_SERVICE: &str = "edge-gateway";

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Remove hop-by-hop headers, including any named in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Forwarding metadata for one upstream request.
#[derive(Debug, Clone)]
pub struct ForwardingContext<'a> {
    pub client_ip: &'a str,
    pub request_id: &'a str,
    pub original_host: Option<&'a str>,
    /// Service key the upstream expects from the gateway.
    pub api_key: Option<&'a str>,
}

/// Rewrite inbound headers for the upstream hop.
pub fn decorate_upstream_headers(headers: &mut HeaderMap, ctx: &ForwardingContext<'_>) {
    strip_hop_by_hop(headers);
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);

    let forwarded_for = match headers
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        Some(chain) if chain.split(',').any(|hop| hop.trim() == ctx.client_ip) => chain.to_string(),
        Some(chain) => format!("{chain}, {}", ctx.client_ip),
        None => ctx.client_ip.to_string(),
    };

    set(headers, "x-forwarded-for", &forwarded_for);
    set(headers, "x-real-ip", ctx.client_ip);
    set(headers, "x-gateway-service", GATEWAY_SERVICE);
    set(headers, "x-gateway-request", ctx.request_id);
    if let Some(host) = ctx.original_host {
        set(headers, "x-original-host", host);
        set(headers, "x-forwarded-host", host);
    }
    if let Some(key) = ctx.api_key {
        set(headers, "x-api-key", key);
    }
}

/// Clean upstream response headers before relaying them.
pub fn sanitize_response_headers(headers: &mut HeaderMap) {
    strip_hop_by_hop(headers);
    headers.remove(header::CONTENT_LENGTH);
}

fn set(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}
