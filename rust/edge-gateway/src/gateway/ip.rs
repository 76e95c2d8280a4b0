//! IP matching, classification and client-IP resolution.
//!
//! Ranges are written either as an exact address (`203.0.113.7`, `::1`) or in
//! IPv4 CIDR notation (`10.0.0.0/8`). Malformed inputs never match.

use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::{HeaderMap, request::Parts};

use crate::AppState;

/// Returns `true` when `ip` equals `range_or_exact` or falls inside it.
///
/// IPv4 CIDR ranges compare both addresses as 32-bit integers under the
/// prefix mask. Anything that fails to parse is reported as non-matching.
pub fn matches(ip: &str, range_or_exact: &str) -> bool {
    let ip = normalize_ip(ip);
    let rule = range_or_exact.trim();
    if rule.is_empty() || ip.is_empty() {
        return false;
    }

    let Some((network, prefix)) = rule.split_once('/') else {
        return exact_match(ip, rule);
    };

    let Ok(prefix_len) = prefix.trim().parse::<u32>() else {
        return false;
    };
    if prefix_len > 32 {
        return false;
    }
    let (Some(ip_num), Some(network_num)) = (ipv4_to_u32(ip), ipv4_to_u32(network.trim())) else {
        return false;
    };

    let mask = if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - prefix_len)
    };
    (ip_num & mask) == (network_num & mask)
}

/// Returns `true` when `ip` matches any of `ranges`.
pub fn matches_any<S: AsRef<str>>(ip: &str, ranges: &[S]) -> bool {
    ranges.iter().any(|range| matches(ip, range.as_ref()))
}

/// Returns `true` when a whitelist or range entry is well formed.
pub fn is_valid_rule(rule: &str) -> bool {
    let rule = rule.trim();
    match rule.split_once('/') {
        None => normalize_ip(rule).parse::<IpAddr>().is_ok(),
        Some((network, prefix)) => {
            ipv4_to_u32(network.trim()).is_some()
                && prefix.trim().parse::<u32>().is_ok_and(|p| p <= 32)
        }
    }
}

fn exact_match(ip: &str, rule: &str) -> bool {
    if ip == rule {
        return true;
    }
    // `::ffff:1.2.3.4` and `1.2.3.4` denote the same caller.
    match (ip.parse::<IpAddr>(), normalize_ip(rule).parse::<IpAddr>()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn ipv4_to_u32(ip: &str) -> Option<u32> {
    ip.parse::<Ipv4Addr>().ok().map(u32::from)
}

/// Strips the IPv4-mapped IPv6 prefix (`::ffff:`) and surrounding whitespace.
pub fn normalize_ip(ip: &str) -> &str {
    let ip = ip.trim();
    ip.strip_prefix("::ffff:").unwrap_or(ip)
}

/// How the gateway treats a caller based on its address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpClass {
    /// Listed in the admin whitelist.
    Whitelisted,
    /// A known CDN or reverse-proxy edge.
    Cdn,
    /// The hosting platform's internal network.
    Platform,
    /// Everything else.
    External,
}

impl IpClass {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Whitelisted => "whitelisted",
            Self::Cdn => "cdn",
            Self::Platform => "platform",
            Self::External => "external",
        }
    }
}

/// Classifies addresses against the configured range lists.
#[derive(Debug, Clone, Default)]
pub struct IpClassifier {
    whitelist: Vec<String>,
    cdn_ranges: Vec<String>,
    platform_ranges: Vec<String>,
    trust_proxy: bool,
}

impl IpClassifier {
    #[must_use]
    pub fn new(
        whitelist: Vec<String>,
        cdn_ranges: Vec<String>,
        platform_ranges: Vec<String>,
        trust_proxy: bool,
    ) -> Self {
        Self {
            whitelist,
            cdn_ranges,
            platform_ranges,
            trust_proxy,
        }
    }

    /// Classify an address. Whitelist wins over the infrastructure ranges.
    pub fn classify(&self, ip: &str) -> IpClass {
        if matches_any(ip, &self.whitelist) {
            IpClass::Whitelisted
        } else if matches_any(ip, &self.cdn_ranges) {
            IpClass::Cdn
        } else if matches_any(ip, &self.platform_ranges) {
            IpClass::Platform
        } else {
            IpClass::External
        }
    }

    pub fn is_whitelisted(&self, ip: &str) -> bool {
        matches_any(ip, &self.whitelist)
    }

    /// Returns `true` for CDN edges and platform hops, the only addresses
    /// allowed to speak for someone else.
    pub fn is_proxy_hop(&self, ip: &str) -> bool {
        matches_any(ip, &self.cdn_ranges) || matches_any(ip, &self.platform_ranges)
    }

    /// Resolve the real client address for a request.
    ///
    /// Forwarding headers are only honoured when the peer is unknown, is a
    /// CDN/platform hop, or proxy trust is enabled. `x-forwarded-for` is then
    /// walked from the right and the first hop outside the proxy ranges wins;
    /// everything left of it was written by the caller.
    pub fn client_ip(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
        let peer_ip = peer.map(|addr| normalize_ip(&addr.ip().to_string()).to_string());

        let trust_headers = match peer_ip.as_deref() {
            None => true,
            Some(ip) => self.trust_proxy || self.is_proxy_hop(ip),
        };

        if trust_headers && let Some(forwarded) = self.forwarded_ip(headers) {
            return forwarded;
        }

        peer_ip.unwrap_or_else(|| "unknown".to_string())
    }

    /// Rightmost non-proxy `x-forwarded-for` hop, falling back to the
    /// leftmost hop when every entry is a proxy, then to `x-real-ip`.
    fn forwarded_ip(&self, headers: &HeaderMap) -> Option<String> {
        let hops: Vec<&str> = headers
            .get_all("x-forwarded-for")
            .iter()
            .filter_map(|h| h.to_str().ok())
            .flat_map(|s| s.split(','))
            .map(normalize_ip)
            .filter(|hop| hop.parse::<IpAddr>().is_ok())
            .collect();

        if let Some(hop) = hops
            .iter()
            .rev()
            .find(|hop| !self.is_proxy_hop(hop))
            .or_else(|| hops.first())
        {
            return Some((*hop).to_string());
        }

        headers
            .get("x-real-ip")
            .and_then(|h| h.to_str().ok())
            .map(normalize_ip)
            .filter(|ip| ip.parse::<IpAddr>().is_ok())
            .map(str::to_string)
    }
}

/// Resolved client address for the current request.
///
/// The admission middleware stores it in request extensions; handlers that
/// run without admission resolve it again from the connection and headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIp(pub String);

impl FromRequestParts<AppState> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        if let Some(ip) = parts.extensions.get::<ClientIp>() {
            return Ok(ip.clone());
        }
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        Ok(ClientIp(state.ip_classifier.client_ip(&parts.headers, peer)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_exact_match() {
        assert!(matches("192.168.1.1", "192.168.1.1"));
        assert!(!matches("192.168.1.2", "192.168.1.1"));
        assert!(matches("::ffff:192.168.1.1", "192.168.1.1"));
        assert!(matches("::1", "::1"));
    }

    #[test]
    fn test_every_address_inside_slash_24_matches() {
        for last in 0..=255u8 {
            let ip = format!("203.0.113.{last}");
            assert!(matches(&ip, "203.0.113.0/24"), "{ip} should match");
        }
    }

    #[test]
    fn test_addresses_outside_slash_24_do_not_match() {
        for ip in ["203.0.112.255", "203.0.114.0", "10.0.0.1", "204.0.113.5"] {
            assert!(!matches(ip, "203.0.113.0/24"), "{ip} should not match");
        }
    }

    #[test]
    fn test_prefix_edges() {
        assert!(matches("8.8.8.8", "0.0.0.0/0"));
        assert!(matches("10.1.2.3", "10.1.2.3/32"));
        assert!(!matches("10.1.2.4", "10.1.2.3/32"));
        assert!(matches("172.31.255.255", "172.16.0.0/12"));
        assert!(!matches("172.32.0.0", "172.16.0.0/12"));
    }

    #[test]
    fn test_malformed_inputs_never_match() {
        for range in [
            "10.0.0.0/33",
            "10.0.0.0/abc",
            "not-an-ip/8",
            "10.0.0/8",
            "",
            "/",
            "10.0.0.0/",
            "300.1.1.1/8",
        ] {
            assert!(!matches("10.0.0.1", range), "{range:?} must not match");
        }
        assert!(!matches("garbage", "10.0.0.0/8"));
        assert!(!matches("", "10.0.0.0/8"));
        assert!(!matches("::1", "10.0.0.0/8"));
    }

    #[test]
    fn test_rule_validation() {
        assert!(is_valid_rule("127.0.0.1"));
        assert!(is_valid_rule("::1"));
        assert!(is_valid_rule("10.0.0.0/8"));
        assert!(!is_valid_rule("10.0.0.0/40"));
        assert!(!is_valid_rule("localhost"));
    }

    #[test]
    fn test_classifier_precedence() {
        let classifier = IpClassifier::new(
            vec!["10.0.0.5".into()],
            vec!["173.245.48.0/20".into()],
            vec!["10.0.0.0/8".into()],
            false,
        );
        assert_eq!(classifier.classify("10.0.0.5"), IpClass::Whitelisted);
        assert_eq!(classifier.classify("173.245.48.10"), IpClass::Cdn);
        assert_eq!(classifier.classify("10.2.3.4"), IpClass::Platform);
        assert_eq!(classifier.classify("8.8.8.8"), IpClass::External);
    }

    #[test]
    fn test_client_ip_uses_forwarded_header_from_cdn_peer() {
        let classifier =
            IpClassifier::new(vec![], vec!["173.245.48.0/20".into()], vec![], false);
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("1.2.3.4, 173.245.48.10"),
        );

        let cdn_peer: SocketAddr = "173.245.48.10:443".parse().unwrap();
        assert_eq!(classifier.client_ip(&headers, Some(cdn_peer)), "1.2.3.4");

        let direct_peer: SocketAddr = "8.8.8.8:5555".parse().unwrap();
        assert_eq!(classifier.client_ip(&headers, Some(direct_peer)), "8.8.8.8");
    }

    #[test]
    fn test_client_ip_ignores_headers_from_direct_peer_by_default() {
        let classifier = IpClassifier::new(
            vec!["127.0.0.1".into()],
            vec!["173.245.48.0/20".into()],
            vec!["10.0.0.0/8".into()],
            false,
        );
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("127.0.0.1"));
        headers.insert("x-real-ip", HeaderValue::from_static("127.0.0.1"));

        let peer: SocketAddr = "203.0.113.9:40000".parse().unwrap();
        assert_eq!(classifier.client_ip(&headers, Some(peer)), "203.0.113.9");
    }

    #[test]
    fn test_client_ip_takes_rightmost_hop_outside_proxy_ranges() {
        let classifier = IpClassifier::new(
            vec![],
            vec!["173.245.48.0/20".into()],
            vec!["10.0.0.0/8".into()],
            false,
        );
        let cdn_peer: SocketAddr = "173.245.48.10:443".parse().unwrap();

        // The caller prepended a forged hop; the CDN appended the real one.
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("127.0.0.1, 203.0.113.9, 10.1.2.3, 173.245.48.11"),
        );
        assert_eq!(classifier.client_ip(&headers, Some(cdn_peer)), "203.0.113.9");

        // Separate header lines are read in order.
        let mut headers = HeaderMap::new();
        headers.append("x-forwarded-for", HeaderValue::from_static("127.0.0.1"));
        headers.append("x-forwarded-for", HeaderValue::from_static("198.51.100.4"));
        assert_eq!(classifier.client_ip(&headers, Some(cdn_peer)), "198.51.100.4");

        // Only proxies in the chain: the origin is the leftmost entry.
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.7, 173.245.48.12"));
        assert_eq!(classifier.client_ip(&headers, Some(cdn_peer)), "10.0.0.7");

        // Junk entries are skipped.
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4, nonsense"));
        assert_eq!(classifier.client_ip(&headers, Some(cdn_peer)), "1.2.3.4");
    }

    #[test]
    fn test_trust_proxy_honours_headers_from_any_peer() {
        let classifier = IpClassifier::new(vec![], vec![], vec![], true);
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("198.51.100.8"));
        let peer: SocketAddr = "203.0.113.9:40000".parse().unwrap();
        assert_eq!(classifier.client_ip(&headers, Some(peer)), "198.51.100.8");
    }

    #[test]
    fn test_client_ip_falls_back_to_real_ip_header() {
        let classifier = IpClassifier::new(vec![], vec![], vec![], true);
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("::ffff:5.6.7.8"));
        assert_eq!(classifier.client_ip(&headers, None), "5.6.7.8");
        assert_eq!(classifier.client_ip(&HeaderMap::new(), None), "unknown");
    }
}
