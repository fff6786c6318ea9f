//! Caller identity for rate limiting.
//!
//! The key is `{policy_prefix}:{client_address}:{ua_fragment}`. The address is
//! the first `X-Forwarded-For` entry, then `X-Real-IP`, then the peer socket
//! address, then `unknown`. The user-agent is cut to a fixed number of
//! characters so adversarial headers cannot blow up key size or cardinality.

use axum::http::HeaderMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

pub const UNKNOWN: &str = "unknown";

/// Default user-agent fragment length in characters.
pub const DEFAULT_UA_FRAGMENT_LEN: usize = 50;

/// Derived caller identity, before policy scoping.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey {
    address: String,
    agent: String,
}

impl ClientKey {
    /// Derive the identity from request headers and the peer address, if known.
    pub fn derive(headers: &HeaderMap, peer: Option<SocketAddr>, ua_len: usize) -> Self {
        let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

        Self::from_parts(
            header("x-forwarded-for"),
            header("x-real-ip"),
            peer.map(|addr| addr.ip()),
            header("user-agent"),
            ua_len,
        )
    }

    /// Pure derivation from already extracted header values.
    pub fn from_parts(
        forwarded_for: Option<&str>,
        real_ip: Option<&str>,
        peer: Option<IpAddr>,
        user_agent: Option<&str>,
        ua_len: usize,
    ) -> Self {
        let forwarded = forwarded_for
            .and_then(|list| list.split(',').next())
            .and_then(parse_ip);
        let real = real_ip.and_then(parse_ip);

        let address = forwarded
            .or(real)
            .or(peer)
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| UNKNOWN.to_string());

        let agent = match user_agent.map(str::trim).filter(|ua| !ua.is_empty()) {
            Some(ua) => ua.chars().take(ua_len).collect(),
            None => UNKNOWN.to_string(),
        };

        Self { address, agent }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub fn is_unknown(&self) -> bool {
        self.address == UNKNOWN
    }

    /// Key namespaced by a policy prefix.
    pub fn scoped(&self, prefix: &str) -> String {
        format!("{}:{}:{}", prefix, self.address, self.agent)
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.agent)
    }
}

fn parse_ip(raw: &str) -> Option<IpAddr> {
    raw.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_first_forwarded_address_wins() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7, 10.0.0.1"));
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.2"));
        headers.insert("user-agent", HeaderValue::from_static("curl/8.0"));

        let key = ClientKey::derive(&headers, None, 50);
        assert_eq!(key.scoped("auth"), "auth:203.0.113.7:curl/8.0");
    }

    #[test]
    fn test_fallback_order() {
        let peer: IpAddr = "192.0.2.1".parse().unwrap();

        let real = ClientKey::from_parts(None, Some("198.51.100.2"), Some(peer), None, 50);
        assert_eq!(real.address(), "198.51.100.2");

        let from_peer = ClientKey::from_parts(None, None, Some(peer), None, 50);
        assert_eq!(from_peer.address(), "192.0.2.1");

        let unknown = ClientKey::from_parts(None, None, None, None, 50);
        assert!(unknown.is_unknown());
        assert_eq!(unknown.scoped("api"), "api:unknown:unknown");
    }

    #[test]
    fn test_garbage_forwarded_header_falls_through() {
        let key = ClientKey::from_parts(Some("not-an-ip"), Some("198.51.100.2"), None, None, 50);
        assert_eq!(key.address(), "198.51.100.2");
    }

    #[test]
    fn test_user_agent_truncated_on_char_boundary() {
        let ua = "é".repeat(80);
        let key = ClientKey::from_parts(None, None, None, Some(&ua), 50);
        assert_eq!(key.agent().chars().count(), 50);
    }

    #[test]
    fn test_deterministic() {
        let a = ClientKey::from_parts(Some("203.0.113.7"), None, None, Some("Mozilla/5.0"), 50);
        let b = ClientKey::from_parts(Some("203.0.113.7"), None, None, Some("Mozilla/5.0"), 50);
        assert_eq!(a.scoped("menu"), b.scoped("menu"));
        assert_ne!(a.scoped("menu"), a.scoped("auth"));
    }
}
