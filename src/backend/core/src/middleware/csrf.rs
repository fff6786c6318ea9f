//! Origin-based CSRF protection.
//!
//! A state-changing request must declare where it comes from. `Origin` is
//! compared first; without it the origin part of `Referer` is used; with
//! neither the request is rejected. Trusted mode skips the check entirely and
//! is meant for local development only.

use axum::http::Method;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CsrfConfig {
    /// Development bypass. Never enable in production.
    pub trusted_mode: bool,

    /// Host to compare against instead of the request's `Host` header
    pub expected_host: Option<String>,

    /// Methods that get checked
    pub protected_methods: Vec<String>,
}

impl Default for CsrfConfig {
    fn default() -> Self {
        Self {
            trusted_mode: false,
            expected_host: None,
            protected_methods: ["POST", "PUT", "PATCH", "DELETE"].map(String::from).to_vec(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OriginValidator {
    trusted_mode: bool,
    expected_host: Option<String>,
    protected: Vec<Method>,
}

impl OriginValidator {
    pub fn new(config: &CsrfConfig) -> Self {
        let protected = config
            .protected_methods
            .iter()
            .filter_map(|m| Method::from_bytes(m.trim().to_ascii_uppercase().as_bytes()).ok())
            .collect();

        Self {
            trusted_mode: config.trusted_mode,
            expected_host: config.expected_host.clone(),
            protected,
        }
    }

    pub fn is_trusted_mode(&self) -> bool {
        self.trusted_mode
    }

    pub fn requires_check(&self, method: &Method) -> bool {
        self.protected.contains(method)
    }

    /// Host the request must come from: the configured override, else the `Host` header.
    pub fn expected_host<'a>(&'a self, host_header: Option<&'a str>) -> Option<&'a str> {
        self.expected_host.as_deref().or(host_header)
    }

    /// Check declared origin and referer against `host`.
    pub fn verify(&self, origin: Option<&str>, referer: Option<&str>, host: Option<&str>) -> bool {
        if self.trusted_mode {
            return true;
        }

        let Some(host) = self.expected_host(host).filter(|h| !h.is_empty()) else {
            return false;
        };

        match (origin, referer) {
            (Some(origin), _) => origin_matches(origin.trim(), host),
            (None, Some(referer)) => {
                referer_origin(referer).is_some_and(|origin| origin_matches(&origin, host))
            }
            (None, None) => false,
        }
    }
}

fn origin_matches(origin: &str, host: &str) -> bool {
    origin == format!("https://{host}") || origin == format!("http://{host}")
}

/// `scheme://host[:port]` of a referer URL. `None` for anything not http(s).
pub fn referer_origin(referer: &str) -> Option<String> {
    let referer = referer.trim();
    let (scheme, rest) = referer.split_once("://")?;
    let scheme = scheme.to_ascii_lowercase();
    if scheme != "http" && scheme != "https" {
        return None;
    }

    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    // Drop userinfo
    let authority = authority.rsplit('@').next().unwrap_or_default();
    if authority.is_empty() {
        return None;
    }

    Some(format!("{scheme}://{authority}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> OriginValidator {
        OriginValidator::new(&CsrfConfig::default())
    }

    #[test]
    fn test_matching_origin_allowed() {
        let v = validator();
        assert!(v.verify(Some("https://app.example.com"), None, Some("app.example.com")));
        assert!(v.verify(Some("http://app.example.com"), None, Some("app.example.com")));
    }

    #[test]
    fn test_foreign_origin_rejected() {
        let v = validator();
        assert!(!v.verify(Some("https://evil.example.com"), None, Some("app.example.com")));
        assert!(!v.verify(Some("https://app.example.com.evil.io"), None, Some("app.example.com")));
    }

    #[test]
    fn test_origin_takes_precedence_over_referer() {
        let v = validator();
        assert!(!v.verify(
            Some("https://evil.example.com"),
            Some("https://app.example.com/page"),
            Some("app.example.com")
        ));
    }

    #[test]
    fn test_referer_fallback() {
        let v = validator();
        assert!(v.verify(None, Some("https://app.example.com/page"), Some("app.example.com")));
        assert!(v.verify(None, Some("https://app.example.com?x=1"), Some("app.example.com")));
        assert!(!v.verify(None, Some("https://evil.example.com/page"), Some("app.example.com")));
        assert!(!v.verify(None, Some("not a url"), Some("app.example.com")));
    }

    #[test]
    fn test_neither_header_rejected() {
        assert!(!validator().verify(None, None, Some("app.example.com")));
    }

    #[test]
    fn test_trusted_mode_bypasses() {
        let v = OriginValidator::new(&CsrfConfig {
            trusted_mode: true,
            ..Default::default()
        });
        assert!(v.verify(None, None, None));
        assert!(v.verify(Some("https://evil.example.com"), None, Some("app.example.com")));
    }

    #[test]
    fn test_expected_host_override() {
        let v = OriginValidator::new(&CsrfConfig {
            expected_host: Some("menu.example.com".into()),
            ..Default::default()
        });
        assert!(v.verify(Some("https://menu.example.com"), None, Some("internal:8080")));
        assert!(!v.verify(Some("https://internal:8080"), None, Some("internal:8080")));
    }

    #[test]
    fn test_protected_methods() {
        let v = validator();
        assert!(v.requires_check(&Method::POST));
        assert!(v.requires_check(&Method::DELETE));
        assert!(!v.requires_check(&Method::GET));
        assert!(!v.requires_check(&Method::OPTIONS));
    }

    #[test]
    fn test_referer_origin_parsing() {
        assert_eq!(
            referer_origin("https://user:pw@app.example.com:8443/a/b").as_deref(),
            Some("https://app.example.com:8443")
        );
        assert_eq!(referer_origin("javascript://app.example.com/"), None);
        assert_eq!(referer_origin("https:///path"), None);
    }
}
