use percent_encoding::percent_decode_str;
use url::Url;

use crate::error::{ProxyError, Result};

/// Outcome of resolving an incoming request hostname.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The request addressed the root domain itself.
    Landing,
    /// The request addressed a proxied upstream origin.
    Target(Url),
}

/// Decodes the upstream target from the request hostname and enforces the
/// domain lock: only hostnames equal to or ending in `.{root_domain}` are
/// served, everything else is rejected before any upstream traffic happens.
pub struct TargetResolver {
    root_domain: String,
    /// Precomputed `.{root_domain}` so the hot path never reallocates it.
    suffix: String,
}

impl TargetResolver {
    pub fn new(root_domain: &str) -> Self {
        Self {
            root_domain: root_domain.to_string(),
            suffix: format!(".{}", root_domain),
        }
    }

    pub fn root_domain(&self) -> &str {
        &self.root_domain
    }

    /// Resolve a normalized request hostname plus path-and-query into the
    /// upstream target URL.
    ///
    /// The stripped prefix is taken as the literal upstream hostname; no
    /// dash-to-dot transformation is applied.
    pub fn resolve(&self, host: &str, path_and_query: &str) -> Result<Resolution> {
        if host == self.root_domain {
            return Ok(Resolution::Landing);
        }

        let prefix = host
            .strip_suffix(self.suffix.as_str())
            .ok_or_else(|| ProxyError::NotProxyable(host.to_string()))?;

        if prefix.is_empty() {
            return Err(ProxyError::NotProxyable(host.to_string()));
        }

        let target = Url::parse(&format!("https://{}{}", prefix, path_and_query))
            .map_err(|_| ProxyError::InvalidTarget(host.to_string()))?;

        Ok(Resolution::Target(target))
    }

    /// Map a URL under the proxy domain back to its upstream origin form.
    /// Returns `None` when the URL does not point at the proxy.
    ///
    /// Used for identity headers (`Referer`, `Origin`): a proxy URL is
    /// unconditionally rewritten to the decoded origin URL.
    pub fn resolve_url(&self, url: &Url) -> Option<Url> {
        let host = url.host_str()?;
        let prefix = host.strip_suffix(self.suffix.as_str())?;
        if prefix.is_empty() {
            return None;
        }

        let mut origin = format!("https://{}{}", prefix, url.path());
        if let Some(query) = url.query() {
            origin.push('?');
            origin.push_str(query);
        }
        Url::parse(&origin).ok()
    }

    /// Parse a user-typed target from the root-domain query string
    /// (`?example.com` or `?https%3A%2F%2Fexample.com%2Fx`) and return the
    /// proxy URL to redirect to. `None` falls through to the landing page.
    pub fn root_redirect(&self, query: &str) -> Option<Url> {
        let decoded = percent_decode_str(query).decode_utf8().ok()?;
        let trimmed = decoded.trim();
        if trimmed.is_empty() {
            return None;
        }

        let with_scheme = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("https://{}", trimmed)
        };

        let target = Url::parse(&with_scheme).ok()?;
        if !matches!(target.scheme(), "http" | "https") {
            return None;
        }
        let host = target.host_str()?;
        if host.is_empty() || host == self.root_domain || host.ends_with(self.suffix.as_str()) {
            return None;
        }

        let mut proxied = format!("https://{}{}{}", host, self.suffix, target.path());
        if let Some(q) = target.query() {
            proxied.push('?');
            proxied.push_str(q);
        }
        Url::parse(&proxied).ok()
    }
}

/// Lowercase a host header value and strip any trailing port.
pub fn normalize_host(value: &str) -> String {
    let mut host = value.trim().to_ascii_lowercase();
    if let Some(idx) = host.rfind(':') {
        if host[idx + 1..].chars().all(|c| c.is_ascii_digit()) {
            host.truncate(idx);
        }
    }
    host
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> TargetResolver {
        TargetResolver::new("p.example")
    }

    #[test]
    fn root_domain_is_landing() {
        assert_eq!(
            resolver().resolve("p.example", "/").unwrap(),
            Resolution::Landing
        );
    }

    #[test]
    fn subdomain_resolves_to_upstream() {
        let resolution = resolver()
            .resolve("www.google.com.p.example", "/search?q=1")
            .unwrap();
        match resolution {
            Resolution::Target(url) => {
                assert_eq!(url.as_str(), "https://www.google.com/search?q=1");
            }
            other => panic!("unexpected resolution: {:?}", other),
        }
    }

    #[test]
    fn off_domain_host_is_rejected() {
        let err = resolver().resolve("evil.com", "/").unwrap_err();
        assert!(matches!(err, ProxyError::NotProxyable(_)));
    }

    #[test]
    fn empty_prefix_is_rejected() {
        // ".p.example" normalizes to an empty target host.
        let err = resolver().resolve(".p.example", "/").unwrap_err();
        assert!(matches!(err, ProxyError::NotProxyable(_)));
    }

    #[test]
    fn proxy_url_round_trips_to_origin() {
        let url = Url::parse("https://api.example.org.p.example/v1/items?page=2").unwrap();
        let origin = resolver().resolve_url(&url).unwrap();
        assert_eq!(origin.as_str(), "https://api.example.org/v1/items?page=2");
    }

    #[test]
    fn non_proxy_url_does_not_resolve() {
        let url = Url::parse("https://example.org/page").unwrap();
        assert!(resolver().resolve_url(&url).is_none());
    }

    #[test]
    fn root_redirect_accepts_bare_hostname() {
        let url = resolver().root_redirect("example.com/path").unwrap();
        assert_eq!(url.as_str(), "https://example.com.p.example/path");
    }

    #[test]
    fn root_redirect_accepts_full_url() {
        let url = resolver()
            .root_redirect("https%3A%2F%2Fexample.com%2Fx%3Fa%3D1")
            .unwrap();
        assert_eq!(url.as_str(), "https://example.com.p.example/x?a=1");
    }

    #[test]
    fn root_redirect_rejects_garbage() {
        assert!(resolver().root_redirect("").is_none());
        assert!(resolver().root_redirect("%zz").is_none());
        assert!(resolver().root_redirect("javascript:alert(1)").is_none());
    }

    #[test]
    fn normalize_host_strips_port_and_case() {
        assert_eq!(normalize_host("WWW.Example.COM:8443"), "www.example.com");
        assert_eq!(normalize_host("example.com"), "example.com");
    }
}
