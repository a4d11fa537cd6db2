use url::Url;

/// The shared proxification primitive: maps any absolute URL onto the proxy
/// domain, `https://{host}.{root_domain}{path}{query}`.
///
/// Constructed once per process; the `.{root_domain}` suffix and scheme
/// prefixes are precomputed because the hot path runs this millions of times.
pub struct UrlRewriter {
    root_domain: String,
    suffix: String,
}

/// Schemes whose URLs are never rewritten.
const OPAQUE_PREFIXES: &[&str] = &["data:", "blob:", "javascript:", "chrome-extension:"];

impl UrlRewriter {
    pub fn new(root_domain: &str) -> Self {
        Self {
            root_domain: root_domain.to_string(),
            suffix: format!(".{}", root_domain),
        }
    }

    pub fn root_domain(&self) -> &str {
        &self.root_domain
    }

    /// True when a hostname is already under the proxy zone.
    pub fn is_proxied(&self, host: &str) -> bool {
        host == self.root_domain || host.ends_with(self.suffix.as_str())
    }

    /// Rewrite a raw URL reference, resolving it against `base` first.
    /// Returns `None` when the value must be left untouched: opaque schemes,
    /// fragment-only references, unparseable input, and URLs that already
    /// point at the proxy (proxification is idempotent).
    pub fn proxify(&self, raw: &str, base: &Url) -> Option<String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return None;
        }
        let head = trimmed.as_bytes();
        if OPAQUE_PREFIXES
            .iter()
            .any(|p| head.len() >= p.len() && head[..p.len()].eq_ignore_ascii_case(p.as_bytes()))
        {
            return None;
        }

        let resolved = base.join(trimmed).ok()?;
        self.proxify_url(&resolved)
            .map(|proxied| proxied.to_string())
    }

    /// Rewrite an already-parsed absolute URL. WebSocket schemes map to
    /// `wss`; everything else maps to `https`.
    pub fn proxify_url(&self, url: &Url) -> Option<Url> {
        let scheme = match url.scheme() {
            "http" | "https" => "https",
            "ws" | "wss" => "wss",
            _ => return None,
        };

        let host = url.host_str()?;
        if host.is_empty() || self.is_proxied(host) {
            return None;
        }

        let mut out = String::with_capacity(
            scheme.len() + 3 + host.len() + self.suffix.len() + url.path().len() + 16,
        );
        out.push_str(scheme);
        out.push_str("://");
        out.push_str(host);
        out.push_str(&self.suffix);
        out.push_str(url.path());
        if let Some(query) = url.query() {
            out.push('?');
            out.push_str(query);
        }
        if let Some(fragment) = url.fragment() {
            out.push('#');
            out.push_str(fragment);
        }

        Url::parse(&out).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rewriter() -> UrlRewriter {
        UrlRewriter::new("p.example")
    }

    fn base() -> Url {
        Url::parse("https://www.google.com/dir/page.html").unwrap()
    }

    #[test]
    fn absolute_url_maps_to_proxy_domain() {
        assert_eq!(
            rewriter().proxify("https://www.google.com/x", &base()),
            Some("https://www.google.com.p.example/x".to_string())
        );
    }

    #[test]
    fn relative_url_resolves_against_base() {
        assert_eq!(
            rewriter().proxify("/y", &base()),
            Some("https://www.google.com.p.example/y".to_string())
        );
        assert_eq!(
            rewriter().proxify("other.html", &base()),
            Some("https://www.google.com.p.example/dir/other.html".to_string())
        );
    }

    #[test]
    fn query_and_fragment_survive() {
        assert_eq!(
            rewriter().proxify("https://cdn.foo.com/a?b=1#frag", &base()),
            Some("https://cdn.foo.com.p.example/a?b=1#frag".to_string())
        );
    }

    #[test]
    fn proxification_is_idempotent() {
        let rewriter = rewriter();
        let once = rewriter
            .proxify("https://www.google.com/x", &base())
            .unwrap();
        assert_eq!(rewriter.proxify(&once, &base()), None);
    }

    #[test]
    fn opaque_schemes_and_fragments_pass_through() {
        let rewriter = rewriter();
        for raw in [
            "",
            "#section",
            "data:image/png;base64,AAAA",
            "blob:https://example.com/uuid",
            "javascript:void(0)",
            "chrome-extension://abcdef/page.html",
            "mailto:user@example.com",
        ] {
            assert_eq!(rewriter.proxify(raw, &base()), None, "raw = {:?}", raw);
        }
    }

    #[test]
    fn websocket_schemes_map_to_wss() {
        assert_eq!(
            rewriter().proxify("wss://chat.example.org/socket", &base()),
            Some("wss://chat.example.org.p.example/socket".to_string())
        );
        assert_eq!(
            rewriter().proxify("ws://chat.example.org/socket", &base()),
            Some("wss://chat.example.org.p.example/socket".to_string())
        );
    }

    #[test]
    fn http_scheme_upgrades_to_https() {
        assert_eq!(
            rewriter().proxify("http://example.org/a", &base()),
            Some("https://example.org.p.example/a".to_string())
        );
    }

    #[test]
    fn root_domain_itself_is_not_rewritten() {
        assert_eq!(rewriter().proxify("https://p.example/landing", &base()), None);
    }
}
