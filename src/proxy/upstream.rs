use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Method};
use tracing::debug;
use url::Url;

use crate::config::CookieConfig;
use crate::error::{ProxyError, Result};
use crate::resolver::TargetResolver;

/// Request headers that must never reach the upstream: proxy hops, edge
/// fingerprints, and anything naming the real client.
fn is_leak_header(name: &str) -> bool {
    name == "x-real-ip"
        || name == "via"
        || name.starts_with("x-forwarded-")
        || name.starts_with("cf-")
        || name.starts_with("x-cf-")
}

/// Hop-by-hop and negotiation headers the client owns but the upstream leg
/// re-establishes itself. `Accept-Encoding` is re-negotiated by the HTTP
/// client so rewriters always see plaintext bodies.
fn is_hop_header(name: &str) -> bool {
    matches!(
        name,
        "host"
            | "connection"
            | "keep-alive"
            | "upgrade"
            | "te"
            | "trailer"
            | "trailers"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "transfer-encoding"
            | "content-length"
            | "accept-encoding"
    )
}

/// Build the outbound header set for an upstream request: a fresh map with
/// the leak headers stripped, `Host` pinned to the target, identity headers
/// rewritten back to origin URLs, and passthrough cookies filtered out.
pub fn rewrite_request_headers(
    original: &HeaderMap,
    target: &Url,
    resolver: &TargetResolver,
    cookies: &CookieConfig,
) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(original.len() + 1);

    for (name, value) in original.iter() {
        let name_str = name.as_str();
        if is_hop_header(name_str) || is_leak_header(name_str) {
            continue;
        }
        match name_str {
            "referer" | "origin" => {
                if let Some(rewritten) = rewrite_identity(name_str, value, resolver) {
                    if let Ok(value) = HeaderValue::from_str(&rewritten) {
                        out.insert(name.clone(), value);
                    }
                }
                // Unparseable identity values are dropped entirely.
            }
            "cookie" => {
                if let Some(filtered) = value
                    .to_str()
                    .ok()
                    .and_then(|v| filter_cookies(v, cookies))
                {
                    if let Ok(value) = HeaderValue::from_str(&filtered) {
                        out.insert(name.clone(), value);
                    }
                }
            }
            _ => {
                out.append(name.clone(), value.clone());
            }
        }
    }

    if let Some(host) = target.host_str() {
        if let Ok(value) = HeaderValue::from_str(host) {
            out.insert(header::HOST, value);
        }
    }

    out
}

/// `Referer`/`Origin` values pointing at the proxy zone are unconditionally
/// rewritten to the decoded origin URL. Values already pointing elsewhere
/// pass through.
fn rewrite_identity(name: &str, value: &HeaderValue, resolver: &TargetResolver) -> Option<String> {
    let raw = value.to_str().ok()?;
    let url = Url::parse(raw).ok()?;

    let Some(origin) = resolver.resolve_url(&url) else {
        return Some(raw.to_string());
    };

    if name == "origin" {
        let host = origin.host_str()?;
        Some(format!("https://{}", host))
    } else {
        Some(origin.to_string())
    }
}

/// Drop passthrough cookies and re-serialize. A header that filters to
/// empty is deleted, not emitted empty.
pub(crate) fn filter_cookies(value: &str, cookies: &CookieConfig) -> Option<String> {
    let kept: Vec<&str> = value
        .split(';')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .filter(|pair| {
            let name = pair.split('=').next().unwrap_or("").trim();
            !cookies.is_passthrough(name)
        })
        .collect();

    if kept.is_empty() {
        None
    } else {
        Some(kept.join("; "))
    }
}

/// The upstream HTTP client. Redirects are never followed; the proxy
/// rewrites `Location` itself. Compressed bodies are transparently decoded
/// so the content handlers always operate on plaintext.
pub struct UpstreamClient {
    http: reqwest::Client,
}

impl UpstreamClient {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(20)
            .build()
            .map_err(|e| ProxyError::Internal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { http })
    }

    /// Forward the request body unchanged (streaming included) to the
    /// resolved target.
    pub async fn fetch(
        &self,
        method: Method,
        target: &Url,
        headers: HeaderMap,
        body: Body,
    ) -> Result<reqwest::Response> {
        debug!("forwarding {} {}", method, target);

        let has_body = !matches!(method, Method::GET | Method::HEAD);
        let mut request = self.http.request(method, target.clone()).headers(headers);
        if has_body {
            request = request.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }

        request
            .send()
            .await
            .map_err(|e| ProxyError::Upstream(format!("{}: {}", target, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn resolver() -> TargetResolver {
        TargetResolver::new("p.example")
    }

    fn cookie_config(patterns: &str) -> CookieConfig {
        Config::from_vars(
            [
                ("ROOT_DOMAIN".to_string(), "p.example".to_string()),
                ("COOKIE_PROXY_PASSTHROUGH".to_string(), patterns.to_string()),
            ]
            .into_iter(),
        )
        .unwrap()
        .cookies
    }

    fn target() -> Url {
        Url::parse("https://www.google.com/search").unwrap()
    }

    #[test]
    fn leak_headers_are_stripped() {
        let mut original = HeaderMap::new();
        for (name, value) in [
            ("x-forwarded-for", "1.2.3.4"),
            ("x-forwarded-proto", "https"),
            ("x-real-ip", "1.2.3.4"),
            ("via", "1.1 edge"),
            ("cf-connecting-ip", "1.2.3.4"),
            ("cf-ray", "abc-IAD"),
            ("cf-access-client-id", "id"),
            ("x-cf-trace", "t"),
            ("accept", "text/html"),
        ] {
            original.insert(name, HeaderValue::from_static(value));
        }

        let out = rewrite_request_headers(&original, &target(), &resolver(), &cookie_config("[]"));

        for name in [
            "x-forwarded-for",
            "x-forwarded-proto",
            "x-real-ip",
            "via",
            "cf-connecting-ip",
            "cf-ray",
            "cf-access-client-id",
            "x-cf-trace",
        ] {
            assert!(out.get(name).is_none(), "{} leaked through", name);
        }
        assert_eq!(out.get("accept").unwrap(), "text/html");
        assert_eq!(out.get(header::HOST).unwrap(), "www.google.com");
    }

    #[test]
    fn referer_pointing_at_proxy_is_rewritten_to_origin() {
        let mut original = HeaderMap::new();
        original.insert(
            header::REFERER,
            HeaderValue::from_static("https://www.google.com.p.example/prev?q=1"),
        );
        let out = rewrite_request_headers(&original, &target(), &resolver(), &cookie_config("[]"));
        assert_eq!(
            out.get(header::REFERER).unwrap(),
            "https://www.google.com/prev?q=1"
        );
    }

    #[test]
    fn origin_is_rewritten_to_bare_origin() {
        let mut original = HeaderMap::new();
        original.insert(
            header::ORIGIN,
            HeaderValue::from_static("https://api.x.com.p.example"),
        );
        let out = rewrite_request_headers(&original, &target(), &resolver(), &cookie_config("[]"));
        assert_eq!(out.get(header::ORIGIN).unwrap(), "https://api.x.com");
    }

    #[test]
    fn unparseable_referer_is_deleted() {
        let mut original = HeaderMap::new();
        original.insert(header::REFERER, HeaderValue::from_static("not a url"));
        let out = rewrite_request_headers(&original, &target(), &resolver(), &cookie_config("[]"));
        assert!(out.get(header::REFERER).is_none());
    }

    #[test]
    fn external_referer_passes_through() {
        let mut original = HeaderMap::new();
        original.insert(
            header::REFERER,
            HeaderValue::from_static("https://unrelated.example.org/page"),
        );
        let out = rewrite_request_headers(&original, &target(), &resolver(), &cookie_config("[]"));
        assert_eq!(
            out.get(header::REFERER).unwrap(),
            "https://unrelated.example.org/page"
        );
    }

    #[test]
    fn passthrough_cookies_are_filtered() {
        let mut original = HeaderMap::new();
        original.insert(
            header::COOKIE,
            HeaderValue::from_static("sid=1; __proxy_auth=x; theme=dark"),
        );
        let out = rewrite_request_headers(
            &original,
            &target(),
            &resolver(),
            &cookie_config(r#"["__proxy_*"]"#),
        );
        assert_eq!(out.get(header::COOKIE).unwrap(), "sid=1; theme=dark");
    }

    #[test]
    fn cookie_header_filtered_to_empty_is_deleted() {
        let mut original = HeaderMap::new();
        original.insert(
            header::COOKIE,
            HeaderValue::from_static("__proxy_auth=x"),
        );
        let out = rewrite_request_headers(
            &original,
            &target(),
            &resolver(),
            &cookie_config(r#"["__proxy_*"]"#),
        );
        assert!(out.get(header::COOKIE).is_none());
    }
}
