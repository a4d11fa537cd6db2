use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

use super::url::UrlRewriter;

/// Response headers that leak origin infrastructure, pin security policy to
/// the origin, or describe an encoding the proxy has already undone.
const STRIPPED_RESPONSE_HEADERS: &[&str] = &[
    "content-encoding",
    "content-length",
    "transfer-encoding",
    "connection",
    "keep-alive",
    "referrer-policy",
    "content-security-policy-report-only",
    "x-frame-options",
    "cross-origin-opener-policy",
    "cross-origin-embedder-policy",
    "permissions-policy",
    "report-to",
    "nel",
    "alt-svc",
    "refresh",
    "sourcemap",
    "x-sourcemap",
    "x-dns-prefetch-control",
    "clear-site-data",
    "accept-ch",
];

/// Per-directive CSP relaxations. Tokens are appended only when missing, so
/// the relaxation is a fixed point.
const CSP_RELAXATIONS: &[(&str, &[&str])] = &[
    ("script-src", &["'unsafe-inline'", "'unsafe-eval'", "*", "data:", "blob:"]),
    ("style-src", &["'unsafe-inline'", "*", "data:"]),
    ("connect-src", &["*", "data:", "blob:", "wss:"]),
    ("img-src", &["*", "data:", "blob:"]),
];

static LINK_REL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)rel\s*=\s*"?([^";]*)"#).unwrap());
static LINK_URL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\s*)<([^>]*)>").unwrap());
static LINK_IMAGESRCSET_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)(imagesrcset\s*=\s*")([^"]*)(")"#).unwrap());

/// Context for one response's header pass.
pub struct HeaderContext<'a> {
    pub urls: &'a UrlRewriter,
    pub target: &'a Url,
    pub root_domain: &'a str,
}

/// Apply the full header rule set. For 204/304 and redirects the content
/// rules (`Link`, CSP, CORS) are skipped; cookie scoping and `Location`
/// always run.
pub fn apply(headers: &mut HeaderMap, status: StatusCode, ctx: &HeaderContext<'_>) {
    sanitize(headers);
    rewrite_set_cookie(headers, ctx.root_domain);
    rewrite_location(headers, ctx);

    if !is_shortcut_status(status) {
        rewrite_link(headers, ctx);
        relax_csp(headers);
        rewrite_cors(headers, ctx);
    }

    headers.insert(
        "x-robots-tag",
        HeaderValue::from_static("noindex, nofollow"),
    );
}

/// Statuses whose responses carry no transformable body: only the header
/// shortcut applies and the body is forwarded verbatim.
pub fn is_shortcut_status(status: StatusCode) -> bool {
    status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
        || status.is_redirection()
}

/// Delete fingerprint and policy headers.
pub fn sanitize(headers: &mut HeaderMap) {
    for name in STRIPPED_RESPONSE_HEADERS {
        headers.remove(*name);
    }
}

/// Re-scope every `Set-Cookie` to the proxy zone: the `name=value` pair is
/// preserved, prior `Domain`/`Secure`/`SameSite` attributes are dropped, and
/// `Domain={root}` (unless `__Host-` prefixed) plus `Secure; SameSite=Lax`
/// are appended.
pub fn rewrite_set_cookie(headers: &mut HeaderMap, root_domain: &str) {
    let cookies: Vec<String> = headers
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok().map(String::from))
        .collect();
    if cookies.is_empty() {
        return;
    }

    headers.remove(header::SET_COOKIE);
    for cookie in cookies {
        let rewritten = rescope_cookie(&cookie, root_domain);
        if let Ok(value) = HeaderValue::from_str(&rewritten) {
            headers.append(header::SET_COOKIE, value);
        }
    }
}

fn rescope_cookie(cookie: &str, root_domain: &str) -> String {
    let mut parts = cookie.split(';');
    let pair = parts.next().unwrap_or("").trim();
    let name = pair.split('=').next().unwrap_or("");

    let mut out = String::with_capacity(cookie.len() + root_domain.len() + 32);
    out.push_str(pair);

    for attr in parts {
        let trimmed = attr.trim();
        let lower = trimmed.to_ascii_lowercase();
        if lower.starts_with("domain")
            || lower == "secure"
            || lower.starts_with("samesite")
        {
            continue;
        }
        if !trimmed.is_empty() {
            out.push_str("; ");
            out.push_str(trimmed);
        }
    }

    if !name.starts_with("__Host-") {
        out.push_str("; Domain=");
        out.push_str(root_domain);
    }
    out.push_str("; Secure; SameSite=Lax");
    out
}

/// Rewrite `Location` against the target URL so redirects stay inside the
/// proxy zone.
pub fn rewrite_location(headers: &mut HeaderMap, ctx: &HeaderContext<'_>) {
    let Some(location) = headers
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
    else {
        return;
    };

    if let Some(proxied) = ctx.urls.proxify(&location, ctx.target) {
        if let Ok(value) = HeaderValue::from_str(&proxied) {
            headers.insert(header::LOCATION, value);
        }
    }
}

/// Rewrite the `Link` header: drop `preconnect`/`dns-prefetch` entries
/// (their origins are unreachable from the client anyway), proxify the
/// `<url>` form and any `imagesrcset` value.
pub fn rewrite_link(headers: &mut HeaderMap, ctx: &HeaderContext<'_>) {
    let values: Vec<String> = headers
        .get_all(header::LINK)
        .iter()
        .filter_map(|v| v.to_str().ok().map(String::from))
        .collect();
    if values.is_empty() {
        return;
    }

    headers.remove(header::LINK);
    for value in values {
        let entries: Vec<String> = value
            .split(',')
            .filter(|entry| !link_rel_is_dropped(entry))
            .map(|entry| rewrite_link_entry(entry, ctx))
            .collect();

        if entries.is_empty() {
            continue;
        }
        if let Ok(value) = HeaderValue::from_str(&entries.join(",")) {
            headers.append(header::LINK, value);
        }
    }
}

fn link_rel_is_dropped(entry: &str) -> bool {
    LINK_REL_RE
        .captures(entry)
        .map(|caps| {
            caps[1]
                .split_whitespace()
                .any(|token| token.eq_ignore_ascii_case("preconnect")
                    || token.eq_ignore_ascii_case("dns-prefetch"))
        })
        .unwrap_or(false)
}

fn rewrite_link_entry(entry: &str, ctx: &HeaderContext<'_>) -> String {
    let rewritten = LINK_URL_RE.replace(entry, |caps: &regex::Captures| {
        match ctx.urls.proxify(&caps[2], ctx.target) {
            Some(proxied) => format!("{}<{}>", &caps[1], proxied),
            None => caps[0].to_string(),
        }
    });

    LINK_IMAGESRCSET_RE
        .replace(&rewritten, |caps: &regex::Captures| {
            format!(
                "{}{}{}",
                &caps[1],
                super::html::rewrite_srcset(&caps[2], ctx.urls, ctx.target),
                &caps[3]
            )
        })
        .into_owned()
}

/// Relax `Content-Security-Policy` so rewritten and injected content still
/// executes: `upgrade-insecure-requests` is removed and the proxy tokens are
/// appended to (or added as) the fetch directives.
pub fn relax_csp(headers: &mut HeaderMap) {
    let values: Vec<String> = headers
        .get_all(header::CONTENT_SECURITY_POLICY)
        .iter()
        .filter_map(|v| v.to_str().ok().map(String::from))
        .collect();
    if values.is_empty() {
        return;
    }

    headers.remove(header::CONTENT_SECURITY_POLICY);
    for value in values {
        let relaxed = relax_csp_value(&value);
        if let Ok(value) = HeaderValue::from_str(&relaxed) {
            headers.append(header::CONTENT_SECURITY_POLICY, value);
        }
    }
}

fn relax_csp_value(value: &str) -> String {
    let mut directives: Vec<(String, Vec<String>)> = value
        .split(';')
        .filter_map(|directive| {
            let trimmed = directive.trim();
            if trimmed.is_empty() {
                return None;
            }
            let mut tokens = trimmed.split_whitespace().map(String::from);
            let name = tokens.next()?.to_ascii_lowercase();
            Some((name, tokens.collect()))
        })
        .filter(|(name, _)| name != "upgrade-insecure-requests")
        .collect();

    for (name, relax_tokens) in CSP_RELAXATIONS {
        match directives.iter_mut().find(|(n, _)| n == name) {
            Some((_, tokens)) => {
                for token in *relax_tokens {
                    if !tokens.iter().any(|t| t == token) {
                        tokens.push(token.to_string());
                    }
                }
            }
            None => {
                directives.push((
                    name.to_string(),
                    relax_tokens.iter().map(|t| t.to_string()).collect(),
                ));
            }
        }
    }

    directives
        .iter()
        .map(|(name, tokens)| {
            if tokens.is_empty() {
                name.clone()
            } else {
                format!("{} {}", name, tokens.join(" "))
            }
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// When `Access-Control-Allow-Origin` names a concrete origin whose hostname
/// is a suffix of the target hostname, move that origin under the proxy zone
/// so credentialed CORS keeps working.
pub fn rewrite_cors(headers: &mut HeaderMap, ctx: &HeaderContext<'_>) {
    let Some(value) = headers
        .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
    else {
        return;
    };

    if value == "*" || value.eq_ignore_ascii_case("null") {
        return;
    }
    let Ok(origin) = Url::parse(&value) else {
        return;
    };
    let Some(origin_host) = origin.host_str() else {
        return;
    };
    let Some(target_host) = ctx.target.host_str() else {
        return;
    };

    let is_suffix = target_host == origin_host
        || target_host.ends_with(&format!(".{}", origin_host));
    if !is_suffix {
        return;
    }

    let rewritten = format!("https://{}.{}", origin_host, ctx.root_domain);
    if let Ok(value) = HeaderValue::from_str(&rewritten) {
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
    }
}
