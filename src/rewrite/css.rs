use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use url::Url;

use super::url::UrlRewriter;

// Trailing source-map annotations point at origin infrastructure and are
// useless after rewriting; they are dropped entirely.
static SOURCE_MAP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*/\*#\s*sourceMappingURL=[^*]*\*/[^\S\n]*$").unwrap());

// `url(...)` with optional single/double quotes. The regex crate has no
// backreferences, so the quote variants are separate alternatives.
static URL_FN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)url\(\s*(?:"([^"]+)"|'([^']+)'|([^'")][^)\s]*))\s*\)"#).unwrap()
});

// `@import "…"` / `@import '…'`. The `@import url(…)` form is already
// covered by the general `url(...)` rule.
static IMPORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)@import\s+(?:"([^"]+)"|'([^']+)')"#).unwrap());

fn captured<'a>(caps: &'a Captures) -> (&'a str, &'static str) {
    if let Some(m) = caps.get(1) {
        (m.as_str(), "\"")
    } else if let Some(m) = caps.get(2) {
        (m.as_str(), "'")
    } else {
        (caps.get(3).map(|m| m.as_str()).unwrap_or(""), "")
    }
}

/// Rewrite every URL-bearing construct in a stylesheet: `url(...)`,
/// `@import "..."` and `image-set(url(...) ...)` (the latter through the
/// general `url(...)` rule). `data:` targets are skipped; already-proxied
/// URLs are left alone, which makes the whole pass idempotent.
pub fn rewrite_css(css: &str, urls: &UrlRewriter, base: &Url) -> String {
    let stripped = SOURCE_MAP_RE.replace_all(css, "");

    let imports = IMPORT_RE.replace_all(&stripped, |caps: &Captures| {
        let (target, quote) = captured(caps);
        match urls.proxify(target, base) {
            Some(proxied) => format!("@import {q}{url}{q}", q = quote, url = proxied),
            None => caps[0].to_string(),
        }
    });

    URL_FN_RE
        .replace_all(&imports, |caps: &Captures| {
            let (target, quote) = captured(caps);
            match urls.proxify(target, base) {
                Some(proxied) => format!("url({q}{url}{q})", q = quote, url = proxied),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urls() -> UrlRewriter {
        UrlRewriter::new("p.example")
    }

    fn base() -> Url {
        Url::parse("https://foo.com/style.css").unwrap()
    }

    #[test]
    fn rewrites_url_functions_and_imports() {
        let css = r#"a{background:url("https://cdn.foo.com/a.png")} @import "https://foo.com/b.css";"#;
        let out = rewrite_css(css, &urls(), &base());
        assert_eq!(
            out,
            r#"a{background:url("https://cdn.foo.com.p.example/a.png")} @import "https://foo.com.p.example/b.css";"#
        );
    }

    #[test]
    fn rewrites_unquoted_and_relative_urls() {
        let css = "div{background-image:url(/img/bg.jpg)}";
        let out = rewrite_css(css, &urls(), &base());
        assert_eq!(
            out,
            "div{background-image:url(https://foo.com.p.example/img/bg.jpg)}"
        );
    }

    #[test]
    fn rewrites_image_set_entries() {
        let css = "div{background:image-set(url('https://cdn.foo.com/1x.png') 1x, url('https://cdn.foo.com/2x.png') 2x)}";
        let out = rewrite_css(css, &urls(), &base());
        assert!(out.contains("url('https://cdn.foo.com.p.example/1x.png') 1x"));
        assert!(out.contains("url('https://cdn.foo.com.p.example/2x.png') 2x"));
    }

    #[test]
    fn skips_data_urls() {
        let css = "span{background:url(data:image/gif;base64,R0lGOD)}";
        assert_eq!(rewrite_css(css, &urls(), &base()), css);
    }

    #[test]
    fn strips_source_map_comments() {
        let css = "a{color:red}\n/*# sourceMappingURL=style.css.map */\n";
        let out = rewrite_css(css, &urls(), &base());
        assert!(!out.contains("sourceMappingURL"));
        assert!(out.contains("a{color:red}"));
    }

    #[test]
    fn rewrite_is_idempotent() {
        let css = r#"a{background:url("https://cdn.foo.com/a.png")}"#;
        let once = rewrite_css(css, &urls(), &base());
        let twice = rewrite_css(&once, &urls(), &base());
        assert_eq!(once, twice);
    }
}
