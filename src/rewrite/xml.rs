use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use url::Url;

use super::url::UrlRewriter;

// Deliberately conservative, narrowly targeted patterns for the URL-bearing
// constructs of RSS/Atom/sitemap documents. A fragment that fails to match
// is preserved untouched.

static STYLESHEET_PI_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(<\?xml-stylesheet\b[^>]*?href=)(?:"([^"]+)"|'([^']+)')"#).unwrap()
});

// Attribute-form links: `<link href="…">`, `<atom:link href="…">`.
static LINK_ATTR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(<[\w:]*link\b[^>]*?href=)(?:"([^"]+)"|'([^']+)')"#).unwrap());

// Text-content links: `<link>https://…</link>`.
static LINK_TEXT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(<link\s*>)\s*([^<\s][^<]*?)\s*(</link\s*>)").unwrap());

static ENCLOSURE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(<enclosure\b[^>]*?url=)(?:"([^"]+)"|'([^']+)')"#).unwrap());

static MEDIA_CONTENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(<media:content\b[^>]*?url=)(?:"([^"]+)"|'([^']+)')"#).unwrap());

static LOC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(<loc\s*>)\s*([^<\s][^<]*?)\s*(</loc\s*>)").unwrap());

static IMAGE_LOC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(<image:loc\s*>)\s*([^<\s][^<]*?)\s*(</image:loc\s*>)").unwrap());

fn rewrite_attr(caps: &Captures, urls: &UrlRewriter, base: &Url) -> String {
    let (target, quote) = if let Some(m) = caps.get(2) {
        (m.as_str(), "\"")
    } else {
        (caps.get(3).map(|m| m.as_str()).unwrap_or(""), "'")
    };
    match urls.proxify(target, base) {
        Some(proxied) => format!("{}{q}{}{q}", &caps[1], proxied, q = quote),
        None => caps[0].to_string(),
    }
}

fn rewrite_text(caps: &Captures, urls: &UrlRewriter, base: &Url) -> String {
    match urls.proxify(&caps[2], base) {
        Some(proxied) => format!("{}{}{}", &caps[1], proxied, &caps[3]),
        None => caps[0].to_string(),
    }
}

/// Rewrite the URL-bearing constructs of an XML document (RSS, Atom,
/// sitemaps). Already-proxied URLs pass through unchanged.
pub fn rewrite_xml(xml: &str, urls: &UrlRewriter, base: &Url) -> String {
    let attr_rules: &[&Lazy<Regex>] = &[
        &STYLESHEET_PI_RE,
        &LINK_ATTR_RE,
        &ENCLOSURE_RE,
        &MEDIA_CONTENT_RE,
    ];
    let text_rules: &[&Lazy<Regex>] = &[&LINK_TEXT_RE, &LOC_RE, &IMAGE_LOC_RE];

    let mut out = xml.to_string();
    for rule in attr_rules {
        out = rule
            .replace_all(&out, |caps: &Captures| rewrite_attr(caps, urls, base))
            .into_owned();
    }
    for rule in text_rules {
        out = rule
            .replace_all(&out, |caps: &Captures| rewrite_text(caps, urls, base))
            .into_owned();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urls() -> UrlRewriter {
        UrlRewriter::new("p.example")
    }

    fn base() -> Url {
        Url::parse("https://blog.example.org/feed.xml").unwrap()
    }

    #[test]
    fn rewrites_stylesheet_pi() {
        let xml = r#"<?xml-stylesheet type="text/xsl" href="https://blog.example.org/feed.xsl"?>"#;
        let out = rewrite_xml(xml, &urls(), &base());
        assert!(out.contains(r#"href="https://blog.example.org.p.example/feed.xsl""#));
    }

    #[test]
    fn rewrites_atom_link_attribute() {
        let xml = r#"<atom:link href="https://blog.example.org/feed" rel="self"/>"#;
        let out = rewrite_xml(xml, &urls(), &base());
        assert!(out.contains(r#"href="https://blog.example.org.p.example/feed""#));
        assert!(out.contains(r#"rel="self""#));
    }

    #[test]
    fn rewrites_link_text_content() {
        let xml = "<item><link>https://blog.example.org/post/1</link></item>";
        let out = rewrite_xml(xml, &urls(), &base());
        assert_eq!(
            out,
            "<item><link>https://blog.example.org.p.example/post/1</link></item>"
        );
    }

    #[test]
    fn rewrites_enclosure_and_media_content() {
        let xml = r#"<enclosure url="https://cdn.example.org/ep.mp3" length="1"/><media:content url="https://cdn.example.org/t.jpg"/>"#;
        let out = rewrite_xml(xml, &urls(), &base());
        assert!(out.contains(r#"<enclosure url="https://cdn.example.org.p.example/ep.mp3""#));
        assert!(out.contains(r#"<media:content url="https://cdn.example.org.p.example/t.jpg""#));
    }

    #[test]
    fn rewrites_sitemap_locs() {
        let xml = "<url><loc>https://blog.example.org/a</loc><image:loc>https://cdn.example.org/a.png</image:loc></url>";
        let out = rewrite_xml(xml, &urls(), &base());
        assert!(out.contains("<loc>https://blog.example.org.p.example/a</loc>"));
        assert!(out.contains("<image:loc>https://cdn.example.org.p.example/a.png</image:loc>"));
    }

    #[test]
    fn already_proxied_urls_are_skipped() {
        let xml = "<link>https://blog.example.org.p.example/post/1</link>";
        assert_eq!(rewrite_xml(xml, &urls(), &base()), xml);
    }

    #[test]
    fn unmatched_fragments_are_preserved() {
        let xml = "<unknown attr=\"value\">text</unknown>";
        assert_eq!(rewrite_xml(xml, &urls(), &base()), xml);
    }
}
