use serde_json::Value;
use url::Url;

use super::url::UrlRewriter;

/// Owned `serde_json::Value` trees cannot contain back-edges, so the walker
/// is total by construction; the depth cap bounds adversarially nested
/// documents instead.
const MAX_DEPTH: usize = 128;

/// Recursively proxify every string field that looks like an absolute URL
/// (`http://` or `https://` prefix). Keys are left alone; `rewrite_import_map`
/// handles the one format whose keys are URLs themselves.
pub fn rewrite_value(value: &mut Value, urls: &UrlRewriter, base: &Url) {
    walk(value, urls, base, 0);
}

fn walk(value: &mut Value, urls: &UrlRewriter, base: &Url, depth: usize) {
    if depth >= MAX_DEPTH {
        return;
    }
    match value {
        Value::String(s) => {
            if looks_like_url(s) {
                if let Some(proxied) = urls.proxify(s, base) {
                    *s = proxied;
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                walk(item, urls, base, depth + 1);
            }
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                walk(item, urls, base, depth + 1);
            }
        }
        _ => {}
    }
}

fn looks_like_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

/// Rewrite a serialized JSON body. Returns `None` on parse failure so the
/// caller can fall back to passthrough.
pub fn rewrite_json(body: &str, urls: &UrlRewriter, base: &Url) -> Option<String> {
    let mut value: Value = serde_json::from_str(body).ok()?;
    rewrite_value(&mut value, urls, base);
    serde_json::to_string(&value).ok()
}
