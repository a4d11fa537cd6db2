use std::cell::{Cell, RefCell};
use std::io;
use std::rc::Rc;
use std::sync::Arc;

use bytes::Bytes;
use lol_html::html_content::ContentType;
use lol_html::{element, text, HtmlRewriter, Settings};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;
use url::Url;

use crate::assets;
use crate::mods::CompiledTextMod;

use super::{css, json, url::UrlRewriter};

/// Everything one response's HTML pass needs. Owned so the rewriter can move
/// onto its blocking task.
pub struct HtmlContext {
    pub urls: Arc<UrlRewriter>,
    pub base: Url,
    pub root_domain: String,
    pub inject_interceptor: bool,
    pub text_mods: Vec<CompiledTextMod>,
}

/// selector -> URL-bearing attribute. `ping` is a space-separated list and
/// gets its own treatment in the handler.
const URL_ATTRIBUTES: &[(&str, &str)] = &[
    ("a[href]", "href"),
    ("link[href]", "href"),
    ("area[href]", "href"),
    ("base[href]", "href"),
    ("a[ping]", "ping"),
    ("img[src]", "src"),
    ("script[src]", "src"),
    ("iframe[src]", "src"),
    ("embed[src]", "src"),
    ("source[src]", "src"),
    ("track[src]", "src"),
    ("video[src]", "src"),
    ("audio[src]", "src"),
    ("input[src]", "src"),
    ("frame[src]", "src"),
    ("object[data]", "data"),
    ("image[href]", "href"),
    ("form[action]", "action"),
    ("button[formaction]", "formaction"),
    ("input[formaction]", "formaction"),
    ("html[manifest]", "manifest"),
    ("body[background]", "background"),
    ("video[poster]", "poster"),
    ("object[codebase]", "codebase"),
    ("applet[codebase]", "codebase"),
    ("object[archive]", "archive"),
    ("applet[archive]", "archive"),
    ("frame[longdesc]", "longdesc"),
    ("iframe[longdesc]", "longdesc"),
    ("img[longdesc]", "longdesc"),
    ("blockquote[cite]", "cite"),
    ("del[cite]", "cite"),
    ("ins[cite]", "cite"),
    ("q[cite]", "cite"),
];

const SVG_URL_ATTRIBUTES: &[&str] = &["href", "xlink:href"];
const SVG_PAINT_ATTRIBUTES: &[&str] = &["fill", "stroke", "filter", "mask", "clip-path"];

/// Text inside these elements is never touched by text-rewriter mods.
const UNSAFE_TEXT_ANCESTORS: &[&str] = &["style", "svg", "noscript", "textarea", "pre", "code"];

/// OpenGraph / Twitter metas whose content is a URL.
const URL_META_KEYS: &[&str] = &[
    "og:url",
    "og:image",
    "og:image:url",
    "og:image:secure_url",
    "og:video",
    "og:video:url",
    "og:video:secure_url",
    "og:audio",
    "og:audio:url",
    "twitter:url",
    "twitter:image",
    "twitter:image:src",
    "twitter:player",
];

static META_REFRESH_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(url\s*=\s*)([^;]+)").unwrap());

// Inside `javascript:` URIs, navigation to an absolute URL is neutralized;
// everything else in the URI is left as-is.
static JS_URI_LOCATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)location\s*=\s*["']?http[^"';]*["']?"#).unwrap());

/// Rewrite a `srcset` attribute value: each `url[ descriptor]` entry has its
/// URL proxified and its descriptor preserved. An empty value is returned
/// unchanged.
pub fn rewrite_srcset(value: &str, urls: &UrlRewriter, base: &Url) -> String {
    if value.trim().is_empty() {
        return value.to_string();
    }
    value
        .split(',')
        .map(|entry| {
            let trimmed = entry.trim();
            let mut parts = trimmed.split_whitespace();
            let Some(url) = parts.next() else {
                return trimmed.to_string();
            };
            let descriptor = parts.collect::<Vec<_>>().join(" ");
            let rewritten = urls
                .proxify(url, base)
                .unwrap_or_else(|| url.to_string());
            if descriptor.is_empty() {
                rewritten
            } else {
                format!("{} {}", rewritten, descriptor)
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn rewrite_attribute(value: &str, attr: &str, urls: &UrlRewriter, base: &Url) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.len() >= 5 && trimmed.as_bytes()[..5].eq_ignore_ascii_case(b"data:") {
        return None;
    }
    if trimmed.len() >= 11 && trimmed.as_bytes()[..11].eq_ignore_ascii_case(b"javascript:") {
        let neutralized = JS_URI_LOCATION_RE.replace_all(value, "location='#'");
        return match neutralized {
            std::borrow::Cow::Owned(out) => Some(out),
            std::borrow::Cow::Borrowed(_) => None,
        };
    }
    if attr == "ping" {
        let rewritten = trimmed
            .split_whitespace()
            .map(|u| urls.proxify(u, base).unwrap_or_else(|| u.to_string()))
            .collect::<Vec<_>>()
            .join(" ");
        return if rewritten == trimmed {
            None
        } else {
            Some(rewritten)
        };
    }
    urls.proxify(value, base)
}

/// Rewrite an import map: every URL value through the JSON walker, plus the
/// keys of the `scopes` map, which are URLs themselves.
fn rewrite_import_map(source: &str, urls: &UrlRewriter, base: &Url) -> Option<String> {
    let mut value: Value = serde_json::from_str(source).ok()?;
    json::rewrite_value(&mut value, urls, base);
    if let Some(scopes) = value.get_mut("scopes").and_then(Value::as_object_mut) {
        let rewritten: serde_json::Map<String, Value> = scopes
            .iter()
            .map(|(key, entry)| {
                let key = urls
                    .proxify(key, base)
                    .unwrap_or_else(|| key.clone());
                (key, entry.clone())
            })
            .collect();
        *scopes = rewritten;
    }
    serde_json::to_string(&value).ok()
}

fn interceptor_snippet(root_domain: &str) -> String {
    format!(
        "<script>self.__CFG__={{rootDomain:'{}'}}</script><script src=\"{}\" async></script>",
        root_domain,
        assets::INTERCEPTOR_PATH
    )
}

type HandlerList<'h> = Vec<(
    std::borrow::Cow<'static, lol_html::Selector>,
    lol_html::ElementContentHandlers<'h>,
)>;

fn build_handlers(ctx: HtmlContext) -> HandlerList<'static> {
    let HtmlContext {
        urls,
        base,
        root_domain,
        inject_interceptor,
        text_mods,
    } = ctx;

    let mut handlers: HandlerList<'static> = Vec::new();

    // Interceptor injection on the first <head>.
    if inject_interceptor {
        let injected = Rc::new(Cell::new(false));
        let snippet = interceptor_snippet(&root_domain);
        handlers.push(element!("head", move |el| {
            if !injected.get() {
                injected.set(true);
                el.prepend(&snippet, ContentType::Html);
            }
            Ok(())
        }));
    }

    // Generic attribute rewriting.
    for (selector, attr) in URL_ATTRIBUTES {
        let urls = urls.clone();
        let base = base.clone();
        let attr = *attr;
        handlers.push(element!(*selector, move |el| {
            if let Some(value) = el.get_attribute(attr) {
                if let Some(rewritten) = rewrite_attribute(&value, attr, &urls, &base) {
                    el.set_attribute(attr, &rewritten)?;
                }
            }
            Ok(())
        }));
    }

    // SVG presentation attributes: plain URL references plus `url(...)`
    // paint values.
    {
        let urls = urls.clone();
        let base = base.clone();
        handlers.push(element!("svg *", move |el| {
            for attr in SVG_URL_ATTRIBUTES {
                if let Some(value) = el.get_attribute(attr) {
                    if let Some(rewritten) = urls.proxify(&value, &base) {
                        el.set_attribute(attr, &rewritten)?;
                    }
                }
            }
            for attr in SVG_PAINT_ATTRIBUTES {
                if let Some(value) = el.get_attribute(attr) {
                    if value.contains("url(") {
                        let rewritten = css::rewrite_css(&value, &urls, &base);
                        if rewritten != value {
                            el.set_attribute(attr, &rewritten)?;
                        }
                    }
                }
            }
            Ok(())
        }));
    }

    // srcset.
    for selector in ["img[srcset]", "source[srcset]"] {
        let urls = urls.clone();
        let base = base.clone();
        handlers.push(element!(selector, move |el| {
            if let Some(value) = el.get_attribute("srcset") {
                let rewritten = rewrite_srcset(&value, &urls, &base);
                if rewritten != value {
                    el.set_attribute("srcset", &rewritten)?;
                }
            }
            Ok(())
        }));
    }

    // Inline styles.
    {
        let urls = urls.clone();
        let base = base.clone();
        handlers.push(element!("*[style]", move |el| {
            if let Some(value) = el.get_attribute("style") {
                let rewritten = css::rewrite_css(&value, &urls, &base);
                if rewritten != value {
                    el.set_attribute("style", &rewritten)?;
                }
            }
            Ok(())
        }));
    }

    // Meta refresh plus OpenGraph/Twitter URL metas.
    {
        let urls = urls.clone();
        let base = base.clone();
        handlers.push(element!("meta[http-equiv]", move |el| {
            let is_refresh = el
                .get_attribute("http-equiv")
                .map(|v| v.eq_ignore_ascii_case("refresh"))
                .unwrap_or(false);
            if !is_refresh {
                return Ok(());
            }
            if let Some(content) = el.get_attribute("content") {
                let rewritten = META_REFRESH_URL_RE.replace(&content, |caps: &regex::Captures| {
                    let target = caps[2].trim().trim_matches('\'').trim_matches('"');
                    match urls.proxify(target, &base) {
                        Some(proxied) => format!("{}{}", &caps[1], proxied),
                        None => caps[0].to_string(),
                    }
                });
                if rewritten != content {
                    el.set_attribute("content", &rewritten)?;
                }
            }
            Ok(())
        }));
    }
    for selector in ["meta[property]", "meta[name]"] {
        let urls = urls.clone();
        let base = base.clone();
        let key_attr = if selector == "meta[property]" {
            "property"
        } else {
            "name"
        };
        handlers.push(element!(selector, move |el| {
            let Some(key) = el.get_attribute(key_attr) else {
                return Ok(());
            };
            if !URL_META_KEYS
                .iter()
                .any(|k| key.eq_ignore_ascii_case(k))
            {
                return Ok(());
            }
            if let Some(content) = el.get_attribute("content") {
                let trimmed = content.trim();
                if trimmed.starts_with("http") || trimmed.starts_with('/') {
                    if let Some(rewritten) = urls.proxify(trimmed, &base) {
                        el.set_attribute("content", &rewritten)?;
                    }
                }
            }
            Ok(())
        }));
    }

    // Import maps: buffer the script text, rewrite the JSON, re-serialize.
    {
        let urls = urls.clone();
        let base = base.clone();
        let buffer = Rc::new(RefCell::new(String::new()));
        handlers.push(text!(r#"script[type="importmap"]"#, move |chunk| {
            buffer.borrow_mut().push_str(chunk.as_str());
            if !chunk.last_in_text_node() {
                chunk.remove();
                return Ok(());
            }
            let full = buffer.replace(String::new());
            let rewritten = rewrite_import_map(&full, &urls, &base).unwrap_or(full);
            chunk.replace(&rewritten, ContentType::Html);
            Ok(())
        }));
    }

    // Speculation rules: same buffering, generic tree walk.
    {
        let urls = urls.clone();
        let base = base.clone();
        let buffer = Rc::new(RefCell::new(String::new()));
        handlers.push(text!(r#"script[type="speculationrules"]"#, move |chunk| {
            buffer.borrow_mut().push_str(chunk.as_str());
            if !chunk.last_in_text_node() {
                chunk.remove();
                return Ok(());
            }
            let full = buffer.replace(String::new());
            let rewritten = json::rewrite_json(&full, &urls, &base).unwrap_or(full);
            chunk.replace(&rewritten, ContentType::Html);
            Ok(())
        }));
    }

    // Subresource integrity cannot survive content rewriting.
    for selector in ["script[integrity]", "link[integrity]"] {
        handlers.push(element!(selector, |el| {
            el.remove_attribute("integrity");
            Ok(())
        }));
    }

    // Ancestor tracking for the text-mod guards. JSON script payloads
    // (import maps, speculation rules) belong to their own handlers and are
    // off-limits to mods. A single handler per element owns its end-tag
    // registration.
    let unsafe_depth = Rc::new(Cell::new(0usize));
    let script_depth = Rc::new(Cell::new(0usize));
    let json_script_depth = Rc::new(Cell::new(0usize));
    for tag in UNSAFE_TEXT_ANCESTORS {
        let depth = unsafe_depth.clone();
        handlers.push(element!(*tag, move |el| {
            depth.set(depth.get() + 1);
            let depth = depth.clone();
            if let Some(handlers) = el.end_tag_handlers() {
                handlers.push(Box::new(move |_| {
                    depth.set(depth.get().saturating_sub(1));
                    Ok(())
                }));
            }
            Ok(())
        }));
    }
    {
        let script_depth = script_depth.clone();
        let json_depth = json_script_depth.clone();
        handlers.push(element!("script", move |el| {
            let is_json = el
                .get_attribute("type")
                .map(|t| {
                    let t = t.trim().to_ascii_lowercase();
                    t == "importmap" || t == "speculationrules"
                })
                .unwrap_or(false);
            script_depth.set(script_depth.get() + 1);
            if is_json {
                json_depth.set(json_depth.get() + 1);
            }
            let script_depth = script_depth.clone();
            let json_depth = json_depth.clone();
            if let Some(handlers) = el.end_tag_handlers() {
                handlers.push(Box::new(move |_| {
                    script_depth.set(script_depth.get().saturating_sub(1));
                    if is_json {
                        json_depth.set(json_depth.get().saturating_sub(1));
                    }
                    Ok(())
                }));
            }
            Ok(())
        }));
    }

    // Text-rewriter mods.
    for text_mod in text_mods {
        let text_mod = Rc::new(text_mod);
        let selector = text_mod.selector.clone();
        let buffer = Rc::new(RefCell::new(String::new()));
        let removed_chunks = Rc::new(Cell::new(false));
        let unsafe_depth = unsafe_depth.clone();
        let script_depth = script_depth.clone();
        let json_script_depth = json_script_depth.clone();
        handlers.push(text!(selector, move |chunk| {
            buffer.borrow_mut().push_str(chunk.as_str());
            if !chunk.last_in_text_node() {
                chunk.remove();
                removed_chunks.set(true);
                return Ok(());
            }
            let full = buffer.replace(String::new());
            let had_removed = removed_chunks.replace(false);
            if unsafe_depth.get() > 0 || json_script_depth.get() > 0 {
                if had_removed {
                    chunk.replace(&full, ContentType::Html);
                }
                return Ok(());
            }
            let rewritten = if script_depth.get() > 0 {
                text_mod.apply_in_script(&full)
            } else {
                text_mod.apply(&full)
            };
            if had_removed || rewritten != full {
                chunk.replace(&rewritten, ContentType::Html);
            }
            Ok(())
        }));
    }

    handlers
}

/// Run the streaming rewrite on a blocking task: chunks in, rewritten chunks
/// out. Dropping the output receiver tears the pump down, which drops the
/// input receiver and cancels the upstream read.
pub fn spawn_rewriter(
    ctx: HtmlContext,
    input: mpsc::Receiver<Bytes>,
    output: mpsc::Sender<io::Result<Bytes>>,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || pump(ctx, input, output))
}

fn pump(ctx: HtmlContext, mut input: mpsc::Receiver<Bytes>, output: mpsc::Sender<io::Result<Bytes>>) {
    use std::sync::atomic::{AtomicBool, Ordering};

    // Set when the client goes away; returning drops the input receiver,
    // which makes the driver task drop the upstream body.
    let client_gone = Arc::new(AtomicBool::new(false));
    let sink_gone = client_gone.clone();
    let sink = output.clone();
    let mut rewriter = HtmlRewriter::new(
        Settings {
            element_content_handlers: build_handlers(ctx),
            ..Settings::default()
        },
        move |chunk: &[u8]| {
            if sink_gone.load(Ordering::Relaxed) {
                return;
            }
            if sink.blocking_send(Ok(Bytes::copy_from_slice(chunk))).is_err() {
                sink_gone.store(true, Ordering::Relaxed);
            }
        },
    );

    while let Some(chunk) = input.blocking_recv() {
        if client_gone.load(Ordering::Relaxed) {
            return;
        }
        if let Err(err) = rewriter.write(&chunk) {
            warn!("html rewrite aborted mid-stream: {}", err);
            return;
        }
    }
    if let Err(err) = rewriter.end() {
        warn!("html rewrite failed to finalize: {}", err);
    }
}
