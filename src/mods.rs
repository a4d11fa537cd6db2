use axum::{
    body::Body,
    http::{HeaderValue, Response, StatusCode},
};
use regex::{Captures, NoExpand, Regex};
use std::collections::HashMap;
use tracing::{debug, warn};
use url::Url;

use crate::config::Config;

/// Domain scope grammar for mods: `*`, an exact host, or `*.root` (which
/// matches `root` itself and any subdomain of it).
#[derive(Debug, Clone, PartialEq)]
pub enum DomainPattern {
    Any,
    Exact(String),
    Suffix(String),
}

impl DomainPattern {
    pub fn parse(pattern: &str) -> Self {
        if pattern == "*" {
            DomainPattern::Any
        } else if let Some(root) = pattern.strip_prefix("*.") {
            DomainPattern::Suffix(root.to_string())
        } else {
            DomainPattern::Exact(pattern.to_string())
        }
    }

    pub fn matches(&self, host: &str) -> bool {
        match self {
            DomainPattern::Any => true,
            DomainPattern::Exact(exact) => host == exact,
            DomainPattern::Suffix(root) => {
                host == root || host.ends_with(&format!(".{}", root))
            }
        }
    }
}

/// Replacement spec for a text-rewriter mod: a single `(pattern, replacement)`
/// or a dictionary compiled into one alternation.
pub enum TextSpec {
    Single { pattern: String, replacement: String },
    Map(Vec<(String, String)>),
}

enum Replacement {
    Single(String),
    Map(HashMap<String, String>),
}

/// A text-rewriter mod compiled for one request: a selector for the HTML
/// streamer plus the regex applied to matched text nodes.
pub struct CompiledTextMod {
    pub id: String,
    pub selector: String,
    regex: Regex,
    replace: Replacement,
}

impl CompiledTextMod {
    pub fn compile(id: &str, selector: &str, spec: TextSpec) -> Option<Self> {
        let (regex, replace) = match spec {
            TextSpec::Single { pattern, replacement } => {
                let regex = match Regex::new(&pattern) {
                    Ok(regex) => regex,
                    Err(err) => {
                        warn!("mod '{}' has an invalid pattern: {}", id, err);
                        return None;
                    }
                };
                (regex, Replacement::Single(replacement))
            }
            TextSpec::Map(pairs) => {
                if pairs.is_empty() {
                    return None;
                }
                // Longest key first so a short key never shadows a longer
                // one inside the alternation.
                let mut keys: Vec<&String> = pairs.iter().map(|(k, _)| k).collect();
                keys.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
                let alternation = keys
                    .iter()
                    .map(|k| regex::escape(k))
                    .collect::<Vec<_>>()
                    .join("|");
                let regex = Regex::new(&alternation).ok()?;
                (regex, Replacement::Map(pairs.into_iter().collect()))
            }
        };

        Some(Self {
            id: id.to_string(),
            selector: selector.to_string(),
            regex,
            replace,
        })
    }

    fn resolve(&self, matched: &str) -> String {
        match &self.replace {
            Replacement::Single(replacement) => replacement.clone(),
            Replacement::Map(map) => map
                .get(matched)
                .cloned()
                .unwrap_or_else(|| matched.to_string()),
        }
    }

    /// Plain text-node rewrite. Replacements are literal.
    pub fn apply(&self, text: &str) -> String {
        match &self.replace {
            Replacement::Single(replacement) => self
                .regex
                .replace_all(text, NoExpand(replacement))
                .into_owned(),
            Replacement::Map(map) => self
                .regex
                .replace_all(text, |caps: &Captures| {
                    map.get(&caps[0])
                        .cloned()
                        .unwrap_or_else(|| caps[0].to_string())
                })
                .into_owned(),
        }
    }

    /// Script-context rewrite: matches adjacent to `/ . @ - :` sit inside
    /// URL- or JSON-like tokens and are left alone.
    pub fn apply_in_script(&self, text: &str) -> String {
        fn is_guard(c: Option<char>) -> bool {
            matches!(c, Some('/' | '.' | '@' | '-' | ':'))
        }

        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for m in self.regex.find_iter(text) {
            let before = text[..m.start()].chars().next_back();
            let after = text[m.end()..].chars().next();
            out.push_str(&text[last..m.start()]);
            if is_guard(before) || is_guard(after) {
                out.push_str(m.as_str());
            } else {
                out.push_str(&self.resolve(m.as_str()));
            }
            last = m.end();
        }
        out.push_str(&text[last..]);
        out
    }
}

/// Per-request inputs for text-mod factories.
pub struct TextModContext {
    pub target_host: String,
    pub root_domain: String,
}

impl TextModContext {
    fn proxied(&self, host: &str) -> String {
        format!("{}.{}", host, self.root_domain)
    }
}

type TextFactory = fn(&TextModContext) -> Option<CompiledTextMod>;
type TrafficHandler = fn(&Url) -> Option<Response<Body>>;

pub enum ModKind {
    /// Binds a text handler into the HTML stream.
    Text(TextFactory),
    /// Runs before the upstream fetch and may short-circuit the request.
    Traffic(TrafficHandler),
}

pub struct Mod {
    pub id: &'static str,
    pub domain_pattern: DomainPattern,
    pub kind: ModKind,
}

/// The enabled subset of the built-in mod set, filtered per request by
/// domain pattern.
pub struct ModRegistry {
    mods: Vec<Mod>,
}

impl ModRegistry {
    pub fn from_config(config: &Config) -> Self {
        let mods: Vec<Mod> = built_in_mods()
            .into_iter()
            .filter(|m| config.mods.get(m.id).copied().unwrap_or(false))
            .collect();
        for m in &mods {
            debug!("mod '{}' enabled for {:?}", m.id, m.domain_pattern);
        }
        Self { mods }
    }

    #[cfg(test)]
    pub fn with_mods(mods: Vec<Mod>) -> Self {
        Self { mods }
    }

    /// Compile the text mods that bind for this target host.
    pub fn text_mods(&self, ctx: &TextModContext) -> Vec<CompiledTextMod> {
        self.mods
            .iter()
            .filter(|m| m.domain_pattern.matches(&ctx.target_host))
            .filter_map(|m| match &m.kind {
                ModKind::Text(factory) => factory(ctx),
                ModKind::Traffic(_) => None,
            })
            .collect()
    }

    /// Run traffic mods for this target; the first short-circuit wins.
    pub fn run_traffic(&self, target: &Url) -> Option<Response<Body>> {
        let host = target.host_str()?;
        self.mods
            .iter()
            .filter(|m| m.domain_pattern.matches(host))
            .find_map(|m| match &m.kind {
                ModKind::Traffic(handler) => handler(target),
                ModKind::Text(_) => None,
            })
    }
}

fn built_in_mods() -> Vec<Mod> {
    vec![
        Mod {
            id: "host_cloak",
            domain_pattern: DomainPattern::Any,
            kind: ModKind::Text(host_cloak),
        },
        Mod {
            id: "tracker_block",
            domain_pattern: DomainPattern::Any,
            kind: ModKind::Traffic(tracker_block),
        },
    ]
}

/// Rewrites visible text occurrences of the upstream hostname to the proxied
/// hostname, so page chrome never reveals the origin. Dictionary mode keeps
/// `www.example.com` from being shadowed by its bare variant.
fn host_cloak(ctx: &TextModContext) -> Option<CompiledTextMod> {
    let mut pairs = vec![(ctx.target_host.clone(), ctx.proxied(&ctx.target_host))];
    if let Some(bare) = ctx.target_host.strip_prefix("www.") {
        pairs.push((bare.to_string(), ctx.proxied(bare)));
    }
    CompiledTextMod::compile("host_cloak", "*", TextSpec::Map(pairs))
}

/// Analytics and beacon origins get an empty success instead of a proxied
/// fetch.
const TRACKER_HOSTS: &[&str] = &[
    "google-analytics.com",
    "googletagmanager.com",
    "doubleclick.net",
    "hotjar.com",
    "segment.io",
    "connect.facebook.net",
];

fn tracker_block(target: &Url) -> Option<Response<Body>> {
    let host = target.host_str()?;
    let blocked = TRACKER_HOSTS
        .iter()
        .any(|t| host == *t || host.ends_with(&format!(".{}", t)));
    if !blocked {
        return None;
    }

    debug!("tracker_block short-circuited {}", host);
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::NO_CONTENT;
    response.headers_mut().insert(
        "x-robots-tag",
        HeaderValue::from_static("noindex, nofollow"),
    );
    Some(response)
}
