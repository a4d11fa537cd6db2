use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

/// Main configuration structure. Loaded once at startup from the process
/// environment and treated as immutable afterwards.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    /// The wildcard zone served by the proxy, e.g. `p.example`.
    pub root_domain: String,
    pub cache: CacheConfig,
    pub features: FeatureConfig,
    pub cookies: CookieConfig,
    /// Mod id -> enabled, from `MOD_*` environment variables.
    pub mods: HashMap<String, bool>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl: Duration,
    /// MIME prefixes matched by `contains` against the response Content-Type.
    pub cacheable_types: Vec<String>,
    /// Optional external backend; requires the `redis` cargo feature.
    pub redis_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeatureConfig {
    pub stealth_mode: bool,
    pub service_worker: bool,
}

/// Cookie names matching any of these patterns never reach the upstream:
/// they belong to the proxy itself or to the root site.
#[derive(Debug, Clone)]
pub struct CookieConfig {
    pub root_passthrough: Vec<Regex>,
    pub proxy_passthrough: Vec<Regex>,
}

impl CookieConfig {
    /// True when a cookie name matches either passthrough set.
    pub fn is_passthrough(&self, name: &str) -> bool {
        self.root_passthrough
            .iter()
            .chain(self.proxy_passthrough.iter())
            .any(|re| re.is_match(name))
    }
}

const DEFAULT_LISTEN: &str = "0.0.0.0:8080";
const DEFAULT_CACHE_TTL_SECS: u64 = 3600;

fn default_cacheable_types() -> Vec<String> {
    [
        "image/",
        "font/",
        "audio/",
        "video/",
        "text/css",
        "text/plain",
        "application/javascript",
        "application/x-javascript",
        "application/pdf",
        "image/x-icon",
        "image/vnd.microsoft.icon",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Load configuration from an explicit variable set. Split out of
    /// `from_env` so tests do not race on the process environment.
    pub fn from_vars(vars: impl Iterator<Item = (String, String)>) -> Result<Self> {
        let vars: HashMap<String, String> = vars.collect();

        let root_domain = vars
            .get("ROOT_DOMAIN")
            .map(|s| s.trim().to_ascii_lowercase())
            .context("ROOT_DOMAIN is required")?;

        let listen = vars
            .get("LISTEN_ADDR")
            .map(String::as_str)
            .unwrap_or(DEFAULT_LISTEN)
            .parse::<SocketAddr>()
            .context("LISTEN_ADDR must be a socket address")?;

        let cache = CacheConfig {
            enabled: vars
                .get("CACHE_ENABLED")
                .map(|v| parse_bool(v))
                .unwrap_or(true),
            ttl: Duration::from_secs(match vars.get("CACHE_TTL") {
                Some(v) => v.trim().parse::<u64>().context("CACHE_TTL must be an integer number of seconds")?,
                None => DEFAULT_CACHE_TTL_SECS,
            }),
            cacheable_types: match vars.get("CACHEABLE_TYPES") {
                Some(v) => serde_json::from_str::<Vec<String>>(v)
                    .context("CACHEABLE_TYPES must be a JSON array of MIME prefixes")?,
                None => default_cacheable_types(),
            },
            redis_url: vars.get("CACHE_REDIS_URL").cloned(),
        };

        let features = FeatureConfig {
            stealth_mode: vars
                .get("FEATURES_STEALTH_MODE")
                .map(|v| parse_bool(v))
                .unwrap_or(true),
            service_worker: vars
                .get("FEATURES_SERVICE_WORKER")
                .map(|v| parse_bool(v))
                .unwrap_or(true),
        };

        let cookies = CookieConfig {
            root_passthrough: compile_globs(vars.get("COOKIE_ROOT_PASSTHROUGH"))
                .context("COOKIE_ROOT_PASSTHROUGH")?,
            proxy_passthrough: compile_globs(vars.get("COOKIE_PROXY_PASSTHROUGH"))
                .context("COOKIE_PROXY_PASSTHROUGH")?,
        };

        let mods = vars
            .iter()
            .filter_map(|(key, value)| {
                key.strip_prefix("MOD_")
                    .filter(|id| !id.is_empty())
                    .map(|id| (id.to_ascii_lowercase(), parse_bool(value)))
            })
            .collect();

        let config = Config {
            server: ServerConfig { listen },
            root_domain,
            cache,
            features,
            cookies,
            mods,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration. Failures abort startup.
    pub fn validate(&self) -> Result<()> {
        if self.root_domain.contains("://") || self.root_domain.contains('/') {
            anyhow::bail!(
                "ROOT_DOMAIN must be a bare hostname, got '{}'",
                self.root_domain
            );
        }

        if !is_valid_hostname(&self.root_domain) {
            anyhow::bail!(
                "ROOT_DOMAIN is not a valid RFC-1123 hostname: '{}'",
                self.root_domain
            );
        }

        if self.cache.enabled && self.cache.ttl.as_secs() == 0 {
            anyhow::bail!("CACHE_TTL cannot be zero while the cache is enabled");
        }

        Ok(())
    }
}

/// Boolean-like environment values: `true`, `1` and `on` (any case) are true.
pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "on"
    )
}

/// RFC-1123 hostname check: dot-separated alphanumeric/hyphen labels of at
/// most 63 bytes, no leading or trailing hyphen, 253 bytes total.
fn is_valid_hostname(host: &str) -> bool {
    if host.is_empty() || host.len() > 253 {
        return false;
    }
    host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-')
    })
}

fn compile_globs(value: Option<&String>) -> Result<Vec<Regex>> {
    let Some(raw) = value else {
        return Ok(Vec::new());
    };
    let patterns: Vec<String> =
        serde_json::from_str(raw).context("expected a JSON array of glob patterns")?;
    patterns.iter().map(|p| glob_to_regex(p)).collect()
}

/// Compile a glob pattern (`*` and `?` wildcards) to an anchored regex.
fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out).with_context(|| format!("invalid glob pattern '{}'", pattern))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> impl Iterator<Item = (String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<Vec<_>>()
            .into_iter()
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let config = Config::from_vars(vars(&[("ROOT_DOMAIN", "p.example")])).unwrap();
        assert_eq!(config.root_domain, "p.example");
        assert!(config.cache.enabled);
        assert_eq!(config.cache.ttl, Duration::from_secs(3600));
        assert!(config
            .cache
            .cacheable_types
            .iter()
            .any(|t| t == "image/"));
        assert!(config.features.stealth_mode);
        assert!(config.features.service_worker);
    }

    #[test]
    fn missing_root_domain_fails() {
        assert!(Config::from_vars(vars(&[])).is_err());
    }

    #[test]
    fn root_domain_with_scheme_or_path_fails() {
        assert!(Config::from_vars(vars(&[("ROOT_DOMAIN", "https://p.example")])).is_err());
        assert!(Config::from_vars(vars(&[("ROOT_DOMAIN", "p.example/path")])).is_err());
        assert!(Config::from_vars(vars(&[("ROOT_DOMAIN", "-bad.example")])).is_err());
    }

    #[test]
    fn boolean_like_values() {
        assert!(parse_bool("true"));
        assert!(parse_bool("1"));
        assert!(parse_bool("ON"));
        assert!(!parse_bool("false"));
        assert!(!parse_bool("0"));
        assert!(!parse_bool("yes"));
    }

    #[test]
    fn mod_flags_are_collected_by_id() {
        let config = Config::from_vars(vars(&[
            ("ROOT_DOMAIN", "p.example"),
            ("MOD_HOST_CLOAK", "true"),
            ("MOD_TRACKER_BLOCK", "off"),
        ]))
        .unwrap();
        assert_eq!(config.mods.get("host_cloak"), Some(&true));
        assert_eq!(config.mods.get("tracker_block"), Some(&false));
    }

    #[test]
    fn cookie_globs_compile_anchored() {
        let config = Config::from_vars(vars(&[
            ("ROOT_DOMAIN", "p.example"),
            ("COOKIE_PROXY_PASSTHROUGH", r#"["__proxy_*", "csrf"]"#),
        ]))
        .unwrap();
        assert!(config.cookies.is_passthrough("__proxy_session"));
        assert!(config.cookies.is_passthrough("csrf"));
        // Anchored: a prefix match alone is not enough.
        assert!(!config.cookies.is_passthrough("xcsrf"));
        assert!(!config.cookies.is_passthrough("csrf_token"));
    }

    #[test]
    fn cacheable_types_override_parses_json() {
        let config = Config::from_vars(vars(&[
            ("ROOT_DOMAIN", "p.example"),
            ("CACHEABLE_TYPES", r#"["text/css"]"#),
        ]))
        .unwrap();
        assert_eq!(config.cache.cacheable_types, vec!["text/css".to_string()]);
    }
}
