use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Result;
use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderName, HeaderValue, Response, StatusCode},
};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[cfg(feature = "redis")]
use redis::AsyncCommands;
#[cfg(feature = "redis")]
use tracing::warn;

use crate::config::CacheConfig;

use super::CachePayload;

/// Responses whose Cache-Control opts out of shared caching are never stored.
static CACHE_BYPASS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)private|no-store|no-cache").unwrap());

const MAX_ENTRIES: usize = 4096;
const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Serializable stored response.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    response: StoredResponse,
    created_at: SystemTime,
    ttl: Duration,
    last_accessed: SystemTime,
}

impl CacheEntry {
    fn new(response: StoredResponse, ttl: Duration) -> Self {
        let now = SystemTime::now();
        Self {
            response,
            created_at: now,
            ttl,
            last_accessed: now,
        }
    }

    fn is_expired(&self) -> bool {
        match self.created_at.elapsed() {
            Ok(elapsed) => elapsed > self.ttl,
            Err(_) => true,
        }
    }
}

enum CacheBackend {
    InMemory(Arc<DashMap<String, CacheEntry>>),
    #[cfg(feature = "redis")]
    Redis(redis::Client),
}

/// Edge cache of rewritten responses, keyed by the normalized outer GET URL.
/// Stored values never carry `Set-Cookie`; the write path enforces the
/// public-cache headers.
pub struct EdgeCache {
    config: CacheConfig,
    backend: CacheBackend,
}

impl EdgeCache {
    pub async fn new(config: &CacheConfig) -> Result<Self> {
        let backend = CacheBackend::InMemory(Arc::new(DashMap::new()));

        let cache = Self {
            config: config.clone(),
            backend,
        };

        if config.enabled {
            info!(
                "edge cache enabled, ttl {}s, {} cacheable type prefixes",
                config.ttl.as_secs(),
                config.cacheable_types.len()
            );
            cache.start_sweep_task();
        }

        Ok(cache)
    }

    /// Connect a Redis backend instead of the in-memory map. The key/value
    /// discipline is identical; eviction is delegated to Redis TTLs.
    #[cfg(feature = "redis")]
    pub async fn with_redis(config: &CacheConfig, url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        let _: std::result::Result<(), redis::RedisError> = conn.del("__health_check__").await;
        info!("edge cache using redis backend");

        Ok(Self {
            config: config.clone(),
            backend: CacheBackend::Redis(client),
        })
    }

    fn start_sweep_task(&self) {
        let CacheBackend::InMemory(map) = &self.backend else {
            return;
        };
        let map = map.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                let before = map.len();
                map.retain(|_, entry| !entry.is_expired());
                let expired = before.saturating_sub(map.len());
                if expired > 0 {
                    debug!("cache sweep removed {} expired entries", expired);
                }
            }
        });
    }

    /// Normalized cache key: method fixed to GET, no body, and no client
    /// cookies or auth involved.
    pub fn key(&self, host: &str, path_and_query: &str) -> String {
        format!("GET:https://{}{}", host, path_and_query)
    }

    /// Look up a stored response. Hits are marked `X-Proxy-Cache: HIT`.
    pub async fn get(&self, key: &str) -> Option<Response<Body>> {
        if !self.config.enabled {
            return None;
        }

        let stored = match &self.backend {
            CacheBackend::InMemory(map) => {
                let mut entry = map.get_mut(key)?;
                if entry.is_expired() {
                    drop(entry);
                    map.remove(key);
                    debug!("cache MISS (expired) for {}", key);
                    return None;
                }
                entry.last_accessed = SystemTime::now();
                entry.response.clone()
            }
            #[cfg(feature = "redis")]
            CacheBackend::Redis(client) => {
                let mut conn = client.get_multiplexed_async_connection().await.ok()?;
                let raw: String = conn.get(key).await.ok()?;
                let entry: CacheEntry = serde_json::from_str(&raw).ok()?;
                if entry.is_expired() {
                    let _: std::result::Result<(), redis::RedisError> = conn.del(key).await;
                    return None;
                }
                entry.response
            }
        };

        debug!("cache HIT for {}", key);
        Some(build_response(stored))
    }

    /// The safety filter: only successful responses of an allowed MIME type
    /// that have not opted out of shared caching are stored.
    pub fn should_store(&self, status: StatusCode, headers: &HeaderMap) -> bool {
        if !self.config.enabled || status != StatusCode::OK {
            return false;
        }

        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !self
            .config
            .cacheable_types
            .iter()
            .any(|prefix| content_type.contains(prefix.as_str()))
        {
            return false;
        }

        let cache_control = headers
            .get(header::CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        !CACHE_BYPASS_RE.is_match(cache_control)
    }

    /// Store a rewritten response. `Set-Cookie` is stripped and the public
    /// cache headers are enforced on the stored clone. Failures are silent;
    /// a broken write must not affect the response already in flight.
    pub async fn store(&self, key: String, payload: CachePayload) {
        if !self.config.enabled {
            return;
        }

        let mut headers = payload.headers;
        headers.remove(header::SET_COOKIE);

        let max_age = format!("public, max-age={}", self.config.ttl.as_secs());
        if let Ok(value) = HeaderValue::from_str(&max_age) {
            headers.insert(header::CACHE_CONTROL, value);
        }
        let cdn_age = format!("max-age={}", self.config.ttl.as_secs());
        if let Ok(value) = HeaderValue::from_str(&cdn_age) {
            headers.insert("cloudflare-cdn-cache-control", value);
        }
        append_vary_accept_encoding(&mut headers);

        let stored = StoredResponse {
            status: payload.status.as_u16(),
            headers: headers
                .iter()
                .map(|(name, value)| {
                    (
                        name.to_string(),
                        value.to_str().unwrap_or("").to_string(),
                    )
                })
                .collect(),
            body: payload.body.to_vec(),
        };
        let entry = CacheEntry::new(stored, self.config.ttl);

        match &self.backend {
            CacheBackend::InMemory(map) => {
                if map.len() >= MAX_ENTRIES {
                    evict_lru(map, 1);
                }
                map.insert(key.clone(), entry);
                debug!("cache SET for {}", key);
            }
            #[cfg(feature = "redis")]
            CacheBackend::Redis(client) => {
                let Ok(mut conn) = client.get_multiplexed_async_connection().await else {
                    warn!("cache write skipped: redis unavailable");
                    return;
                };
                let Ok(serialized) = serde_json::to_string(&entry) else {
                    return;
                };
                let result: std::result::Result<(), redis::RedisError> = conn
                    .set_ex(&key, serialized, self.config.ttl.as_secs())
                    .await;
                if let Err(err) = result {
                    warn!("cache write failed for {}: {}", key, err);
                }
            }
        }
    }
}

fn evict_lru(map: &DashMap<String, CacheEntry>, count: usize) {
    let mut access_times: Vec<(String, SystemTime)> = map
        .iter()
        .map(|entry| (entry.key().clone(), entry.value().last_accessed))
        .collect();
    access_times.sort_by_key(|&(_, time)| time);

    for (key, _) in access_times.into_iter().take(count) {
        map.remove(&key);
    }
}

fn append_vary_accept_encoding(headers: &mut HeaderMap) {
    let existing = headers
        .get(header::VARY)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if existing
        .split(',')
        .any(|token| token.trim().eq_ignore_ascii_case("accept-encoding"))
    {
        return;
    }
    let value = if existing.is_empty() {
        "Accept-Encoding".to_string()
    } else {
        format!("{}, Accept-Encoding", existing)
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(header::VARY, value);
    }
}

fn build_response(stored: StoredResponse) -> Response<Body> {
    let mut response = Response::new(Body::from(stored.body));
    *response.status_mut() =
        StatusCode::from_u16(stored.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let headers = response.headers_mut();
    for (name, value) in stored.headers {
        if let (Ok(name), Ok(value)) = (
            name.parse::<HeaderName>(),
            value.parse::<HeaderValue>(),
        ) {
            headers.append(name, value);
        }
    }
    headers.insert("x-proxy-cache", HeaderValue::from_static("HIT"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn config(enabled: bool) -> CacheConfig {
        CacheConfig {
            enabled,
            ttl: Duration::from_secs(3600),
            cacheable_types: vec!["image/".to_string(), "text/css".to_string()],
            redis_url: None,
        }
    }

    fn payload(headers: HeaderMap) -> CachePayload {
        CachePayload {
            status: StatusCode::OK,
            headers,
            body: Bytes::from_static(b"body"),
        }
    }

    fn type_headers(content_type: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_str(content_type).unwrap(),
        );
        headers
    }

    #[tokio::test]
    async fn safety_filter_checks_status_type_and_cache_control() {
        let cache = EdgeCache::new(&config(true)).await.unwrap();

        assert!(cache.should_store(StatusCode::OK, &type_headers("image/png")));
        assert!(!cache.should_store(StatusCode::NOT_FOUND, &type_headers("image/png")));
        assert!(!cache.should_store(StatusCode::OK, &type_headers("text/html")));

        let mut headers = type_headers("image/png");
        headers.insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static("private, max-age=60"),
        );
        assert!(!cache.should_store(StatusCode::OK, &headers));

        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        assert!(!cache.should_store(StatusCode::OK, &headers));
    }

    #[tokio::test]
    async fn stored_entries_have_no_set_cookie_and_forced_headers() {
        let cache = EdgeCache::new(&config(true)).await.unwrap();
        let key = cache.key("www.google.com.p.example", "/img.png");

        let mut headers = type_headers("image/png");
        headers.insert(header::SET_COOKIE, HeaderValue::from_static("sid=abc"));
        cache.store(key.clone(), payload(headers)).await;

        let hit = cache.get(&key).await.unwrap();
        assert_eq!(hit.status(), StatusCode::OK);
        assert!(hit.headers().get(header::SET_COOKIE).is_none());
        assert_eq!(
            hit.headers().get(header::CACHE_CONTROL).unwrap(),
            "public, max-age=3600"
        );
        assert_eq!(
            hit.headers().get("cloudflare-cdn-cache-control").unwrap(),
            "max-age=3600"
        );
        assert_eq!(hit.headers().get(header::VARY).unwrap(), "Accept-Encoding");
        assert_eq!(hit.headers().get("x-proxy-cache").unwrap(), "HIT");
    }

    #[tokio::test]
    async fn vary_is_appended_not_duplicated() {
        let cache = EdgeCache::new(&config(true)).await.unwrap();
        let key = cache.key("h.p.example", "/a.css");

        let mut headers = type_headers("text/css");
        headers.insert(header::VARY, HeaderValue::from_static("Origin"));
        cache.store(key.clone(), payload(headers)).await;

        let hit = cache.get(&key).await.unwrap();
        assert_eq!(
            hit.headers().get(header::VARY).unwrap(),
            "Origin, Accept-Encoding"
        );

        // Storing the already-annotated headers again stays a fixed point.
        let mut headers = type_headers("text/css");
        headers.insert(
            header::VARY,
            HeaderValue::from_static("Origin, Accept-Encoding"),
        );
        cache.store(key.clone(), payload(headers)).await;
        let hit = cache.get(&key).await.unwrap();
        assert_eq!(
            hit.headers().get(header::VARY).unwrap(),
            "Origin, Accept-Encoding"
        );
    }

    #[tokio::test]
    async fn disabled_cache_never_stores_or_serves() {
        let cache = EdgeCache::new(&config(false)).await.unwrap();
        let key = cache.key("h.p.example", "/a.css");
        assert!(!cache.should_store(StatusCode::OK, &type_headers("text/css")));
        cache.store(key.clone(), payload(type_headers("text/css"))).await;
        assert!(cache.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn repeated_writes_replace_prior_entries() {
        let cache = EdgeCache::new(&config(true)).await.unwrap();
        let key = cache.key("h.p.example", "/a.css");

        cache
            .store(
                key.clone(),
                CachePayload {
                    status: StatusCode::OK,
                    headers: type_headers("text/css"),
                    body: Bytes::from_static(b"first"),
                },
            )
            .await;
        cache
            .store(
                key.clone(),
                CachePayload {
                    status: StatusCode::OK,
                    headers: type_headers("text/css"),
                    body: Bytes::from_static(b"second"),
                },
            )
            .await;

        let hit = cache.get(&key).await.unwrap();
        let body = axum::body::to_bytes(hit.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"second");
    }
}
