use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderValue, Method, Response, StatusCode},
    response::IntoResponse,
    routing::any,
    Router,
};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{debug, error, info, instrument};
use url::Url;
use uuid::Uuid;

use crate::assets;
use crate::config::Config;
use crate::error::{ProxyError, Result as ProxyResult};
use crate::mods::{ModRegistry, TextModContext};
use crate::resolver::{normalize_host, Resolution, TargetResolver};
use crate::rewrite::{self, url::UrlRewriter, ResponseContext};

use super::cache::EdgeCache;
use super::upstream::{rewrite_request_headers, UpstreamClient};
use super::websocket;

/// The request orchestrator: composes asset generation, cache, resolution,
/// mods, the WebSocket tunnel and the rewrite pipeline per request.
pub struct ProxyEngine {
    config: Arc<Config>,
    resolver: TargetResolver,
    urls: Arc<UrlRewriter>,
    upstream: UpstreamClient,
    cache: Arc<EdgeCache>,
    mods: ModRegistry,
}

#[derive(Clone)]
struct AppState {
    engine: Arc<ProxyEngine>,
}

impl ProxyEngine {
    pub async fn new(config: Arc<Config>) -> anyhow::Result<Self> {
        let cache = build_cache(&config).await?;

        Ok(Self {
            resolver: TargetResolver::new(&config.root_domain),
            urls: Arc::new(UrlRewriter::new(&config.root_domain)),
            upstream: UpstreamClient::new()
                .map_err(|e| anyhow::anyhow!("upstream client: {}", e))?,
            cache: Arc::new(cache),
            mods: ModRegistry::from_config(&config),
            config,
        })
    }

    /// Start the proxy server.
    pub async fn start(self: Arc<Self>) -> ProxyResult<()> {
        let listen = self.config.server.listen;
        let state = AppState { engine: self };

        let app = Router::new()
            .route("/*path", any(handle_request))
            .fallback(handle_request)
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(TimeoutLayer::new(std::time::Duration::from_secs(60)))
                    .into_inner(),
            )
            .with_state(state);

        let listener = TcpListener::bind(listen)
            .await
            .map_err(|e| ProxyError::Internal(format!("failed to bind {}: {}", listen, e)))?;

        info!("proxy listening on {}", listen);

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .map_err(|e| ProxyError::Internal(format!("server error: {}", e)))?;

        Ok(())
    }

    #[instrument(skip(self, req, client_ip), fields(request_id, client_ip, method, uri))]
    async fn process(
        &self,
        req: Request,
        client_ip: std::net::IpAddr,
    ) -> ProxyResult<Response<Body>> {
        let request_id = Uuid::new_v4().to_string();
        let method = req.method().clone();
        let uri = req.uri().to_string();

        tracing::Span::current()
            .record("request_id", request_id.as_str())
            .record("client_ip", client_ip.to_string().as_str())
            .record("method", method.as_str())
            .record("uri", uri.as_str());

        let host = extract_host(&req)
            .ok_or_else(|| ProxyError::BadRequest("missing Host header".to_string()))?;
        let path = req.uri().path().to_string();
        let query = req.uri().query().map(str::to_string);
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        // Generated assets are served on every proxy hostname.
        if let Some(response) = assets::handle(&path, query.as_deref(), &self.config) {
            return Ok(response);
        }

        // Cache read, GET only.
        let cache_key = (method == Method::GET && self.config.cache.enabled)
            .then(|| self.cache.key(&host, &path_and_query));
        if let Some(key) = &cache_key {
            if let Some(hit) = self.cache.get(key).await {
                debug!("serving cached response for {}", key);
                return Ok(hit);
            }
        }

        // Target resolution, including the landing/redirect surface.
        let target = match self.resolver.resolve(&host, &path_and_query)? {
            Resolution::Landing => {
                if let Some(query) = query.as_deref() {
                    if let Some(to) = self.resolver.root_redirect(query) {
                        return Ok(redirect_response(&to));
                    }
                }
                return Ok(landing_response());
            }
            Resolution::Target(url) => url,
        };

        // Traffic mods may short-circuit with their own response.
        if let Some(response) = self.mods.run_traffic(&target) {
            return Ok(response);
        }

        // WebSocket branch.
        if websocket::is_upgrade(req.headers()) {
            return websocket::handle(req, target, &self.config.cookies).await;
        }

        // Request rewrite and upstream fetch.
        let (parts, body) = req.into_parts();
        let outbound_headers =
            rewrite_request_headers(&parts.headers, &target, &self.resolver, &self.config.cookies);
        let upstream_response = self
            .upstream
            .fetch(parts.method, &target, outbound_headers, body)
            .await?;

        debug!(
            "upstream {} replied {}",
            target,
            upstream_response.status()
        );

        // Response dispatch.
        let ctx = self.response_context(&target);
        let (mut response, payload) = rewrite::dispatch(
            upstream_response,
            ctx,
            cache_key.is_some().then(|| self.cache.as_ref()),
        )
        .await?;

        response.headers_mut().insert(
            "x-robots-tag",
            HeaderValue::from_static("noindex, nofollow"),
        );

        // Fire-and-forget cache write; it must never delay the response.
        if let (Some(key), Some(payload)) = (cache_key, payload) {
            let cache = self.cache.clone();
            tokio::spawn(async move {
                cache.store(key, payload).await;
            });
        }

        Ok(response)
    }

    fn response_context(&self, target: &Url) -> ResponseContext {
        let target_host = target.host_str().unwrap_or_default().to_string();
        let text_mods = self.mods.text_mods(&TextModContext {
            target_host,
            root_domain: self.config.root_domain.clone(),
        });

        ResponseContext {
            urls: self.urls.clone(),
            target: target.clone(),
            root_domain: self.config.root_domain.clone(),
            inject_interceptor: self.config.features.stealth_mode,
            text_mods,
        }
    }
}

async fn build_cache(config: &Config) -> anyhow::Result<EdgeCache> {
    #[cfg(feature = "redis")]
    if let Some(url) = &config.cache.redis_url {
        return EdgeCache::with_redis(&config.cache, url).await;
    }
    #[cfg(not(feature = "redis"))]
    if config.cache.redis_url.is_some() {
        tracing::warn!("CACHE_REDIS_URL set but the redis feature is not compiled in");
    }
    EdgeCache::new(&config.cache).await
}

/// The outer error boundary: everything the pipeline throws is converted to
/// the generic JSON error response.
async fn handle_request(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response<Body> {
    match state.engine.process(req, addr.ip()).await {
        Ok(response) => response,
        Err(err) => {
            if err.status_code().is_server_error() {
                error!("request failed: {} ({})", err, err.error_code());
            } else {
                debug!("request rejected: {} ({})", err, err.error_code());
            }
            err.into_response()
        }
    }
}

/// Host resolution mirrors the edge: `X-Forwarded-Host` first, then `Host`.
fn extract_host(req: &Request) -> Option<String> {
    let headers = req.headers();
    let raw = headers
        .get("x-forwarded-host")
        .and_then(|v| v.to_str().ok())
        .or_else(|| headers.get(header::HOST).and_then(|v| v.to_str().ok()))?;
    let host = normalize_host(raw);
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

fn redirect_response(to: &Url) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::FOUND;
    if let Ok(value) = HeaderValue::from_str(to.as_str()) {
        response.headers_mut().insert(header::LOCATION, value);
    }
    response.headers_mut().insert(
        "x-robots-tag",
        HeaderValue::from_static("noindex, nofollow"),
    );
    response
}

fn landing_response() -> Response<Body> {
    let mut response = Response::new(Body::from("no proxy target specified"));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response.headers_mut().insert(
        "x-robots-tag",
        HeaderValue::from_static("noindex, nofollow"),
    );
    response
}
