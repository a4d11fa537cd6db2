pub mod css;
pub mod headers;
pub mod html;
pub mod js;
pub mod json;
pub mod url;
pub mod xml;

use std::io;
use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderValue, Response, StatusCode},
};
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use ::url::Url;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::{ProxyError, Result};
use crate::mods::CompiledTextMod;
use crate::proxy::cache::EdgeCache;
use crate::proxy::CachePayload;

use self::url::UrlRewriter;

/// Buffered transforms cap the body in memory; anything larger streams
/// through untouched.
pub const MAX_TRANSFORM_BYTES: usize = 16 * 1024 * 1024;

/// Per-response context for the dispatcher and its content handlers.
pub struct ResponseContext {
    pub urls: Arc<UrlRewriter>,
    pub target: Url,
    pub root_domain: String,
    pub inject_interceptor: bool,
    pub text_mods: Vec<CompiledTextMod>,
}

/// Content handlers ordered by priority.
#[derive(Debug, Clone, Copy, PartialEq)]
enum TextTransform {
    Js,
    Css,
    Json,
    Xml,
}

fn classify(content_type: &str) -> Option<TextTransform> {
    if content_type.contains("javascript") {
        Some(TextTransform::Js)
    } else if content_type.contains("text/css") {
        Some(TextTransform::Css)
    } else if content_type.contains("application/json") || content_type.contains("manifest+json") {
        Some(TextTransform::Json)
    } else if content_type.contains("xml") {
        Some(TextTransform::Xml)
    } else {
        None
    }
}

/// Fan a rewritten upstream response out to the matching content handler.
/// Returns the client response plus, when the edge cache wants this entry,
/// the rewritten payload for the fire-and-forget write.
pub async fn dispatch(
    upstream: reqwest::Response,
    ctx: ResponseContext,
    cache: Option<&EdgeCache>,
) -> Result<(Response<Body>, Option<CachePayload>)> {
    let status = upstream.status();
    let mut response_headers = upstream.headers().clone();

    let header_ctx = headers::HeaderContext {
        urls: &ctx.urls,
        target: &ctx.target,
        root_domain: &ctx.root_domain,
    };
    headers::apply(&mut response_headers, status, &header_ctx);

    // 204/304 and redirects carry no transformable body.
    if headers::is_shortcut_status(status) {
        let body = Body::from_stream(upstream.bytes_stream());
        return Ok((assemble(status, response_headers, body), None));
    }

    let content_type = response_headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();

    // HTML streams through the rewriter; it is never buffered and therefore
    // never cached.
    if content_type.contains("text/html") {
        let body = stream_html(upstream, ctx);
        return Ok((assemble(status, response_headers, body), None));
    }

    let store_wanted = cache
        .map(|c| c.should_store(status, &response_headers))
        .unwrap_or(false);

    if content_type.contains("application/pdf") {
        response_headers.insert(
            header::CONTENT_DISPOSITION,
            HeaderValue::from_static("attachment"),
        );
    }

    let transform = classify(&content_type);

    // Passthrough without a cache write needs no buffering at all.
    if transform.is_none() && !store_wanted {
        let body = Body::from_stream(upstream.bytes_stream());
        return Ok((assemble(status, response_headers, body), None));
    }

    match buffer_capped(upstream, MAX_TRANSFORM_BYTES).await? {
        Buffered::Overflow(body) => {
            // Over the cap: stream untouched and skip the cache write.
            Ok((assemble(status, response_headers, body), None))
        }
        Buffered::Complete(bytes) => {
            let rewritten = transform
                .and_then(|kind| apply_transform(kind, &bytes, &ctx))
                .map(Bytes::from)
                .unwrap_or(bytes);

            set_content_length(&mut response_headers, rewritten.len());

            let payload = store_wanted.then(|| CachePayload {
                status,
                headers: response_headers.clone(),
                body: rewritten.clone(),
            });

            Ok((
                assemble(status, response_headers, Body::from(rewritten)),
                payload,
            ))
        }
    }
}

/// A transform that fails mid-way falls back to passthrough: a broken
/// rewrite must never break the response.
fn apply_transform(kind: TextTransform, bytes: &Bytes, ctx: &ResponseContext) -> Option<String> {
    let body = std::str::from_utf8(bytes).ok()?;
    match kind {
        TextTransform::Js => Some(js::rewrite_js(body)),
        TextTransform::Css => Some(css::rewrite_css(body, &ctx.urls, &ctx.target)),
        TextTransform::Json => json::rewrite_json(body, &ctx.urls, &ctx.target),
        TextTransform::Xml => Some(xml::rewrite_xml(body, &ctx.urls, &ctx.target)),
    }
}

fn stream_html(upstream: reqwest::Response, ctx: ResponseContext) -> Body {
    let (input_tx, input_rx) = mpsc::channel::<Bytes>(16);
    let (output_tx, output_rx) = mpsc::channel::<io::Result<Bytes>>(16);

    let html_ctx = html::HtmlContext {
        urls: ctx.urls,
        base: ctx.target,
        root_domain: ctx.root_domain,
        inject_interceptor: ctx.inject_interceptor,
        text_mods: ctx.text_mods,
    };
    html::spawn_rewriter(html_ctx, input_rx, output_tx);

    let mut body_stream = upstream.bytes_stream();
    tokio::spawn(async move {
        while let Some(next) = body_stream.next().await {
            match next {
                Ok(chunk) => {
                    // A closed channel means the client went away; dropping
                    // the stream cancels the upstream read.
                    if input_tx.send(chunk).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!("upstream body read failed mid-stream: {}", err);
                    break;
                }
            }
        }
    });

    let output = futures_util::stream::unfold(output_rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });
    Body::from_stream(output)
}

enum Buffered {
    Complete(Bytes),
    Overflow(Body),
}

/// Accumulate the body up to `cap` bytes. On overflow the prefix read so far
/// is chained back in front of the remaining stream.
async fn buffer_capped(upstream: reqwest::Response, cap: usize) -> Result<Buffered> {
    let mut stream = upstream.bytes_stream();
    let mut buffer = BytesMut::new();

    while let Some(next) = stream.next().await {
        let chunk = next.map_err(|e| ProxyError::Upstream(format!("body read: {}", e)))?;
        if buffer.len() + chunk.len() > cap {
            let prefix = buffer.freeze();
            let head = futures_util::stream::iter(vec![
                Ok::<Bytes, reqwest::Error>(prefix),
                Ok(chunk),
            ]);
            return Ok(Buffered::Overflow(Body::from_stream(head.chain(stream))));
        }
        buffer.extend_from_slice(&chunk);
    }

    Ok(Buffered::Complete(buffer.freeze()))
}

fn set_content_length(headers: &mut HeaderMap, len: usize) {
    if let Ok(value) = HeaderValue::from_str(&len.to_string()) {
        headers.insert(header::CONTENT_LENGTH, value);
    }
}

fn assemble(status: StatusCode, headers: HeaderMap, body: Body) -> Response<Body> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_priority_matches_dispatch_table() {
        assert_eq!(classify("application/javascript"), Some(TextTransform::Js));
        assert_eq!(
            classify("application/x-javascript; charset=utf-8"),
            Some(TextTransform::Js)
        );
        assert_eq!(classify("text/css"), Some(TextTransform::Css));
        assert_eq!(
            classify("application/json; charset=utf-8"),
            Some(TextTransform::Json)
        );
        assert_eq!(
            classify("application/manifest+json"),
            Some(TextTransform::Json)
        );
        assert_eq!(classify("application/rss+xml"), Some(TextTransform::Xml));
        assert_eq!(classify("image/png"), None);
        assert_eq!(classify("application/pdf"), None);
    }

    #[test]
    fn content_length_is_recomputed() {
        let mut headers = HeaderMap::new();
        set_content_length(&mut headers, 42);
        assert_eq!(headers.get(header::CONTENT_LENGTH).unwrap(), "42");
    }
}
