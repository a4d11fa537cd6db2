pub mod cache;
pub mod engine;
pub mod upstream;
pub mod websocket;

pub use engine::ProxyEngine;

use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;

/// A fully rewritten response body plus its final headers, handed to the
/// edge cache for a fire-and-forget write.
#[derive(Debug, Clone)]
pub struct CachePayload {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}
