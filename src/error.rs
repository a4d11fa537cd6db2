use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde_json::json;
use thiserror::Error;

/// Application-wide error types
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),

    #[error("Not a proxyable hostname: {0}")]
    NotProxyable(String),

    #[error("Invalid proxy target: {0}")]
    InvalidTarget(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Upstream fetch failed: {0}")]
    Upstream(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::NotProxyable(_) => StatusCode::NOT_FOUND,
            ProxyError::InvalidTarget(_) => StatusCode::BAD_REQUEST,
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            ProxyError::NotProxyable(_) => "NOT_PROXYABLE",
            ProxyError::InvalidTarget(_) => "INVALID_TARGET",
            ProxyError::BadRequest(_) => "BAD_REQUEST",
            ProxyError::Upstream(_) => "UPSTREAM_ERROR",
            ProxyError::Config(_) => "CONFIG_ERROR",
            ProxyError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // The message is the error's display form only. Source chains and
        // backtraces stay in the logs.
        let body = Json(json!({
            "error": "Proxy Error",
            "message": self.to_string(),
            "timestamp": Utc::now().to_rfc3339(),
        }));

        let mut response = (status, body).into_response();
        response
            .headers_mut()
            .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        response.headers_mut().insert(
            "x-robots-tag",
            HeaderValue::from_static("noindex, nofollow"),
        );
        response
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
