use axum::{
    body::Body,
    extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    extract::FromRequestParts,
    http::{header, HeaderMap, HeaderValue, Request, Response},
};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        self,
        client::IntoClientRequest,
        protocol::{frame::coding::CloseCode, CloseFrame as UpstreamCloseFrame},
        Message as UpstreamMessage,
    },
};
use tracing::{debug, warn};
use url::Url;

use crate::config::CookieConfig;
use crate::error::{ProxyError, Result};

use super::upstream::filter_cookies;

/// True for an HTTP/1.1 `Upgrade: websocket` request.
pub fn is_upgrade(headers: &HeaderMap) -> bool {
    let upgrade = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let connection = headers
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    upgrade && connection
}

/// Accept the client socket and tunnel it to the upstream `wss` endpoint.
/// When the upstream refuses to upgrade the client is closed with `1002`;
/// no HTTP error body is produced.
pub async fn handle(
    req: Request<Body>,
    target: Url,
    cookies: &CookieConfig,
) -> Result<Response<Body>> {
    let (mut parts, _body) = req.into_parts();
    let ws = <WebSocketUpgrade as FromRequestParts<()>>::from_request_parts(&mut parts, &())
        .await
        .map_err(|_| ProxyError::BadRequest("malformed websocket upgrade".to_string()))?;

    let mut ws_url = target.clone();
    ws_url
        .set_scheme("wss")
        .map_err(|_| ProxyError::Internal("websocket target scheme".to_string()))?;

    let mut upstream_request = ws_url
        .as_str()
        .into_client_request()
        .map_err(|e| ProxyError::Upstream(format!("{}: {}", ws_url, e)))?;

    // Forward the headers the upstream handshake legitimately needs; the
    // key and version belong to our own client handshake.
    {
        let headers = upstream_request.headers_mut();
        if let Some(filtered) = parts
            .headers
            .get(header::COOKIE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| filter_cookies(v, cookies))
        {
            if let Ok(value) = HeaderValue::from_str(&filtered) {
                headers.insert(header::COOKIE, value);
            }
        }
        if parts.headers.contains_key(header::ORIGIN) {
            if let Some(host) = target.host_str() {
                if let Ok(value) = HeaderValue::from_str(&format!("https://{}", host)) {
                    headers.insert(header::ORIGIN, value);
                }
            }
        }
        for name in [
            header::SEC_WEBSOCKET_PROTOCOL,
            header::USER_AGENT,
            header::ACCEPT_LANGUAGE,
        ] {
            if let Some(value) = parts.headers.get(&name) {
                headers.insert(name, value.clone());
            }
        }
    }

    debug!("tunneling websocket to {}", ws_url);
    Ok(ws.on_upgrade(move |client| tunnel(client, upstream_request)))
}

async fn tunnel(mut client: WebSocket, request: tungstenite::handshake::client::Request) {
    let upstream = match connect_async(request).await {
        Ok((stream, _response)) => stream,
        Err(err) => {
            warn!("upstream websocket upgrade failed: {}", err);
            let _ = client
                .send(Message::Close(Some(CloseFrame {
                    code: 1002,
                    reason: "Upstream did not upgrade".into(),
                })))
                .await;
            return;
        }
    };

    pipe(client, upstream).await;
}

/// Mirror messages in both directions. Per-direction order is preserved;
/// closure of either side propagates the same `(code, reason)` to the other.
async fn pipe<S>(client: WebSocket, upstream: tokio_tungstenite::WebSocketStream<S>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    loop {
        tokio::select! {
            msg = client_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(frame))) => {
                        let frame = frame
                            .map(to_upstream_close)
                            .unwrap_or_else(|| upstream_close(CloseCode::Normal, "Normal Closure"));
                        let _ = upstream_tx.send(UpstreamMessage::Close(Some(frame))).await;
                        break;
                    }
                    Some(Ok(msg)) => {
                        if let Some(forward) = client_to_upstream(msg) {
                            if upstream_tx.send(forward).await.is_err() {
                                let _ = client_tx
                                    .send(Message::Close(Some(client_close(1011, "Internal Error"))))
                                    .await;
                                break;
                            }
                        }
                    }
                    Some(Err(_)) | None => {
                        let _ = upstream_tx
                            .send(UpstreamMessage::Close(Some(upstream_close(
                                CloseCode::Normal,
                                "Normal Closure",
                            ))))
                            .await;
                        break;
                    }
                }
            }
            msg = upstream_rx.next() => {
                match msg {
                    Some(Ok(UpstreamMessage::Close(frame))) => {
                        let frame = frame
                            .map(to_client_close)
                            .unwrap_or_else(|| client_close(1000, "Normal Closure"));
                        let _ = client_tx.send(Message::Close(Some(frame))).await;
                        break;
                    }
                    Some(Ok(msg)) => {
                        if let Some(forward) = upstream_to_client(msg) {
                            if client_tx.send(forward).await.is_err() {
                                let _ = upstream_tx
                                    .send(UpstreamMessage::Close(Some(upstream_close(
                                        CloseCode::Error,
                                        "Internal Error",
                                    ))))
                                    .await;
                                break;
                            }
                        }
                    }
                    Some(Err(_)) | None => {
                        let _ = client_tx
                            .send(Message::Close(Some(client_close(1000, "Normal Closure"))))
                            .await;
                        break;
                    }
                }
            }
        }
    }
}

fn client_to_upstream(msg: Message) -> Option<UpstreamMessage> {
    match msg {
        Message::Text(text) => Some(UpstreamMessage::Text(text)),
        Message::Binary(data) => Some(UpstreamMessage::Binary(data)),
        Message::Ping(data) => Some(UpstreamMessage::Ping(data)),
        Message::Pong(data) => Some(UpstreamMessage::Pong(data)),
        Message::Close(_) => None,
    }
}

fn upstream_to_client(msg: UpstreamMessage) -> Option<Message> {
    match msg {
        UpstreamMessage::Text(text) => Some(Message::Text(text)),
        UpstreamMessage::Binary(data) => Some(Message::Binary(data)),
        UpstreamMessage::Ping(data) => Some(Message::Ping(data)),
        UpstreamMessage::Pong(data) => Some(Message::Pong(data)),
        UpstreamMessage::Close(_) | UpstreamMessage::Frame(_) => None,
    }
}

fn to_upstream_close(frame: CloseFrame<'static>) -> UpstreamCloseFrame<'static> {
    UpstreamCloseFrame {
        code: CloseCode::from(frame.code),
        reason: frame.reason,
    }
}

fn to_client_close(frame: UpstreamCloseFrame<'static>) -> CloseFrame<'static> {
    CloseFrame {
        code: frame.code.into(),
        reason: frame.reason,
    }
}

fn client_close(code: u16, reason: &'static str) -> CloseFrame<'static> {
    CloseFrame {
        code,
        reason: reason.into(),
    }
}

fn upstream_close(code: CloseCode, reason: &'static str) -> UpstreamCloseFrame<'static> {
    UpstreamCloseFrame {
        code,
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upgrade_detection_needs_both_headers() {
        let mut headers = HeaderMap::new();
        assert!(!is_upgrade(&headers));

        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        assert!(!is_upgrade(&headers));

        headers.insert(
            header::CONNECTION,
            HeaderValue::from_static("keep-alive, Upgrade"),
        );
        assert!(is_upgrade(&headers));

        headers.insert(header::UPGRADE, HeaderValue::from_static("h2c"));
        assert!(!is_upgrade(&headers));
    }

    #[test]
    fn close_frames_round_trip_codes_and_reasons() {
        let upstream = to_upstream_close(CloseFrame {
            code: 4001,
            reason: "going away".into(),
        });
        assert_eq!(u16::from(upstream.code), 4001);
        assert_eq!(upstream.reason, "going away");

        let client = to_client_close(upstream);
        assert_eq!(client.code, 4001);
        assert_eq!(client.reason, "going away");
    }
}
