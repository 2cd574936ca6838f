//! WebSocket endpoint and per-connection frame loop
//!
//! Each connection is one sequential task: the challenge goes out, the first
//! frame must be a `connect` request, and only after the handshake promotes
//! the connection does the (deliberately small) post-handshake loop run.
//! Frames for one connection are handled strictly in arrival order.

use crate::handshake::{ConnectionContext, HandshakeController, HandshakeSuccess};
use crate::state::AppState;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::{header, HeaderMap},
    response::IntoResponse,
};
use chrono::Utc;
use futures::{stream::SplitSink, SinkExt, StreamExt};
use gatehouse_core::protocol::{
    truncate_close_reason, ErrorBody, ErrorCode, Frame, EVENT_CHALLENGE,
    CLOSE_POLICY_VIOLATION,
};
use gatehouse_core::GatewayConfig;
use serde_json::json;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Resolve the client IP, honoring forwarding headers only from trusted
/// proxies.
pub fn resolve_client_ip(peer: SocketAddr, headers: &HeaderMap, config: &GatewayConfig) -> IpAddr {
    let peer_ip = peer.ip();
    if !config
        .trusted_proxies
        .iter()
        .any(|p| p.parse::<IpAddr>().map(|ip| ip == peer_ip).unwrap_or(false))
    {
        return peer_ip;
    }

    // First hop in X-Forwarded-For is the original client.
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse::<IpAddr>().ok())
    {
        return forwarded;
    }

    if config.allow_real_ip_fallback {
        if let Some(real) = headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<IpAddr>().ok())
        {
            return real;
        }
    }

    peer_ip
}

/// WebSocket handler for the gateway endpoint
pub async fn gateway_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let remote_ip = resolve_client_ip(peer, &headers, &state.config);
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    ws.on_upgrade(move |socket| handle_gateway_socket(socket, state, remote_ip, origin))
}

type WsSender = SplitSink<WebSocket, Message>;

async fn send_frame(sender: &mut WsSender, frame: &Frame) -> Result<(), axum::Error> {
    let json = serde_json::to_string(frame).map_err(axum::Error::new)?;
    sender.send(Message::Text(json)).await
}

async fn close_with(sender: &mut WsSender, code: u16, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: truncate_close_reason(reason).into(),
    };
    let _ = sender.send(Message::Close(Some(frame))).await;
}

/// Drive one connection from challenge to close.
pub async fn handle_gateway_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    remote_ip: IpAddr,
    origin: Option<String>,
) {
    let (mut sender, mut receiver) = socket.split();
    let ctx = ConnectionContext::new(remote_ip, origin);
    let controller = HandshakeController::new(state.clone());

    debug!(
        "Connection {} open from {}",
        ctx.challenge.connection_id, remote_ip
    );

    let challenge = Frame::event(EVENT_CHALLENGE, json!({ "nonce": ctx.challenge.nonce }));
    if send_frame(&mut sender, &challenge).await.is_err() {
        return;
    }

    // The handshake has a bounded budget for its first frame; idle
    // connections are forcibly closed.
    let timeout = Duration::from_millis(state.config.handshake_timeout_ms);
    let first = tokio::time::timeout(timeout, next_text_frame(&mut receiver)).await;
    let text = match first {
        Ok(Some(text)) => text,
        Ok(None) => return,
        Err(_) => {
            debug!("Connection {} handshake timeout", ctx.challenge.connection_id);
            close_with(&mut sender, CLOSE_POLICY_VIOLATION, "handshake timeout").await;
            return;
        }
    };

    let (req_id, connect) = match parse_connect_frame(&text) {
        Ok(parsed) => parsed,
        Err(ParseRejection { req_id, message }) => {
            warn!(
                "Connection {} sent a malformed first frame: {}",
                ctx.challenge.connection_id, message
            );
            if let Some(id) = req_id {
                let body = ErrorBody::new(ErrorCode::InvalidRequest, message.clone());
                let _ = send_frame(&mut sender, &Frame::err_res(id, body)).await;
            }
            close_with(&mut sender, CLOSE_POLICY_VIOLATION, &message).await;
            return;
        }
    };

    let success = match controller.process_connect(&ctx, &connect).await {
        Ok(success) => success,
        Err(rejection) => {
            controller
                .record_rejection(&ctx, Some(connect.client.id.as_str()), &rejection)
                .await;
            let _ = send_frame(&mut sender, &Frame::err_res(req_id, rejection.error_body())).await;
            close_with(&mut sender, rejection.close_code, &rejection.message).await;
            return;
        }
    };

    let hello = match serde_json::to_value(&success.hello) {
        Ok(value) => value,
        Err(e) => {
            warn!("Failed to encode hello payload: {}", e);
            return;
        }
    };
    if send_frame(&mut sender, &Frame::ok_res(req_id, hello)).await.is_err() {
        state.presence.remove(&success.presence_key).await;
        return;
    }

    connected_loop(&mut sender, &mut receiver, &state, &success).await;

    state.presence.remove(&success.presence_key).await;
    info!(
        "Connection {} closed ({})",
        ctx.challenge.connection_id, success.presence_key
    );
}

/// Next text payload, skipping transport-level ping/pong. `None` means the
/// peer went away.
async fn next_text_frame(
    receiver: &mut futures::stream::SplitStream<WebSocket>,
) -> Option<String> {
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => return Some(text),
            // Binary is not part of this protocol; treat like a bad frame.
            Ok(Message::Binary(_)) => return Some(String::new()),
            Ok(Message::Close(_)) => return None,
            Ok(_) => continue,
            Err(e) => {
                debug!("WebSocket receive error: {}", e);
                return None;
            }
        }
    }
    None
}

struct ParseRejection {
    req_id: Option<String>,
    message: String,
}

/// The first frame must be a `connect` request with well-formed params.
fn parse_connect_frame(
    text: &str,
) -> Result<(String, gatehouse_core::protocol::ConnectRequest), ParseRejection> {
    let frame: Frame = serde_json::from_str(text).map_err(|_| ParseRejection {
        req_id: None,
        message: "first frame must be a connect request".into(),
    })?;
    let Frame::Req { id, method, params } = frame else {
        return Err(ParseRejection {
            req_id: None,
            message: "first frame must be a connect request".into(),
        });
    };
    if method != "connect" {
        return Err(ParseRejection {
            req_id: Some(id),
            message: format!("expected connect, got {method}"),
        });
    }
    let params = params.ok_or_else(|| ParseRejection {
        req_id: Some(id.clone()),
        message: "connect request missing params".into(),
    })?;
    let connect = serde_json::from_value(params).map_err(|e| ParseRejection {
        req_id: Some(id.clone()),
        message: format!("malformed connect request: {e}"),
    })?;
    Ok((id, connect))
}

/// Post-handshake loop: keepalive plus `ping`. Everything else is routed
/// elsewhere in the gateway and answered `UNAVAILABLE` here.
async fn connected_loop(
    sender: &mut WsSender,
    receiver: &mut futures::stream::SplitStream<WebSocket>,
    state: &Arc<AppState>,
    success: &HandshakeSuccess,
) {
    let tick = Duration::from_millis(state.config.policy.tick_interval_ms.max(1_000));
    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if handle_request(sender, &text).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("WebSocket receive error for {}: {}", success.presence_key, e);
                        break;
                    }
                }
            }
            _ = tokio::time::sleep(tick) => {
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn handle_request(sender: &mut WsSender, text: &str) -> Result<(), axum::Error> {
    let Ok(frame) = serde_json::from_str::<Frame>(text) else {
        debug!("Ignoring unparseable frame");
        return Ok(());
    };
    let Frame::Req { id, method, .. } = frame else {
        return Ok(());
    };
    let response = match method.as_str() {
        "ping" => Frame::ok_res(id, json!({ "ts": Utc::now().timestamp_millis() })),
        "connect" => Frame::err_res(
            id,
            ErrorBody::new(ErrorCode::InvalidRequest, "connection already authorized"),
        ),
        other => Frame::err_res(
            id,
            ErrorBody::new(
                ErrorCode::Unavailable,
                format!("method not served on this endpoint: {other}"),
            ),
        ),
    };
    send_frame(sender, &response).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(
                axum::http::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                v.parse().unwrap(),
            );
        }
        map
    }

    fn peer(ip: &str) -> SocketAddr {
        format!("{ip}:50000").parse().unwrap()
    }

    #[test]
    fn test_untrusted_peer_headers_ignored() {
        let config = GatewayConfig::default();
        let resolved = resolve_client_ip(
            peer("203.0.113.5"),
            &headers(&[("x-forwarded-for", "10.0.0.1")]),
            &config,
        );
        assert_eq!(resolved.to_string(), "203.0.113.5");
    }

    #[test]
    fn test_trusted_proxy_forwarded_for() {
        let mut config = GatewayConfig::default();
        config.trusted_proxies = vec!["203.0.113.5".into()];
        let resolved = resolve_client_ip(
            peer("203.0.113.5"),
            &headers(&[("x-forwarded-for", "198.51.100.7, 10.0.0.1")]),
            &config,
        );
        assert_eq!(resolved.to_string(), "198.51.100.7");
    }

    #[test]
    fn test_real_ip_fallback_requires_opt_in() {
        let mut config = GatewayConfig::default();
        config.trusted_proxies = vec!["203.0.113.5".into()];
        let hdrs = headers(&[("x-real-ip", "198.51.100.7")]);

        let resolved = resolve_client_ip(peer("203.0.113.5"), &hdrs, &config);
        assert_eq!(resolved.to_string(), "203.0.113.5");

        config.allow_real_ip_fallback = true;
        let resolved = resolve_client_ip(peer("203.0.113.5"), &hdrs, &config);
        assert_eq!(resolved.to_string(), "198.51.100.7");
    }

    #[test]
    fn test_parse_connect_frame_shapes() {
        assert!(parse_connect_frame("not json").is_err());
        assert!(parse_connect_frame(r#"{"type":"event","event":"x"}"#).is_err());

        let wrong_method = parse_connect_frame(r#"{"type":"req","id":"1","method":"other"}"#)
            .unwrap_err();
        assert_eq!(wrong_method.req_id.as_deref(), Some("1"));

        let ok = parse_connect_frame(
            r#"{"type":"req","id":"1","method":"connect","params":{
                "minProtocol":3,"maxProtocol":3,
                "client":{"id":"c","version":"1","platform":"linux","mode":"cli"},
                "role":"operator"}}"#,
        );
        assert!(ok.is_ok());
    }
}
