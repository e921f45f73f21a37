use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::{
    Extension,
    extract::{
        Query,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code},
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use relay_auth::Verified;
use relay_core::{ClientMeta, CorrelationId, MessageId};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::dispatch::Gateway;
use crate::protocol::{ClientEvent, ClientFrame, DisconnectReason, ServerFrame};

/// Handshake query parameters. A token may arrive here, in the
/// `Authorization` header, or in an `auth` first frame.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsParams {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub last_received_message_id: Option<String>,
}

/// Cloneable shutdown signal handed to every session loop.
#[derive(Clone)]
pub struct ShutdownSignal(pub watch::Receiver<bool>);

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    header(headers, "authorization")
        .and_then(|value| value.strip_prefix("Bearer ").map(str::to_string))
}

fn client_meta(headers: &HeaderMap) -> ClientMeta {
    ClientMeta {
        ip: header(headers, "x-forwarded-for")
            .map(|raw| raw.split(',').next().unwrap_or("").trim().to_string()),
        user_agent: header(headers, "user-agent"),
        app_version: header(headers, "x-app-version"),
        platform: header(headers, "x-platform"),
    }
}

/// GET /ws — upgrade to a session. A token supplied via query or header is
/// verified before the upgrade is accepted; otherwise the client owes an
/// `auth` frame within the auth window.
pub async fn ws_handler(
    Extension(gateway): Extension<Arc<Gateway>>,
    Extension(shutdown): Extension<ShutdownSignal>,
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
) -> Response {
    let token = params.token.clone().or_else(|| bearer_token(&headers));
    let correlation_id = params
        .correlation_id
        .clone()
        .or_else(|| header(&headers, "x-correlation-id"))
        .map(CorrelationId::new);
    let cursor = params
        .last_received_message_id
        .as_deref()
        .and_then(MessageId::parse);
    let client = client_meta(&headers);

    let preauth = match token {
        Some(token) => {
            let verify = gateway.verifier.verify(&token);
            match tokio::time::timeout(gateway.config.auth_timeout, verify).await {
                Ok(Ok(verified)) => Some(verified),
                Ok(Err(err)) => {
                    metrics::counter!(
                        "relay_disconnects_total",
                        "reason" => DisconnectReason::AuthFailure.as_str()
                    )
                    .increment(1);
                    return (
                        StatusCode::UNAUTHORIZED,
                        axum::Json(json!({
                            "error": "auth_failure",
                            "code": err.code(),
                        })),
                    )
                        .into_response();
                }
                Err(_) => {
                    return (
                        StatusCode::UNAUTHORIZED,
                        axum::Json(json!({
                            "error": "auth_failure",
                            "code": "internal",
                        })),
                    )
                        .into_response();
                }
            }
        }
        None => None,
    };

    ws.on_upgrade(move |socket| {
        run_session(gateway, shutdown.0, socket, preauth, correlation_id, cursor, client)
    })
}

async fn run_session(
    gateway: Arc<Gateway>,
    mut shutdown: watch::Receiver<bool>,
    socket: WebSocket,
    preauth: Option<Verified>,
    mut correlation_id: Option<CorrelationId>,
    mut cursor: Option<MessageId>,
    client: ClientMeta,
) {
    let (mut sink, mut stream) = socket.split();

    // Auth-frame window for connections that did not present a token at
    // upgrade time.
    let verified = match preauth {
        Some(verified) => verified,
        None => {
            let waited = tokio::time::timeout(
                gateway.config.auth_timeout,
                await_auth_frame(&gateway, &mut stream, &mut correlation_id, &mut cursor),
            )
            .await;
            match waited {
                Ok(Some(verified)) => verified,
                _ => {
                    metrics::counter!(
                        "relay_disconnects_total",
                        "reason" => DisconnectReason::AuthFailure.as_str()
                    )
                    .increment(1);
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::POLICY,
                            reason: "auth_failure".into(),
                        })))
                        .await;
                    return;
                }
            }
        }
    };

    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<ServerFrame>();
    let session = gateway
        .open_session(
            verified.user_id.clone(),
            correlation_id,
            client,
            cursor,
            frame_tx,
        )
        .await;
    debug!(user = %session.user_id, socket = %session.socket_id, "session opened");

    let last_pong = Arc::new(Mutex::new(Instant::now()));

    // Writer: single owner of the sink. Pumps outbound frames, sends pings
    // on the heartbeat cadence, and closes the transport when the pong
    // deadline (interval + grace) lapses.
    let writer = {
        let last_pong = last_pong.clone();
        let interval = gateway.config.heartbeat_interval;
        let deadline = gateway.config.heartbeat_interval + gateway.config.heartbeat_grace;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(100)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    frame = frame_rx.recv() => {
                        let Some(frame) = frame else { break DisconnectReason::ServerShutdown };
                        let Ok(text) = serde_json::to_string(&frame) else { continue };
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break DisconnectReason::TransportError;
                        }
                    }
                    _ = ticker.tick() => {
                        let idle = last_pong
                            .lock()
                            .unwrap_or_else(|err| err.into_inner())
                            .elapsed();
                        if idle > deadline {
                            let _ = sink
                                .send(Message::Close(Some(CloseFrame {
                                    code: close_code::AWAY,
                                    reason: "heartbeat_timeout".into(),
                                })))
                                .await;
                            break DisconnectReason::HeartbeatTimeout;
                        }
                        if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                            break DisconnectReason::TransportError;
                        }
                    }
                }
            }
        })
    };

    // Presence TTL extender on the heartbeat cadence; failures are logged
    // and never terminate the session.
    let presence_task = {
        let gateway = gateway.clone();
        let user_id = session.user_id.clone();
        let socket_id = session.socket_id.clone();
        let interval = gateway.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(100)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(err) = gateway.presence.extend_heartbeat(&user_id, &socket_id).await {
                    warn!(error = %err, user = %user_id, "presence heartbeat failed");
                }
            }
        })
    };

    // Reader: dispatches inbound frames until the transport ends or the
    // server shuts down.
    let reason = loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break DisconnectReason::ServerShutdown;
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(frame) => gateway.handle_frame(&session, frame).await,
                            Err(err) => session.emit_error(
                                &format!("malformed frame: {err}"),
                                Some("invalid_schema"),
                                None,
                            ),
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        *last_pong.lock().unwrap_or_else(|err| err.into_inner()) =
                            Instant::now();
                    }
                    Some(Ok(Message::Ping(_))) => {
                        // The transport answers pings for us; treat them as
                        // liveness as well.
                        *last_pong.lock().unwrap_or_else(|err| err.into_inner()) =
                            Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break DisconnectReason::TransportError;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        session.emit_error("binary frames are not supported", None, None);
                    }
                    Some(Err(err)) => {
                        debug!(error = %err, "websocket read error");
                        break DisconnectReason::TransportError;
                    }
                }
            }
        }
    };

    presence_task.abort();
    // If the writer already ended it observed the more specific cause
    // (e.g. the pong deadline); otherwise it would block on the open frame
    // channel, so it is aborted.
    let reason = if writer.is_finished() {
        writer.await.unwrap_or(reason)
    } else {
        writer.abort();
        reason
    };
    gateway.disconnect(&session.socket_id, reason).await;
}

/// Reads frames until an `auth` carrying a verifiable token arrives. Returns
/// `None` when the client sends something else first or the token fails.
async fn await_auth_frame(
    gateway: &Gateway,
    stream: &mut (impl futures::Stream<Item = Result<Message, axum::Error>> + Unpin),
    correlation_id: &mut Option<CorrelationId>,
    cursor: &mut Option<MessageId>,
) -> Option<Verified> {
    loop {
        let message = stream.next().await?;
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            _ => return None,
        };
        let frame: ClientFrame = serde_json::from_str(&text).ok()?;
        let ClientEvent::Auth(payload) = ClientEvent::parse(&frame).ok()? else {
            return None;
        };
        let token = payload.token.unwrap_or_default();
        match gateway.verifier.verify(&token).await {
            Ok(verified) => {
                if correlation_id.is_none() {
                    *correlation_id = payload.correlation_id.map(CorrelationId::new);
                }
                if cursor.is_none() {
                    *cursor = payload
                        .last_received_message_id
                        .as_deref()
                        .and_then(MessageId::parse);
                }
                return Some(verified);
            }
            Err(err) => {
                debug!(code = err.code(), "auth frame rejected");
                return None;
            }
        }
    }
}
