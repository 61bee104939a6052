//! WebSocket gateway.
//!
//! One reader loop and one writer task per connection, joined by a
//! bounded queue; overflow closes the connection. Every broadcast on the
//! bus is filtered against the connection's own subscription set, so an
//! event reaches a socket exactly once per subscribed channel. Closing
//! the socket tears down subscriptions and typing indicators.

use std::collections::HashSet;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use ctp_auth::Authenticated;
use ctp_core::ApiError;
use ctp_events::Envelope;

use crate::extract::CurrentUser;
use crate::state::AppState;

/// Closed when the token did not authenticate.
const CLOSE_UNAUTHORIZED: u16 = 4401;
/// Closed after 60 s without client traffic.
const CLOSE_IDLE: u16 = 4408;

const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
/// Outbound queue depth per connection; overflow closes the socket.
const OUTBOUND_QUEUE: usize = 64;

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ClientEvent {
    #[serde(rename = "channel:subscribe")]
    Subscribe { channels: Vec<String> },
    #[serde(rename = "channel:unsubscribe")]
    Unsubscribe { channels: Vec<String> },
    #[serde(rename = "typing:start")]
    TypingStart { channel: String },
    #[serde(rename = "typing:stop")]
    TypingStop { channel: String },
    #[serde(rename = "read:mark")]
    ReadMark { channel: String, message_id: Uuid },
    #[serde(rename = "system:ping")]
    Ping,
}

/// `GET /ws?token=<access_token>`.
pub async fn handler(
    State(state): State<AppState>,
    auth: Result<CurrentUser, ApiError>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        match auth {
            Ok(user) => run_connection(state, socket, user.0).await,
            Err(_) => {
                let mut socket = socket;
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code: CLOSE_UNAUTHORIZED,
                        reason: "policy violation: authentication failed".into(),
                    })))
                    .await;
            }
        }
    })
}

async fn display_name(state: &AppState, user_id: Uuid) -> Option<String> {
    let row: Option<(Option<String>, Option<String>, String)> =
        sqlx::query_as("SELECT given_name, family_name, username FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&state.pool)
            .await
            .ok()
            .flatten();
    row.map(|(given, family, username)| match (given, family) {
        (Some(g), Some(f)) => format!("{g} {f}"),
        (Some(g), None) => g,
        (None, Some(f)) => f,
        (None, None) => username,
    })
}

async fn run_connection(state: AppState, socket: WebSocket, auth: Authenticated) {
    let principal = auth.principal;
    let user_id = principal.user_id;
    info!(%user_id, "websocket connected");

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);

    // Writer task: the only place that touches the sink, so per-channel
    // enqueue order is delivery order.
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let is_close = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() {
                break;
            }
            if is_close {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut subscriptions: HashSet<String> = HashSet::new();
    let mut bus = state.broker.subscribe();
    let name = display_name(&state, user_id).await;

    let _ = tx
        .send(Message::Text(
            json!({ "type": "system:connected", "user_id": user_id }).to_string().into(),
        ))
        .await;

    let mut deadline = Instant::now() + IDLE_TIMEOUT;
    loop {
        tokio::select! {
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        deadline = Instant::now() + IDLE_TIMEOUT;
                        handle_client_event(
                            &state,
                            &principal,
                            name.as_deref(),
                            &tx,
                            &mut subscriptions,
                            &text,
                        )
                        .await;
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        deadline = Instant::now() + IDLE_TIMEOUT;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Binary(_))) => {
                        send_error(&tx, "INVALID_EVENT", "binary frames are not supported").await;
                    }
                    Some(Err(e)) => {
                        debug!(%user_id, error = %e, "websocket receive error");
                        break;
                    }
                }
            }
            bus_message = bus.recv() => {
                let Some(bus_message) = bus_message else { break };
                if !subscriptions.contains(&bus_message.channel) {
                    continue;
                }
                let Ok(payload) = serde_json::to_string(&bus_message.envelope) else {
                    continue;
                };
                // Bounded queue: a consumer that cannot keep up gets
                // disconnected instead of buffering without limit.
                if tx.try_send(Message::Text(payload.into())).is_err() {
                    warn!(%user_id, "outbound queue overflow, closing connection");
                    break;
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                let _ = tx
                    .send(Message::Close(Some(CloseFrame {
                        code: CLOSE_IDLE,
                        reason: "idle timeout".into(),
                    })))
                    .await;
                break;
            }
        }
    }

    // Deterministic teardown: indicators vanish with the connection.
    let channels: Vec<String> = subscriptions.iter().cloned().collect();
    state.typing.clear_user(&channels, user_id).await;
    drop(tx);
    let _ = writer.await;
    info!(%user_id, "websocket disconnected");
}

async fn send_json(tx: &mpsc::Sender<Message>, value: serde_json::Value) {
    let _ = tx.send(Message::Text(value.to_string().into())).await;
}

async fn send_error(tx: &mpsc::Sender<Message>, code: &str, message: &str) {
    send_json(tx, json!({ "type": "error", "code": code, "message": message })).await;
}

async fn handle_client_event(
    state: &AppState,
    principal: &ctp_auth::Principal,
    user_name: Option<&str>,
    tx: &mpsc::Sender<Message>,
    subscriptions: &mut HashSet<String>,
    raw: &str,
) {
    let event: ClientEvent = match serde_json::from_str(raw) {
        Ok(event) => event,
        Err(_) => {
            send_error(tx, "INVALID_EVENT", "unknown or invalid event type").await;
            return;
        }
    };

    match event {
        ClientEvent::Subscribe { channels } => {
            let mut accepted = Vec::new();
            for channel in channels {
                match state.channels.authorize(principal, &channel).await {
                    Ok(_) => {
                        subscriptions.insert(channel.clone());
                        accepted.push(channel);
                    }
                    Err(denied) => {
                        send_json(
                            tx,
                            json!({
                                "type": "channel:error",
                                "channel": channel,
                                "reason": denied.reason(),
                            }),
                        )
                        .await;
                    }
                }
            }
            if !accepted.is_empty() {
                send_json(tx, json!({ "type": "channel:subscribed", "channels": accepted })).await;
            }
        }
        ClientEvent::Unsubscribe { channels } => {
            let mut removed = Vec::new();
            for channel in channels {
                if subscriptions.remove(&channel) {
                    state.typing.stop_typing(&channel, principal.user_id).await;
                    removed.push(channel);
                }
            }
            send_json(tx, json!({ "type": "channel:unsubscribed", "channels": removed })).await;
        }
        ClientEvent::TypingStart { channel } => {
            if !subscriptions.contains(&channel) {
                send_error(tx, "NOT_SUBSCRIBED", "not subscribed to channel").await;
                return;
            }
            state.typing.set_typing(&channel, principal.user_id, user_name).await;
            state
                .broker
                .publish(
                    &channel,
                    Envelope::new(
                        "typing:update",
                        channel.clone(),
                        json!({
                            "channel": channel,
                            "user_id": principal.user_id,
                            "user_name": user_name,
                            "is_typing": true,
                        }),
                    ),
                )
                .await;
        }
        ClientEvent::TypingStop { channel } => {
            // Silently ignore stops for channels never subscribed.
            if !subscriptions.contains(&channel) {
                return;
            }
            state.typing.stop_typing(&channel, principal.user_id).await;
            state
                .broker
                .publish(
                    &channel,
                    Envelope::new(
                        "typing:update",
                        channel.clone(),
                        json!({
                            "channel": channel,
                            "user_id": principal.user_id,
                            "user_name": serde_json::Value::Null,
                            "is_typing": false,
                        }),
                    ),
                )
                .await;
        }
        ClientEvent::ReadMark { channel, message_id } => {
            if !subscriptions.contains(&channel) {
                send_error(tx, "NOT_SUBSCRIBED", "not subscribed to channel").await;
                return;
            }
            if let Err(e) = state.messages.mark_read(principal, message_id).await {
                send_error(tx, e.code, "failed to mark message as read").await;
                return;
            }
            // Read receipts broadcast only in submission group scope.
            if channel.starts_with("submission_group:") {
                state
                    .broker
                    .publish(
                        &channel,
                        Envelope::new(
                            "read:update",
                            channel.clone(),
                            json!({
                                "channel": channel,
                                "message_id": message_id,
                                "user_id": principal.user_id,
                            }),
                        ),
                    )
                    .await;
            }
        }
        ClientEvent::Ping => {
            send_json(tx, json!({ "type": "system:pong", "timestamp": Utc::now() })).await;
        }
    }
}
