//! WebSocket handler for the QR login channel
//!
//! A connection joins one or more session tokens and receives their events
//! as JSON frames. Every subscription is dropped when the connection ends.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use qrgate_auth::token_fingerprint;
use qrgate_core::{ChannelEvent, ChannelFrame, ClientMessage};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::channel::Subscription;
use crate::state::AppState;

/// Interval between keepalive pings
const KEEPALIVE: Duration = Duration::from_secs(30);

/// WebSocket handler for `/ws/qr-auth`
pub async fn qr_auth_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_qr_auth_socket(socket, state))
}

fn encode(frame: &ChannelFrame) -> Option<Message> {
    match serde_json::to_string(frame) {
        Ok(json) => Some(Message::Text(json)),
        Err(e) => {
            warn!("Failed to encode channel frame: {}", e);
            None
        }
    }
}

fn error_frame(token: Option<String>, message: &str) -> ChannelFrame {
    ChannelFrame {
        token,
        event: ChannelEvent::Error {
            message: message.to_string(),
        },
    }
}

/// Handle a QR login channel connection
pub async fn handle_qr_auth_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ChannelFrame>();
    let mut subscriptions: HashMap<String, Subscription> = HashMap::new();

    info!("QR channel client connected");

    let mut keepalive = tokio::time::interval_at(tokio::time::Instant::now() + KEEPALIVE, KEEPALIVE);

    loop {
        tokio::select! {
            Some(frame) = rx.recv() => {
                if let Some(msg) = encode(&frame) {
                    if sender.send(msg).await.is_err() {
                        break;
                    }
                }
            }
            msg = receiver.next() => {
                let reply = match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_message(&state, &text, &tx, &mut subscriptions).await
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                        None
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!("WebSocket receive error: {}", e);
                        break;
                    }
                    _ => None,
                };

                if let Some(msg) = reply.as_ref().and_then(encode) {
                    if sender.send(msg).await.is_err() {
                        break;
                    }
                }
            }
            _ = keepalive.tick() => {
                let ping = ChannelFrame::connection(ChannelEvent::Ping {
                    timestamp: std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .map(|d| d.as_millis() as u64)
                        .unwrap_or(0),
                });
                if let Some(msg) = encode(&ping) {
                    if sender.send(msg).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    let released = subscriptions.len();
    drop(subscriptions);
    info!(
        "QR channel client disconnected ({} subscriptions released)",
        released
    );
}

/// Apply one client message; returns a frame to send back, if any
async fn handle_client_message(
    state: &AppState,
    text: &str,
    tx: &mpsc::UnboundedSender<ChannelFrame>,
    subscriptions: &mut HashMap<String, Subscription>,
) -> Option<ChannelFrame> {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::JoinQrSession {
            token,
            client_session_id,
        }) => {
            if subscriptions.contains_key(&token) {
                debug!("Duplicate join for {}", token_fingerprint(&token));
                return None;
            }
            // Only the client that requested the session may listen on it
            match state
                .issuer
                .authorize_subscriber(&token, &client_session_id)
                .await
            {
                Ok(_) => {
                    let subscription = state.channel.subscribe(&token, tx.clone());
                    debug!("Joined QR session {}", token_fingerprint(&token));
                    subscriptions.insert(token, subscription);
                    None
                }
                Err(e) => {
                    debug!("Join refused for {}: {}", token_fingerprint(&token), e);
                    Some(error_frame(Some(token), "Unknown QR session"))
                }
            }
        }
        Ok(ClientMessage::LeaveQrSession { token }) => {
            if subscriptions.remove(&token).is_some() {
                debug!("Left QR session {}", token_fingerprint(&token));
            }
            None
        }
        Err(e) => {
            warn!("Invalid channel message: {}", e);
            Some(error_frame(None, "Malformed message"))
        }
    }
}
