//! The WebSocket endpoint for channel subscriptions.
//!
//! One socket multiplexes any number of channel subscriptions. The handler
//! parses the client envelope, runs the authorize hook and snapshot loader
//! on subscribe, routes client events to their channel handlers, and fires
//! the browser viewer hooks as subscriptions come and go.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use lab_protocol::views::TypingEvent;
use lab_protocol::{Channel, ClientMessage, ServerMessage};

use crate::api::AppState;
use crate::error::LabError;

use super::hub::SocketId;

/// WebSocket upgrade handler.
///
/// GET /ws
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Authorization hook, run before any subscription is recorded.
///
/// The perimeter is trusted, so every channel is currently open; the seam
/// stays so per-channel policies can land without touching the handler.
fn authorize(_channel: &Channel) -> Result<(), LabError> {
    Ok(())
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let bus = state.bus.clone();
    let (socket_id, mut outbox) = bus.register_socket();
    let (mut sender, mut receiver) = socket.split();

    // Drain the socket's bus queue onto the wire.
    let send_task = tokio::spawn(async move {
        while let Some(message) = outbox.recv().await {
            let Ok(json) = serde_json::to_string(&message) else {
                continue;
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(incoming) = receiver.next().await {
        let message = match incoming {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(message) => message,
                Err(err) => {
                    // Malformed input never kills the socket.
                    debug!(socket_id, "ignoring malformed client message: {err}");
                    continue;
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                debug!(socket_id, "websocket error: {err}");
                break;
            }
        };

        match message {
            ClientMessage::Ping => {
                bus.send_to_socket(socket_id, ServerMessage::Pong);
            }
            ClientMessage::Subscribe { channel } => {
                handle_subscribe(&state, socket_id, &channel).await;
            }
            ClientMessage::Unsubscribe { channel } => {
                handle_unsubscribe(&state, socket_id, &channel).await;
            }
            ClientMessage::Event { channel, data } => {
                handle_client_event(&state, socket_id, &channel, data).await;
            }
        }
    }

    send_task.abort();

    // Fire last-unsubscribe hooks for everything the socket still held.
    for channel in bus.remove_socket(socket_id) {
        run_unsubscribe_hook(&state, &channel).await;
    }
    info!(socket_id, "bus socket closed");
}

fn send_error(state: &AppState, socket_id: SocketId, channel: &str, error: &str) {
    state.bus.send_to_socket(
        socket_id,
        ServerMessage::Error {
            channel: channel.to_string(),
            error: error.to_string(),
        },
    );
}

async fn handle_subscribe(state: &AppState, socket_id: SocketId, path: &str) {
    let Some(channel) = Channel::parse(path) else {
        send_error(state, socket_id, path, "Unknown channel");
        return;
    };

    if authorize(&channel).is_err() {
        send_error(state, socket_id, path, "Unauthorized");
        return;
    }

    // A socket gets at most one snapshot per channel.
    if state.bus.is_subscribed(socket_id, &channel) {
        return;
    }

    let snapshot = match state.snapshots.load(&channel).await {
        Ok(snapshot) => snapshot,
        Err(err) => {
            warn!(%channel, "snapshot load failed: {err:#}");
            send_error(state, socket_id, path, "Failed to load snapshot");
            return;
        }
    };

    // Snapshot is queued before the subscription is recorded, so it always
    // precedes any delta this socket receives for the channel.
    state.bus.send_to_socket(
        socket_id,
        ServerMessage::Snapshot {
            channel: channel.path(),
            data: snapshot,
        },
    );
    if !state.bus.subscribe(socket_id, &channel) {
        return;
    }

    run_subscribe_hook(state, &channel).await;
}

async fn handle_unsubscribe(state: &AppState, socket_id: SocketId, path: &str) {
    let Some(channel) = Channel::parse(path) else {
        return;
    };
    if state.bus.unsubscribe(socket_id, &channel) {
        run_unsubscribe_hook(state, &channel).await;
    }
}

/// Reference-counted side effects on first/any subscribe.
async fn run_subscribe_hook(state: &AppState, channel: &Channel) {
    if let Channel::SessionBrowserState { uuid } = channel {
        if let Err(err) = state.browser.subscribe(uuid).await {
            warn!(session_id = %uuid, "browser subscribe hook failed: {err:#}");
        }
    }
}

/// Reference-counted side effects on unsubscribe/close.
async fn run_unsubscribe_hook(state: &AppState, channel: &Channel) {
    if let Channel::SessionBrowserState { uuid } = channel {
        if let Err(err) = state.browser.unsubscribe(uuid).await {
            warn!(session_id = %uuid, "browser unsubscribe hook failed: {err:#}");
        }
    }
}

async fn handle_client_event(state: &AppState, socket_id: SocketId, path: &str, data: Value) {
    let Some(channel) = Channel::parse(path) else {
        send_error(state, socket_id, path, "Unknown channel");
        return;
    };
    if !state.bus.is_subscribed(socket_id, &channel) {
        send_error(state, socket_id, path, "Not subscribed");
        return;
    }

    match &channel {
        Channel::SessionTyping { uuid } => {
            let Ok(TypingEvent::SetTyping { user_id, typing }) =
                serde_json::from_value(data)
            else {
                debug!(%channel, "ignoring malformed typing event");
                return;
            };
            let users = state.live.set_typing(uuid, &user_id, typing);
            if let Ok(data) = serde_json::to_value(&users) {
                state.bus.publish_event(&channel, data);
            }
        }

        Channel::SessionBrowserInput { uuid } => {
            match state.browser.execute_command(uuid, data).await {
                Ok(result) => {
                    // Commands that yield a frame refresh the cache so late
                    // joiners see the viewport immediately.
                    if let Some(frame) = result
                        .get("data")
                        .and_then(|data| data.get("frame"))
                        .and_then(Value::as_str)
                    {
                        state.browser.record_frame(uuid, frame.to_string());
                    }
                    state.bus.send_to_socket(
                        socket_id,
                        ServerMessage::Event {
                            channel: channel.path(),
                            data: result,
                        },
                    );
                }
                Err(err) => {
                    send_error(state, socket_id, path, &err.to_string());
                }
            }
        }

        _ => {
            send_error(state, socket_id, path, "Channel does not accept events");
        }
    }
}
