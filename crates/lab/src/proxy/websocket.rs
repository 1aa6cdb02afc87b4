//! Bidirectional WebSocket relay.
//!
//! The client side is upgraded immediately; the upstream connection opens
//! asynchronously. Client frames arriving before the upstream is ready are
//! buffered and flushed in order once it connects.

use axum::extract::ws::{Message as AxumMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use log::debug;
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;

fn to_upstream(msg: AxumMessage) -> Option<TungsteniteMessage> {
    Some(match msg {
        AxumMessage::Text(text) => TungsteniteMessage::Text(text.to_string().into()),
        AxumMessage::Binary(data) => TungsteniteMessage::Binary(data),
        AxumMessage::Ping(data) => TungsteniteMessage::Ping(data),
        AxumMessage::Pong(data) => TungsteniteMessage::Pong(data),
        AxumMessage::Close(_) => TungsteniteMessage::Close(None),
    })
}

fn to_client(msg: TungsteniteMessage) -> Option<AxumMessage> {
    Some(match msg {
        TungsteniteMessage::Text(text) => AxumMessage::Text(text.to_string().into()),
        TungsteniteMessage::Binary(data) => AxumMessage::Binary(data),
        TungsteniteMessage::Ping(data) => AxumMessage::Ping(data),
        TungsteniteMessage::Pong(data) => AxumMessage::Pong(data),
        TungsteniteMessage::Close(_) => AxumMessage::Close(None),
        TungsteniteMessage::Frame(_) => return None,
    })
}

/// Relay an upgraded client socket to `target_url`.
///
/// Either side closing closes the peer; the relay also ends after
/// `idle_timeout` with no traffic in either direction.
pub async fn relay_to_upstream(
    client_socket: WebSocket,
    target_url: String,
    idle_timeout: Duration,
) -> anyhow::Result<()> {
    debug!("relaying websocket to {target_url}");

    let (mut client_tx, mut client_rx) = client_socket.split();

    // Buffer client frames while the upstream dials.
    let mut pending: Vec<TungsteniteMessage> = Vec::new();
    let connect = connect_async(&target_url);
    tokio::pin!(connect);

    let server_socket = loop {
        tokio::select! {
            connected = &mut connect => {
                match connected {
                    Ok((socket, _)) => break socket,
                    Err(err) => {
                        let _ = client_tx.send(AxumMessage::Close(None)).await;
                        return Err(anyhow::anyhow!("upstream connect failed: {err}"));
                    }
                }
            }
            msg = client_rx.next() => {
                match msg {
                    Some(Ok(AxumMessage::Close(_))) | None => {
                        debug!("client left before upstream connected");
                        return Ok(());
                    }
                    Some(Ok(msg)) => {
                        if let Some(frame) = to_upstream(msg) {
                            pending.push(frame);
                        }
                    }
                    Some(Err(err)) => {
                        return Err(anyhow::anyhow!("client socket error: {err}"));
                    }
                }
            }
        }
    };

    let (mut server_tx, mut server_rx) = server_socket.split();

    // Flush everything the client sent while we were dialing, in order.
    for frame in pending.drain(..) {
        server_tx.send(frame).await?;
    }

    loop {
        tokio::select! {
            msg = client_rx.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        let is_close = matches!(msg, AxumMessage::Close(_));
                        if let Some(frame) = to_upstream(msg) {
                            server_tx.send(frame).await?;
                        }
                        if is_close {
                            return Ok(());
                        }
                    }
                    Some(Err(err)) => {
                        let _ = server_tx.send(TungsteniteMessage::Close(None)).await;
                        return Err(anyhow::anyhow!("client socket error: {err}"));
                    }
                    None => {
                        let _ = server_tx.send(TungsteniteMessage::Close(None)).await;
                        return Ok(());
                    }
                }
            }
            msg = server_rx.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        let is_close = matches!(msg, TungsteniteMessage::Close(_));
                        if let Some(frame) = to_client(msg) {
                            client_tx.send(frame).await?;
                        }
                        if is_close {
                            return Ok(());
                        }
                    }
                    Some(Err(err)) => {
                        let _ = client_tx.send(AxumMessage::Close(None)).await;
                        return Err(anyhow::anyhow!("upstream socket error: {err}"));
                    }
                    None => {
                        let _ = client_tx.send(AxumMessage::Close(None)).await;
                        return Ok(());
                    }
                }
            }
            _ = tokio::time::sleep(idle_timeout) => {
                debug!("websocket relay idle timeout");
                let _ = server_tx.send(TungsteniteMessage::Close(None)).await;
                let _ = client_tx.send(AxumMessage::Close(None)).await;
                return Ok(());
            }
        }
    }
}
