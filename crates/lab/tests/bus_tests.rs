//! Channel bus protocol tests over a live WebSocket.

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

mod common;
use common::{seed_project, test_app};

struct WsClient {
    stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
}

impl WsClient {
    async fn connect(addr: &str) -> Self {
        let (stream, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .expect("ws connect");
        Self { stream }
    }

    async fn send(&mut self, message: Value) {
        self.stream
            .send(Message::Text(message.to_string().into()))
            .await
            .expect("ws send");
    }

    async fn recv(&mut self) -> Value {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), self.stream.next())
                .await
                .expect("ws recv timeout")
                .expect("ws closed")
                .expect("ws error");
            match message {
                Message::Text(text) => return serde_json::from_str(&text).expect("ws json"),
                Message::Ping(_) | Message::Pong(_) => continue,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }
}

async fn serve(app: &common::TestApp) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let router = app.router.clone();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn subscribe_receives_snapshot_before_deltas() {
    let app = test_app().await;
    let addr = serve(&app).await;
    let mut client = WsClient::connect(&addr).await;

    client
        .send(json!({"type": "subscribe", "channel": "sessions"}))
        .await;
    let snapshot = client.recv().await;
    assert_eq!(snapshot["type"], "snapshot");
    assert_eq!(snapshot["channel"], "sessions");
    assert_eq!(snapshot["data"], json!([]));

    // A session spawned after the snapshot arrives as a delta.
    let project_id = seed_project(&app, "demo", 0, &[3000]).await;
    app.sessions
        .spawn_session(lab::session::SpawnRequest {
            project_id,
            title: Some("task".to_string()),
            initial_message: None,
        })
        .await
        .unwrap();

    let delta = client.recv().await;
    assert_eq!(delta["type"], "delta");
    assert_eq!(delta["channel"], "sessions");
    assert_eq!(delta["data"]["type"], "add");
    assert_eq!(delta["data"]["title"], "task");
}

#[tokio::test]
async fn ping_pong() {
    let app = test_app().await;
    let addr = serve(&app).await;
    let mut client = WsClient::connect(&addr).await;

    client.send(json!({"type": "ping"})).await;
    let reply = client.recv().await;
    assert_eq!(reply["type"], "pong");
}

#[tokio::test]
async fn unknown_channel_yields_error() {
    let app = test_app().await;
    let addr = serve(&app).await;
    let mut client = WsClient::connect(&addr).await;

    client
        .send(json!({"type": "subscribe", "channel": "mystery"}))
        .await;
    let reply = client.recv().await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["error"], "Unknown channel");
}

#[tokio::test]
async fn events_require_subscription() {
    let app = test_app().await;
    let addr = serve(&app).await;
    let mut client = WsClient::connect(&addr).await;

    client
        .send(json!({
            "type": "event",
            "channel": "sessionTyping/some-session",
            "data": {"type": "set_typing", "user_id": "u1", "typing": true},
        }))
        .await;
    let reply = client.recv().await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["error"], "Not subscribed");
}

#[tokio::test]
async fn typing_events_fan_out_to_subscribers() {
    let app = test_app().await;
    let addr = serve(&app).await;

    let mut sender = WsClient::connect(&addr).await;
    let mut watcher = WsClient::connect(&addr).await;

    for client in [&mut sender, &mut watcher] {
        client
            .send(json!({"type": "subscribe", "channel": "sessionTyping/s1"}))
            .await;
        let snapshot = client.recv().await;
        assert_eq!(snapshot["type"], "snapshot");
        assert_eq!(snapshot["data"], json!([]));
    }

    sender
        .send(json!({
            "type": "event",
            "channel": "sessionTyping/s1",
            "data": {"type": "set_typing", "user_id": "alice", "typing": true},
        }))
        .await;

    let event = watcher.recv().await;
    assert_eq!(event["type"], "event");
    assert_eq!(event["channel"], "sessionTyping/s1");
    assert_eq!(event["data"], json!(["alice"]));
}

#[tokio::test]
async fn malformed_messages_are_ignored() {
    let app = test_app().await;
    let addr = serve(&app).await;
    let mut client = WsClient::connect(&addr).await;

    client
        .stream
        .send(Message::Text("not json at all".to_string().into()))
        .await
        .unwrap();

    // The socket stays healthy.
    client.send(json!({"type": "ping"})).await;
    let reply = client.recv().await;
    assert_eq!(reply["type"], "pong");
}
