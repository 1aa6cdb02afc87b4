//! Fan-out core of the channel bus.
//!
//! The hub tracks which sockets are subscribed to which resolved channel
//! paths and broadcasts deltas/events to exact-path matches. Sends never
//! block publishers: each socket has a bounded queue and overflow drops the
//! message with a warning.

use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::warn;

use lab_protocol::{Channel, ListDelta, Patch, ServerMessage};

/// Maximum messages queued to a slow subscriber before drops begin.
pub const SEND_BUFFER_SIZE: usize = 1024;

pub type SocketId = u64;

#[derive(Clone)]
struct Subscriber {
    socket_id: SocketId,
    tx: mpsc::Sender<ServerMessage>,
}

/// The process-wide pub/sub hub.
pub struct ChannelBus {
    next_socket_id: AtomicU64,
    /// Resolved path -> subscribers.
    subscriptions: DashMap<String, Vec<Subscriber>>,
    /// Socket -> paths, for close-time cleanup.
    sockets: DashMap<SocketId, (mpsc::Sender<ServerMessage>, Vec<String>)>,
}

impl ChannelBus {
    pub fn new() -> Self {
        Self {
            next_socket_id: AtomicU64::new(1),
            subscriptions: DashMap::new(),
            sockets: DashMap::new(),
        }
    }

    /// Register a socket; the returned receiver is the socket's send queue.
    pub fn register_socket(&self) -> (SocketId, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(SEND_BUFFER_SIZE);
        let socket_id = self.next_socket_id.fetch_add(1, Ordering::Relaxed);
        self.sockets.insert(socket_id, (tx, Vec::new()));
        (socket_id, rx)
    }

    /// Queue a message directly to one socket.
    pub fn send_to_socket(&self, socket_id: SocketId, message: ServerMessage) {
        if let Some(entry) = self.sockets.get(&socket_id) {
            if entry.0.try_send(message).is_err() {
                warn!(socket_id, "dropping message to slow or closed socket");
            }
        }
    }

    /// Record a subscription. Returns false when already subscribed.
    pub fn subscribe(&self, socket_id: SocketId, channel: &Channel) -> bool {
        let Some(mut socket) = self.sockets.get_mut(&socket_id) else {
            return false;
        };
        let path = channel.path();
        if socket.1.contains(&path) {
            return false;
        }
        let tx = socket.0.clone();
        socket.1.push(path.clone());
        drop(socket);

        self.subscriptions
            .entry(path)
            .or_default()
            .push(Subscriber { socket_id, tx });
        true
    }

    /// Remove a subscription. Returns true when it existed.
    pub fn unsubscribe(&self, socket_id: SocketId, channel: &Channel) -> bool {
        let path = channel.path();
        let existed = match self.sockets.get_mut(&socket_id) {
            Some(mut socket) => {
                let before = socket.1.len();
                socket.1.retain(|p| p != &path);
                socket.1.len() != before
            }
            None => false,
        };
        if existed {
            self.remove_subscriber(&path, socket_id);
        }
        existed
    }

    /// Drop a socket entirely, returning the channels it was subscribed to
    /// so callers can fire last-unsubscribe hooks.
    pub fn remove_socket(&self, socket_id: SocketId) -> Vec<Channel> {
        let Some((_, (_, paths))) = self.sockets.remove(&socket_id) else {
            return Vec::new();
        };
        let mut channels = Vec::with_capacity(paths.len());
        for path in paths {
            self.remove_subscriber(&path, socket_id);
            if let Some(channel) = Channel::parse(&path) {
                channels.push(channel);
            }
        }
        channels
    }

    fn remove_subscriber(&self, path: &str, socket_id: SocketId) {
        if let Some(mut subscribers) = self.subscriptions.get_mut(path) {
            subscribers.retain(|s| s.socket_id != socket_id);
        }
        self.subscriptions
            .retain(|_, subscribers| !subscribers.is_empty());
    }

    pub fn is_subscribed(&self, socket_id: SocketId, channel: &Channel) -> bool {
        self.sockets
            .get(&socket_id)
            .map(|socket| socket.1.contains(&channel.path()))
            .unwrap_or(false)
    }

    pub fn subscriber_count(&self, channel: &Channel) -> usize {
        self.subscriptions
            .get(&channel.path())
            .map(|subscribers| subscribers.len())
            .unwrap_or(0)
    }

    /// Broadcast a raw delta to every subscriber of the exact path.
    pub fn publish_delta(&self, channel: &Channel, data: Value) {
        self.broadcast(channel, |path| ServerMessage::Delta {
            channel: path,
            data: data.clone(),
        });
    }

    /// Broadcast a list delta (array channels).
    pub fn publish_list_delta(&self, channel: &Channel, delta: &ListDelta) {
        match serde_json::to_value(delta) {
            Ok(data) => self.publish_delta(channel, data),
            Err(err) => warn!(%channel, "failed to serialize delta: {err}"),
        }
    }

    /// Broadcast a patch (object channels).
    pub fn publish_patch(&self, channel: &Channel, patch: &Patch) {
        match serde_json::to_value(patch) {
            Ok(data) => self.publish_delta(channel, data),
            Err(err) => warn!(%channel, "failed to serialize patch: {err}"),
        }
    }

    /// Broadcast a server event.
    pub fn publish_event(&self, channel: &Channel, data: Value) {
        self.broadcast(channel, |path| ServerMessage::Event {
            channel: path,
            data: data.clone(),
        });
    }

    fn broadcast(&self, channel: &Channel, make: impl Fn(String) -> ServerMessage) {
        let path = channel.path();
        let Some(subscribers) = self.subscriptions.get(&path) else {
            return;
        };
        for subscriber in subscribers.iter() {
            if subscriber.tx.try_send(make(path.clone())).is_err() {
                warn!(
                    socket_id = subscriber.socket_id,
                    channel = %path,
                    "dropping channel message to slow subscriber"
                );
            }
        }
    }
}

impl Default for ChannelBus {
    fn default() -> Self {
        Self::new()
    }
}
