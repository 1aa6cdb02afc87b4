//! The multiplayer channel bus: typed pub/sub over one WebSocket endpoint.

mod handler;
mod hub;
mod live;
mod snapshots;

pub use handler::ws_handler;
pub use hub::{ChannelBus, SocketId, SEND_BUFFER_SIZE};
pub use live::LiveStores;
pub use snapshots::SnapshotLoaders;
