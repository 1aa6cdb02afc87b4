//! Wire types for the lab multiplayer channel bus.
//!
//! This crate defines the message formats that cross the WebSocket boundary
//! between the server and web clients:
//!
//! ```text
//! Client <--[WS: subscribe/unsubscribe/event/ping]--> Channel Bus
//! Client <--[WS: snapshot/delta/event/error/pong]---- Channel Bus
//! ```
//!
//! ## Design Principles
//!
//! 1. **The channel set is closed.** Every channel a client can subscribe to
//!    is a [`channels::Channel`] variant; there are no dynamic channel names.
//! 2. **Snapshot first, deltas after.** A subscriber always receives exactly
//!    one snapshot for a channel before any delta on it.
//! 3. **Deltas are self-describing.** Array channels use add/remove/update/
//!    append records keyed by `id`; object channels use shallow-merge patches.

pub mod channels;
pub mod deltas;
pub mod messages;
pub mod views;

pub use channels::Channel;
pub use deltas::{apply_list_delta, apply_patch, ListDelta, Patch};
pub use messages::{ClientMessage, ServerMessage};
