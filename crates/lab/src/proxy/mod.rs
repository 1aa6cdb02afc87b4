//! Subdomain reverse proxy.
//!
//! A single listener accepts all `<session>--<port>.<base-domain>` traffic,
//! resolves the upstream through the route table, and forwards HTTP and
//! WebSocket connections into session networks.

mod router;
mod server;
mod websocket;

pub use router::{parse_subdomain_host, ClusterContainer, ProxyRouter, RouteInfo, Upstream};
pub use server::{proxy_app, ProxyContext};
