//! Session lifecycle: spawn, pool, and teardown of container clusters.

mod models;
mod repository;
mod service;

pub use models::{
    container_hostname, network_name, ContainerStatus, Session, SessionContainer, SessionStatus,
    SpawnRequest,
};
pub use repository::SessionRepository;
pub use service::{SessionService, SessionWithContainers};
