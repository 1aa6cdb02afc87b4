//! Sandbox provider interface.
//!
//! The core drives containers, per-session networks, and shared volumes
//! through [`SandboxProvider`]; the default implementation shells out to a
//! Docker-compatible CLI. Everything above this module is provider-agnostic.

mod docker;
mod error;

pub use docker::DockerCli;
pub use error::{ProviderError, ProviderErrorCode, ProviderResult};

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Label keys the orchestrator stamps onto every container it creates.
pub const LABEL_SESSION: &str = "lab.session";
pub const LABEL_PROJECT: &str = "lab.project";
pub const LABEL_CONTAINER: &str = "lab.container";

/// Specification for a container to be created.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub hostname: Option<String>,
    pub labels: HashMap<String, String>,
    pub env: HashMap<String, String>,
    /// Volume bindings (volume name or host path -> container path).
    pub binds: Vec<(String, String)>,
    pub workdir: Option<String>,
    /// Network to attach at creation time.
    pub network: Option<String>,
    /// Restart attempts for the `on-failure` policy; 0 disables restarts.
    pub restart_max_retries: u32,
    pub command: Vec<String>,
}

/// Observed container state from `inspect`.
#[derive(Debug, Clone)]
pub struct ContainerInspect {
    /// Provider state string (`running`, `exited`, ...).
    pub state: String,
    /// Declared container ports and their host mappings, when published.
    pub ports: HashMap<u16, Option<u16>>,
}

/// A normalized provider event.
#[derive(Debug, Clone)]
pub struct ProviderEvent {
    /// Provider action (`start`, `die`, `oom`, `health_status: unhealthy`, ...).
    pub action: String,
    /// Runtime id of the container the event concerns.
    pub runtime_id: String,
    /// Actor attributes (labels, name, image).
    pub attributes: HashMap<String, String>,
}

/// Sandbox provider abstraction.
///
/// All operations fail with [`ProviderError`] and are capped at the provider
/// call deadline; callers translate to domain errors at the boundary.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn create_container(&self, spec: &ContainerSpec) -> ProviderResult<String>;
    async fn start_container(&self, runtime_id: &str) -> ProviderResult<()>;
    async fn stop_container(&self, runtime_id: &str) -> ProviderResult<()>;
    async fn remove_container(&self, runtime_id: &str, force: bool) -> ProviderResult<()>;
    async fn inspect(&self, runtime_id: &str) -> ProviderResult<Option<ContainerInspect>>;
    async fn container_exists(&self, runtime_id: &str) -> ProviderResult<bool>;

    async fn create_network(&self, name: &str) -> ProviderResult<()>;
    async fn remove_network(&self, name: &str) -> ProviderResult<()>;
    async fn connect(
        &self,
        runtime_id: &str,
        network: &str,
        aliases: &[String],
    ) -> ProviderResult<()>;
    async fn disconnect(&self, runtime_id: &str, network: &str) -> ProviderResult<()>;
    async fn is_connected(&self, runtime_id: &str, network: &str) -> ProviderResult<bool>;

    async fn create_volume(&self, name: &str) -> ProviderResult<()>;
    async fn remove_volume(&self, name: &str) -> ProviderResult<()>;

    /// Stream provider events for containers carrying the given label key.
    ///
    /// The stream ends when the provider connection drops; callers reconnect
    /// with backoff. Dropping the receiver tears the stream down.
    async fn stream_events(
        &self,
        label_filter: &str,
    ) -> ProviderResult<mpsc::Receiver<ProviderEvent>>;

    /// Probe the provider; returns its version string.
    async fn health_check(&self) -> ProviderResult<String>;
}

/// Validate a container ID or name before splicing it into provider argv.
///
/// IDs are hex strings; names are alphanumeric with `-` and `_`.
pub(crate) fn validate_runtime_ref(id: &str) -> ProviderResult<()> {
    if id.is_empty() {
        return Err(ProviderError::invalid_input(
            "container ID or name cannot be empty",
        ));
    }
    if id.len() > 128 {
        return Err(ProviderError::invalid_input(
            "container ID or name exceeds maximum length",
        ));
    }
    let valid = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.';
    if !id.chars().all(valid) {
        return Err(ProviderError::invalid_input(format!(
            "container ID or name '{id}' contains invalid characters"
        )));
    }
    Ok(())
}

/// Validate an image reference (registry/name:tag or digest form).
pub(crate) fn validate_image_name(image: &str) -> ProviderResult<()> {
    if image.is_empty() {
        return Err(ProviderError::invalid_input("image name cannot be empty"));
    }
    if image.len() > 256 {
        return Err(ProviderError::invalid_input(
            "image name exceeds maximum length",
        ));
    }
    let valid = |c: char| {
        c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '@')
    };
    if !image.chars().all(valid) || image.starts_with('-') {
        return Err(ProviderError::invalid_input(format!(
            "image name '{image}' contains invalid characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_ref_validation() {
        assert!(validate_runtime_ref("abc123def456").is_ok());
        assert!(validate_runtime_ref("lab-s-1234abcd-web").is_ok());
        assert!(validate_runtime_ref("").is_err());
        assert!(validate_runtime_ref("bad name").is_err());
        assert!(validate_runtime_ref("in;jection").is_err());
    }

    #[test]
    fn image_name_validation() {
        assert!(validate_image_name("nginx:1.27").is_ok());
        assert!(validate_image_name("ghcr.io/lab/agent:latest").is_ok());
        assert!(validate_image_name("img@sha256:abcd").is_ok());
        assert!(validate_image_name("").is_err());
        assert!(validate_image_name("-rm").is_err());
        assert!(validate_image_name("evil image").is_err());
    }
}
