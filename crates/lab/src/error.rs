//! Domain error kinds shared across the subsystem.

use thiserror::Error;

use crate::ports::PortKind;
use crate::sandbox::ProviderError;

/// Errors the lifecycle subsystem surfaces across component boundaries.
///
/// Each variant carries the identifiers a caller needs to act on it; HTTP
/// translation lives in `api::error`, channel surfacing in the emitters.
#[derive(Debug, Error)]
pub enum LabError {
    #[error("no {kind} ports available in the configured range")]
    NoPortsAvailable { kind: PortKind },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("failed to start browser daemon for session {session_id}: {detail}")]
    DaemonStartFailed { session_id: String, detail: String },

    #[error("failed to stop browser daemon for session {session_id}: {detail}")]
    DaemonStopFailed { session_id: String, detail: String },

    #[error("navigation to {url} failed for session {session_id}: {detail}")]
    NavigationFailed {
        session_id: String,
        url: String,
        detail: String,
    },

    #[error("browser daemon connection failed for session {session_id}: {detail}")]
    ConnectionFailed { session_id: String, detail: String },

    #[error("invalid response: {detail}")]
    InvalidResponse { detail: String },

    #[error("project {project_id} has no container definitions")]
    NoContainerDefinitions { project_id: String },

    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("unauthorized")]
    Unauthorized,

    #[error("invalid subdomain: {host}")]
    InvalidSubdomain { host: String },

    #[error("upstream timed out")]
    UpstreamTimeout,
}

impl LabError {
    pub fn connection_failed(session_id: impl Into<String>, detail: impl Into<String>) -> Self {
        LabError::ConnectionFailed {
            session_id: session_id.into(),
            detail: detail.into(),
        }
    }

    pub fn session_not_found(session_id: impl Into<String>) -> Self {
        LabError::SessionNotFound {
            session_id: session_id.into(),
        }
    }
}

pub type LabResult<T> = Result<T, LabError>;
