//! API error handling.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

use crate::error::LabError;

/// API error type with JSON `{error}` responses.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("{0}")]
    ServiceUnavailable(String),

    #[error("{0}")]
    BadGateway(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::BadGateway(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.to_string();

        match &self {
            ApiError::Internal(msg) | ApiError::BadGateway(msg) => {
                error!(status = %status, "{msg}");
            }
            ApiError::ServiceUnavailable(msg) => {
                warn!(status = %status, "{msg}");
            }
            _ => {
                tracing::debug!(status = %status, "{message}");
            }
        }

        (status, Json(ErrorBody { error: message })).into_response()
    }
}

impl From<LabError> for ApiError {
    fn from(err: LabError) -> Self {
        let message = err.to_string();
        match err {
            LabError::SessionNotFound { .. } => ApiError::NotFound(message),
            LabError::NoContainerDefinitions { .. } | LabError::InvalidSubdomain { .. } => {
                ApiError::BadRequest(message)
            }
            LabError::Unauthorized => ApiError::Unauthorized,
            LabError::NoPortsAvailable { .. } => ApiError::ServiceUnavailable(message),
            LabError::Provider(_)
            | LabError::DaemonStartFailed { .. }
            | LabError::DaemonStopFailed { .. }
            | LabError::NavigationFailed { .. }
            | LabError::ConnectionFailed { .. }
            | LabError::UpstreamTimeout => ApiError::BadGateway(message),
            LabError::InvalidResponse { .. } => ApiError::Internal(message),
        }
    }
}

/// Anyhow chains carry domain errors out of the services; surface those,
/// and fall back to message sniffing for plain context errors.
impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(domain) = err.downcast_ref::<LabError>() {
            let message = domain.to_string();
            return match domain {
                LabError::SessionNotFound { .. } => ApiError::NotFound(message),
                LabError::NoContainerDefinitions { .. } => ApiError::BadRequest(message),
                LabError::Unauthorized => ApiError::Unauthorized,
                LabError::NoPortsAvailable { .. } => ApiError::ServiceUnavailable(message),
                _ => ApiError::BadGateway(message),
            };
        }

        let message = format!("{err:#}");
        let lower = message.to_lowercase();
        if lower.contains("not found") {
            ApiError::NotFound(message)
        } else if lower.contains("invalid") || lower.contains("must be") {
            ApiError::BadRequest(message)
        } else {
            ApiError::Internal(message)
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
