//! Sandbox provider error types.

use thiserror::Error;

/// Result type for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Machine-readable category of a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorCode {
    /// The provider command exited non-zero.
    CommandFailed,
    /// The referenced container/network/volume does not exist.
    NotFound,
    /// Provider output could not be parsed.
    ParseError,
    /// A name or argument failed validation before reaching the provider.
    InvalidInput,
    /// The provider binary is missing or unreachable.
    Unavailable,
    /// The call exceeded the hard cap.
    Timeout,
}

impl std::fmt::Display for ProviderErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProviderErrorCode::CommandFailed => "command_failed",
            ProviderErrorCode::NotFound => "not_found",
            ProviderErrorCode::ParseError => "parse_error",
            ProviderErrorCode::InvalidInput => "invalid_input",
            ProviderErrorCode::Unavailable => "unavailable",
            ProviderErrorCode::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// An error from the sandbox provider boundary.
#[derive(Debug, Error)]
#[error("provider error ({code}): {message}")]
pub struct ProviderError {
    pub code: ProviderErrorCode,
    pub message: String,
}

impl ProviderError {
    pub fn new(code: ProviderErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn command_failed(command: &str, message: impl std::fmt::Display) -> Self {
        Self::new(
            ProviderErrorCode::CommandFailed,
            format!("{command}: {message}"),
        )
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorCode::InvalidInput, message)
    }

    pub fn parse(message: impl std::fmt::Display) -> Self {
        Self::new(ProviderErrorCode::ParseError, message.to_string())
    }

    pub fn timeout(command: &str) -> Self {
        Self::new(
            ProviderErrorCode::Timeout,
            format!("{command} exceeded the provider call deadline"),
        )
    }

    pub fn is_not_found(&self) -> bool {
        self.code == ProviderErrorCode::NotFound
    }
}
