//! Session data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use lab_protocol::views::{SessionContainerView, SessionSummary};

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Containers are being provisioned.
    Creating,
    /// Warm and claimable; no user messages yet.
    Pooled,
    /// Cluster is up and serving.
    Running,
    /// Teardown in progress.
    Deleting,
    /// Provisioning failed.
    Error,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Creating => write!(f, "creating"),
            SessionStatus::Pooled => write!(f, "pooled"),
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::Deleting => write!(f, "deleting"),
            SessionStatus::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creating" => Ok(SessionStatus::Creating),
            "pooled" => Ok(SessionStatus::Pooled),
            "running" => Ok(SessionStatus::Running),
            "deleting" => Ok(SessionStatus::Deleting),
            "error" => Ok(SessionStatus::Error),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

impl TryFrom<String> for SessionStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

/// A session row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub project_id: String,
    pub title: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: SessionStatus,
    pub agent_session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Name of this session's dedicated network.
    pub fn network_name(&self) -> String {
        network_name(&self.id)
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            project_id: self.project_id.clone(),
            title: self.title.clone(),
            status: self.status.to_string(),
            agent_session_id: self.agent_session_id.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Name of the dedicated network for a session id.
pub fn network_name(session_id: &str) -> String {
    format!("lab-{session_id}")
}

/// Status of one container within a session's cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Starting,
    Running,
    Stopped,
    Error,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerStatus::Starting => write!(f, "starting"),
            ContainerStatus::Running => write!(f, "running"),
            ContainerStatus::Stopped => write!(f, "stopped"),
            ContainerStatus::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for ContainerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(ContainerStatus::Starting),
            "running" => Ok(ContainerStatus::Running),
            "stopped" => Ok(ContainerStatus::Stopped),
            "error" => Ok(ContainerStatus::Error),
            other => Err(format!("unknown container status: {other}")),
        }
    }
}

impl TryFrom<String> for ContainerStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

/// A container row within a session.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct SessionContainer {
    pub id: String,
    pub session_id: String,
    /// The container definition this instance was created from.
    pub container_id: String,
    pub runtime_id: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: ContainerStatus,
    pub hostname: String,
    pub error_message: Option<String>,
}

impl SessionContainer {
    pub fn view(&self) -> SessionContainerView {
        SessionContainerView {
            id: self.id.clone(),
            session_id: self.session_id.clone(),
            container_id: self.container_id.clone(),
            runtime_id: self.runtime_id.clone(),
            status: self.status.to_string(),
            hostname: self.hostname.clone(),
            error_message: self.error_message.clone(),
            urls: Default::default(),
        }
    }
}

/// Compute the stable hostname for a session container:
/// `s-<first 8 of session id>-<first 8 of definition id>`.
pub fn container_hostname(session_id: &str, definition_id: &str) -> String {
    let sess8: String = session_id.chars().filter(|c| *c != '-').take(8).collect();
    let def8: String = definition_id.chars().filter(|c| *c != '-').take(8).collect();
    format!("s-{sess8}-{def8}")
}

/// Request body for spawning a session.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnRequest {
    pub project_id: String,
    #[serde(default, alias = "taskSummary")]
    pub title: Option<String>,
    #[serde(default)]
    pub initial_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostname_uses_eight_chars_of_each_id() {
        let hostname = container_hostname(
            "123e4567-e89b-42d3-a456-426614174000",
            "fedcba98-1111-4222-8333-000000000000",
        );
        assert_eq!(hostname, "s-123e4567-fedcba98");
    }

    #[test]
    fn status_roundtrips() {
        for status in ["creating", "pooled", "running", "deleting", "error"] {
            let parsed: SessionStatus = status.parse().unwrap();
            assert_eq!(parsed.to_string(), status);
        }
    }
}
