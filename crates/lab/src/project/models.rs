//! Project data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A user-managed project: the template sessions are provisioned from.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub system_prompt: Option<String>,
    /// Number of warm pooled sessions to keep available.
    pub pool_size: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One container the project's sessions run.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ContainerDefinition {
    pub id: String,
    pub project_id: String,
    pub image: String,
    /// JSON object of env vars; values may use `{{SESSION_ID}}` and
    /// `{{PROJECT_ID}}` placeholders.
    pub env_template: Option<String>,
    pub hostname: Option<String>,
}

/// A port a container definition declares.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, FromRow)]
pub struct ContainerPort {
    pub port: i64,
    #[sqlx(skip)]
    #[serde(default)]
    pub protocol: Protocol,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

/// A project together with its definitions and their declared ports.
#[derive(Debug, Clone)]
pub struct ProjectWithDefinitions {
    pub project: Project,
    pub definitions: Vec<(ContainerDefinition, Vec<u16>)>,
}
