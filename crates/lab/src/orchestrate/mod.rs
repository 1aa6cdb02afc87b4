//! Orchestration requests: free-form user intents that resolve into
//! sessions.
//!
//! A client may post a message before any session exists; the request is
//! accepted immediately and works through `pending -> thinking ->
//! delegating -> starting -> complete`, publishing each transition on its
//! status channel so optimistic UI items can re-key onto the canonical
//! session id.

mod service;

pub use service::{OrchestrationAccepted, OrchestrationService};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

use lab_protocol::views::OrchestrationStatusView;

/// Request lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestrationStatus {
    Pending,
    Thinking,
    Delegating,
    Starting,
    Complete,
    Error,
}

impl std::fmt::Display for OrchestrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrchestrationStatus::Pending => write!(f, "pending"),
            OrchestrationStatus::Thinking => write!(f, "thinking"),
            OrchestrationStatus::Delegating => write!(f, "delegating"),
            OrchestrationStatus::Starting => write!(f, "starting"),
            OrchestrationStatus::Complete => write!(f, "complete"),
            OrchestrationStatus::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for OrchestrationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OrchestrationStatus::Pending),
            "thinking" => Ok(OrchestrationStatus::Thinking),
            "delegating" => Ok(OrchestrationStatus::Delegating),
            "starting" => Ok(OrchestrationStatus::Starting),
            "complete" => Ok(OrchestrationStatus::Complete),
            "error" => Ok(OrchestrationStatus::Error),
            other => Err(format!("unknown orchestration status: {other}")),
        }
    }
}

impl TryFrom<String> for OrchestrationStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

/// A persisted orchestration request.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct OrchestrationRequest {
    pub id: String,
    pub channel_id: Option<String>,
    pub content: String,
    #[sqlx(try_from = "String")]
    pub status: OrchestrationStatus,
    pub resolved_project_id: Option<String>,
    pub resolved_session_id: Option<String>,
    pub model_id: Option<String>,
    pub error_message: Option<String>,
}

impl OrchestrationRequest {
    pub fn status_view(&self, project_name: Option<String>) -> OrchestrationStatusView {
        OrchestrationStatusView {
            status: self.status.to_string(),
            project_name,
            session_id: self.resolved_session_id.clone(),
            error_message: self.error_message.clone(),
        }
    }
}

/// Repository for `orchestration_requests`.
#[derive(Debug, Clone)]
pub struct OrchestrationRepository {
    pool: SqlitePool,
}

const COLUMNS: &str = "id, channel_id, content, status, resolved_project_id, \
                       resolved_session_id, model_id, error_message";

impl OrchestrationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        content: &str,
        channel_id: Option<&str>,
        model_id: Option<&str>,
    ) -> Result<OrchestrationRequest> {
        let request = OrchestrationRequest {
            id: Uuid::new_v4().to_string(),
            channel_id: channel_id.map(str::to_string),
            content: content.to_string(),
            status: OrchestrationStatus::Pending,
            resolved_project_id: None,
            resolved_session_id: None,
            model_id: model_id.map(str::to_string),
            error_message: None,
        };

        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO orchestration_requests
                (id, channel_id, content, status, resolved_project_id, resolved_session_id,
                 model_id, error_message, created_at, updated_at)
            VALUES (?, ?, ?, ?, NULL, NULL, ?, NULL, ?, ?)
            "#,
        )
        .bind(&request.id)
        .bind(&request.channel_id)
        .bind(&request.content)
        .bind(request.status.to_string())
        .bind(&request.model_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("creating orchestration request")?;

        Ok(request)
    }

    pub async fn get(&self, id: &str) -> Result<Option<OrchestrationRequest>> {
        let request = sqlx::query_as::<_, OrchestrationRequest>(&format!(
            "SELECT {COLUMNS} FROM orchestration_requests WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching orchestration request")?;

        Ok(request)
    }

    pub async fn set_status(&self, id: &str, status: OrchestrationStatus) -> Result<()> {
        sqlx::query("UPDATE orchestration_requests SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating orchestration status")?;

        Ok(())
    }

    pub async fn set_resolution(
        &self,
        id: &str,
        project_id: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE orchestration_requests
            SET resolved_project_id = COALESCE(?, resolved_project_id),
                resolved_session_id = COALESCE(?, resolved_session_id),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(project_id)
        .bind(session_id)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("updating orchestration resolution")?;

        Ok(())
    }

    pub async fn set_error(&self, id: &str, message: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE orchestration_requests
            SET status = 'error', error_message = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(message)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("recording orchestration error")?;

        Ok(())
    }
}
