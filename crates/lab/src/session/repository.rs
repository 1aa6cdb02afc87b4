//! Session database repository.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use super::models::{ContainerStatus, Session, SessionContainer, SessionStatus};

const SESSION_COLUMNS: &str =
    "id, project_id, title, status, agent_session_id, created_at, updated_at";

const CONTAINER_COLUMNS: &str =
    "id, session_id, container_id, runtime_id, status, hostname, error_message";

/// Repository for sessions and their containers.
#[derive(Debug, Clone)]
pub struct SessionRepository {
    pool: SqlitePool,
}

impl SessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        project_id: &str,
        title: Option<&str>,
        status: SessionStatus,
    ) -> Result<Session> {
        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            title: title.map(str::to_string),
            status,
            agent_session_id: None,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO sessions (id, project_id, title, status, agent_session_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, NULL, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(&session.project_id)
        .bind(&session.title)
        .bind(session.status.to_string())
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&self.pool)
        .await
        .context("creating session")?;

        Ok(session)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Session>> {
        let session = sqlx::query_as::<_, Session>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching session")?;

        Ok(session)
    }

    /// List sessions visible to clients (pooled spares are internal).
    pub async fn list_visible(&self) -> Result<Vec<Session>> {
        let sessions = sqlx::query_as::<_, Session>(&format!(
            r#"
            SELECT {SESSION_COLUMNS} FROM sessions
            WHERE status != 'pooled'
            ORDER BY created_at DESC
            "#
        ))
        .fetch_all(&self.pool)
        .await
        .context("listing sessions")?;

        Ok(sessions)
    }

    pub async fn list_with_status(&self, status: SessionStatus) -> Result<Vec<Session>> {
        let sessions = sqlx::query_as::<_, Session>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE status = ? ORDER BY created_at ASC"
        ))
        .bind(status.to_string())
        .fetch_all(&self.pool)
        .await
        .context("listing sessions by status")?;

        Ok(sessions)
    }

    pub async fn update_status(&self, id: &str, status: SessionStatus) -> Result<()> {
        sqlx::query("UPDATE sessions SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating session status")?;

        Ok(())
    }

    pub async fn update_title(&self, id: &str, title: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE sessions SET title = ?, updated_at = ? WHERE id = ?")
            .bind(title)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating session title")?;

        Ok(())
    }

    pub async fn update_agent_session_id(&self, id: &str, agent_session_id: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET agent_session_id = ?, updated_at = ? WHERE id = ?")
            .bind(agent_session_id)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating agent session id")?;

        Ok(())
    }

    /// Claim the oldest pooled session for a project in one compare-and-set.
    ///
    /// Returns `None` when the pool is empty. The single UPDATE makes
    /// concurrent claimers take distinct sessions.
    pub async fn claim_pooled(&self, project_id: &str, title: Option<&str>) -> Result<Option<Session>> {
        let session = sqlx::query_as::<_, Session>(&format!(
            r#"
            UPDATE sessions
            SET status = 'running', title = ?, updated_at = ?
            WHERE id = (
                SELECT id FROM sessions
                WHERE project_id = ? AND status = 'pooled'
                ORDER BY created_at ASC
                LIMIT 1
            )
            RETURNING {SESSION_COLUMNS}
            "#
        ))
        .bind(title)
        .bind(Utc::now())
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await
        .context("claiming pooled session")?;

        Ok(session)
    }

    pub async fn count_pooled(&self, project_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sessions WHERE project_id = ? AND status = 'pooled'",
        )
        .bind(project_id)
        .fetch_one(&self.pool)
        .await
        .context("counting pooled sessions")?;

        Ok(count)
    }

    /// Delete the session row; ownership cascades to containers,
    /// reservations, events, and browser state.
    pub async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("deleting session")?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Session containers
    // ------------------------------------------------------------------

    pub async fn insert_container(
        &self,
        session_id: &str,
        definition_id: &str,
        hostname: &str,
    ) -> Result<SessionContainer> {
        let container = SessionContainer {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            container_id: definition_id.to_string(),
            runtime_id: None,
            status: ContainerStatus::Starting,
            hostname: hostname.to_string(),
            error_message: None,
        };

        sqlx::query(
            r#"
            INSERT INTO session_containers (id, session_id, container_id, runtime_id, status, hostname, error_message)
            VALUES (?, ?, ?, NULL, ?, ?, NULL)
            "#,
        )
        .bind(&container.id)
        .bind(&container.session_id)
        .bind(&container.container_id)
        .bind(container.status.to_string())
        .bind(&container.hostname)
        .execute(&self.pool)
        .await
        .context("inserting session container")?;

        Ok(container)
    }

    pub async fn containers_for_session(&self, session_id: &str) -> Result<Vec<SessionContainer>> {
        let containers = sqlx::query_as::<_, SessionContainer>(&format!(
            "SELECT {CONTAINER_COLUMNS} FROM session_containers WHERE session_id = ? ORDER BY hostname"
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .context("fetching session containers")?;

        Ok(containers)
    }

    pub async fn container_by_runtime_id(
        &self,
        runtime_id: &str,
    ) -> Result<Option<SessionContainer>> {
        let container = sqlx::query_as::<_, SessionContainer>(&format!(
            "SELECT {CONTAINER_COLUMNS} FROM session_containers WHERE runtime_id = ?"
        ))
        .bind(runtime_id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching container by runtime id")?;

        Ok(container)
    }

    pub async fn set_container_runtime_id(&self, id: &str, runtime_id: &str) -> Result<()> {
        sqlx::query("UPDATE session_containers SET runtime_id = ? WHERE id = ?")
            .bind(runtime_id)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("setting container runtime id")?;

        Ok(())
    }

    pub async fn update_container_status(&self, id: &str, status: ContainerStatus) -> Result<()> {
        sqlx::query("UPDATE session_containers SET status = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating container status")?;

        Ok(())
    }

    pub async fn mark_container_error(&self, id: &str, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE session_containers SET status = 'error', error_message = ? WHERE id = ?",
        )
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("marking container error")?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Shared volumes ledger
    // ------------------------------------------------------------------

    pub async fn touch_volume(&self, name: &str, kind: &str) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO volumes (name, session_id, kind, created_at, last_used_at)
            VALUES (?, NULL, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET last_used_at = excluded.last_used_at
            "#,
        )
        .bind(name)
        .bind(kind)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("recording volume use")?;

        Ok(())
    }
}
