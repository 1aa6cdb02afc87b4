//! Browser state persistence.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

use super::models::{ActualState, BrowserSessionState, DesiredState};

const COLUMNS: &str =
    "session_id, desired, actual, stream_port, last_url, retry_count, error_message, last_heartbeat_at";

/// Repository for `browser_sessions`.
#[derive(Debug, Clone)]
pub struct BrowserStateRepository {
    pool: SqlitePool,
}

impl BrowserStateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Fetch the row for a session, inserting the stopped/stopped default if
    /// none exists yet.
    pub async fn get_or_create(&self, session_id: &str) -> Result<BrowserSessionState> {
        sqlx::query(
            r#"
            INSERT INTO browser_sessions (session_id, desired, actual, retry_count)
            VALUES (?, 'stopped', 'stopped', 0)
            ON CONFLICT(session_id) DO NOTHING
            "#,
        )
        .bind(session_id)
        .execute(&self.pool)
        .await
        .context("ensuring browser session row")?;

        let state = sqlx::query_as::<_, BrowserSessionState>(&format!(
            "SELECT {COLUMNS} FROM browser_sessions WHERE session_id = ?"
        ))
        .bind(session_id)
        .fetch_one(&self.pool)
        .await
        .context("fetching browser session state")?;

        Ok(state)
    }

    pub async fn get(&self, session_id: &str) -> Result<Option<BrowserSessionState>> {
        let state = sqlx::query_as::<_, BrowserSessionState>(&format!(
            "SELECT {COLUMNS} FROM browser_sessions WHERE session_id = ?"
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching browser session state")?;

        Ok(state)
    }

    pub async fn list(&self) -> Result<Vec<BrowserSessionState>> {
        let states = sqlx::query_as::<_, BrowserSessionState>(&format!(
            "SELECT {COLUMNS} FROM browser_sessions"
        ))
        .fetch_all(&self.pool)
        .await
        .context("listing browser session states")?;

        Ok(states)
    }

    pub async fn set_desired(&self, session_id: &str, desired: DesiredState) -> Result<()> {
        sqlx::query("UPDATE browser_sessions SET desired = ? WHERE session_id = ?")
            .bind(desired.to_string())
            .bind(session_id)
            .execute(&self.pool)
            .await
            .context("updating desired state")?;

        Ok(())
    }

    pub async fn set_actual(&self, session_id: &str, actual: ActualState) -> Result<()> {
        sqlx::query(
            "UPDATE browser_sessions SET actual = ?, last_heartbeat_at = ? WHERE session_id = ?",
        )
        .bind(actual.to_string())
        .bind(Utc::now())
        .bind(session_id)
        .execute(&self.pool)
        .await
        .context("updating actual state")?;

        Ok(())
    }

    pub async fn set_stream_port(&self, session_id: &str, port: Option<u16>) -> Result<()> {
        sqlx::query("UPDATE browser_sessions SET stream_port = ? WHERE session_id = ?")
            .bind(port.map(i64::from))
            .bind(session_id)
            .execute(&self.pool)
            .await
            .context("updating stream port")?;

        Ok(())
    }

    pub async fn set_last_url(&self, session_id: &str, url: &str) -> Result<()> {
        sqlx::query("UPDATE browser_sessions SET last_url = ? WHERE session_id = ?")
            .bind(url)
            .bind(session_id)
            .execute(&self.pool)
            .await
            .context("updating last url")?;

        Ok(())
    }

    pub async fn increment_retry(&self, session_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            UPDATE browser_sessions SET retry_count = retry_count + 1
            WHERE session_id = ?
            RETURNING retry_count
            "#,
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await
        .context("incrementing retry count")?;

        Ok(count)
    }

    pub async fn set_error(&self, session_id: &str, message: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE browser_sessions SET error_message = ? WHERE session_id = ?")
            .bind(message)
            .bind(session_id)
            .execute(&self.pool)
            .await
            .context("updating error message")?;

        Ok(())
    }

    /// Clear transient fields after a clean stop.
    pub async fn mark_stopped(&self, session_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE browser_sessions
            SET actual = 'stopped', stream_port = NULL, retry_count = 0, error_message = NULL
            WHERE session_id = ?
            "#,
        )
        .bind(session_id)
        .execute(&self.pool)
        .await
        .context("marking browser session stopped")?;

        Ok(())
    }

    /// Explicit operator reset out of the error state.
    pub async fn reset(&self, session_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE browser_sessions
            SET actual = 'stopped', retry_count = 0, error_message = NULL
            WHERE session_id = ?
            "#,
        )
        .bind(session_id)
        .execute(&self.pool)
        .await
        .context("resetting browser session")?;

        Ok(())
    }

    /// Boot sweep: sessions left in transitional states by a crash go back
    /// to `stopped` so the reconciler can re-drive them.
    pub async fn reset_transitional(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE browser_sessions
            SET actual = 'stopped', stream_port = NULL
            WHERE actual IN ('starting', 'stopping')
            "#,
        )
        .execute(&self.pool)
        .await
        .context("resetting transitional browser sessions")?;

        Ok(result.rows_affected())
    }
}
