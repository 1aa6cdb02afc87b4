//! Append-only agent event log.
//!
//! Every agent-facing fact for a session lands here with a dense, strictly
//! increasing sequence number. Message and ACP read models are projections
//! over the same log; nothing is ever truncated.

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use sqlx::SqlitePool;

use lab_protocol::views::{AcpEventsSnapshot, MessagesSnapshot};

/// Repository for `agent_events`.
#[derive(Debug, Clone)]
pub struct AgentEventRepository {
    pool: SqlitePool,
}

impl AgentEventRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append an event, assigning the next sequence number atomically.
    pub async fn append(&self, session_id: &str, event_data: &Value) -> Result<i64> {
        let sequence: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO agent_events (session_id, sequence, event_data, created_at)
            SELECT ?, COALESCE(MAX(sequence), 0) + 1, ?, ?
            FROM agent_events WHERE session_id = ?
            RETURNING sequence
            "#,
        )
        .bind(session_id)
        .bind(event_data.to_string())
        .bind(Utc::now())
        .bind(session_id)
        .fetch_one(&self.pool)
        .await
        .context("appending agent event")?;

        Ok(sequence)
    }

    /// Events after a checkpoint, in sequence order.
    pub async fn since(&self, session_id: &str, checkpoint: i64) -> Result<Vec<(i64, Value)>> {
        let rows: Vec<(i64, String)> = sqlx::query_as(
            r#"
            SELECT sequence, event_data FROM agent_events
            WHERE session_id = ? AND sequence > ?
            ORDER BY sequence ASC
            "#,
        )
        .bind(session_id)
        .bind(checkpoint)
        .fetch_all(&self.pool)
        .await
        .context("fetching agent events")?;

        Ok(rows
            .into_iter()
            .filter_map(|(sequence, raw)| {
                serde_json::from_str(&raw).ok().map(|data| (sequence, data))
            })
            .collect())
    }

    pub async fn latest_sequence(&self, session_id: &str) -> Result<i64> {
        let sequence: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(sequence), 0) FROM agent_events WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await
        .context("fetching latest sequence")?;

        Ok(sequence)
    }

    /// Message-channel projection: events typed `message` and
    /// `question_request`.
    pub async fn messages_snapshot(&self, session_id: &str) -> Result<MessagesSnapshot> {
        let events = self.since(session_id, 0).await?;
        let mut snapshot = MessagesSnapshot::default();
        for (_, event) in events {
            match event.get("type").and_then(Value::as_str) {
                Some("message") => snapshot.messages.push(event),
                Some("question_request") => snapshot.question_requests.push(event),
                _ => {}
            }
        }
        Ok(snapshot)
    }

    /// ACP-channel projection: the full log plus its checkpoint.
    pub async fn acp_snapshot(&self, session_id: &str) -> Result<AcpEventsSnapshot> {
        let events = self.since(session_id, 0).await?;
        let checkpoint = events.last().map(|(sequence, _)| *sequence).unwrap_or(0);
        Ok(AcpEventsSnapshot {
            checkpoint,
            events: events.into_iter().map(|(_, event)| event).collect(),
        })
    }
}
