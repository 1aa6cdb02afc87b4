//! Per-channel snapshot payloads.
//!
//! These are the read-model shapes clients render. Field names are camelCase
//! on the wire. List-channel items all carry an `id` so the generic delta
//! semantics in [`crate::deltas`] apply.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// `projects` snapshot item.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectView {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub pool_size: i64,
    pub container_count: usize,
}

/// `sessions` snapshot item.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub project_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// `sessionContainers/{uuid}` snapshot item.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionContainerView {
    pub id: String,
    pub session_id: String,
    pub container_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_id: Option<String>,
    pub status: String,
    pub hostname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Proxy URLs keyed by declared container port.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub urls: BTreeMap<u16, String>,
}

/// `sessionMetadata/{uuid}` snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    pub inference_status: String,
    pub status: String,
}

/// `sessionLogs/{uuid}` snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LogsSnapshot {
    pub sources: Vec<String>,
    pub recent_logs: BTreeMap<String, Vec<LogLine>>,
}

/// A single log line within a source ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub line: String,
}

/// `sessionMessages/{uuid}` snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MessagesSnapshot {
    pub messages: Vec<Value>,
    pub question_requests: Vec<Value>,
}

/// `sessionAcpEvents/{uuid}` snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AcpEventsSnapshot {
    pub checkpoint: i64,
    pub events: Vec<Value>,
}

/// `sessionBrowserState/{uuid}` snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserStateView {
    pub session_id: String,
    pub desired: String,
    pub actual: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_port: Option<u16>,
    /// Host clients dial for the stream WebSocket.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_url: Option<String>,
    pub retry_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// `sessionBrowserFrames/{uuid}` snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FrameSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_frame: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// `orchestrationStatus/{uuid}` snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationStatusView {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// `sessionComplete/{uuid}` snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct CompleteSnapshot {
    pub completed: bool,
}

/// `sessionTyping/{uuid}` client event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TypingEvent {
    SetTyping { user_id: String, typing: bool },
}
