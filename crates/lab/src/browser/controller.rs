//! Browser daemon controller.
//!
//! Wraps the external browser-daemon HTTP API behind a trait so the
//! reconciler (and tests) never touch the transport.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::error::{LabError, LabResult};

/// Hard cap on a single controller call.
const CALL_DEADLINE: Duration = Duration::from_secs(30);

/// Daemon status as reported by the controller.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct DaemonStatus {
    pub running: bool,
    pub ready: bool,
    pub port: u16,
}

/// Result envelope for opaque daemon commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Control surface for per-session browser daemons.
#[async_trait]
pub trait DaemonController: Send + Sync {
    /// Start the daemon, optionally navigating to `url` once ready.
    async fn start(&self, session_id: &str, url: Option<&str>) -> LabResult<u16>;

    /// Stop the daemon. Idempotent; a missing daemon is success.
    async fn stop(&self, session_id: &str) -> LabResult<()>;

    async fn navigate(&self, session_id: &str, url: &str) -> LabResult<()>;

    /// `None` when no daemon exists for the session.
    async fn get_status(&self, session_id: &str) -> LabResult<Option<DaemonStatus>>;

    async fn get_current_url(&self, session_id: &str) -> LabResult<Option<String>>;

    /// Mark the viewport active so the daemon materializes lazily on first view.
    async fn launch(&self, session_id: &str) -> LabResult<()>;

    async fn is_healthy(&self) -> bool;

    /// Opaque command passthrough (viewer input events and the like).
    async fn execute_command(&self, session_id: &str, command: Value) -> LabResult<CommandResult>;
}

#[derive(Debug, Deserialize)]
struct StartResponse {
    port: u16,
}

#[derive(Debug, Deserialize)]
struct UrlResponse {
    url: Option<String>,
}

/// HTTP implementation over the daemon's REST API.
#[derive(Debug, Clone)]
pub struct HttpDaemonController {
    base_url: String,
    client: reqwest::Client,
}

impl HttpDaemonController {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(CALL_DEADLINE)
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.into(),
            client,
        }
    }

    fn url(&self, session_id: &str, tail: &str) -> String {
        format!(
            "{}/sessions/{}/{}",
            self.base_url.trim_end_matches('/'),
            session_id,
            tail
        )
    }

    /// Decode a JSON reply, mapping schema mismatches to `ConnectionFailed`.
    async fn decode<T: serde::de::DeserializeOwned>(
        session_id: &str,
        response: reqwest::Response,
    ) -> LabResult<T> {
        let body = response
            .text()
            .await
            .map_err(|e| LabError::connection_failed(session_id, e.to_string()))?;
        serde_json::from_str(&body).map_err(|e| {
            LabError::connection_failed(session_id, format!("Invalid response format: {e}"))
        })
    }
}

#[async_trait]
impl DaemonController for HttpDaemonController {
    async fn start(&self, session_id: &str, url: Option<&str>) -> LabResult<u16> {
        let mut body = serde_json::Map::new();
        if let Some(url) = url {
            body.insert("url".to_string(), Value::String(url.to_string()));
        }

        let response = self
            .client
            .post(self.url(session_id, "start"))
            .json(&Value::Object(body))
            .send()
            .await
            .map_err(|e| LabError::DaemonStartFailed {
                session_id: session_id.to_string(),
                detail: e.to_string(),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(LabError::DaemonStartFailed {
                session_id: session_id.to_string(),
                detail: format!("{status}: {detail}"),
            });
        }

        let parsed: StartResponse = Self::decode(session_id, response).await?;
        Ok(parsed.port)
    }

    async fn stop(&self, session_id: &str) -> LabResult<()> {
        let response = self
            .client
            .post(self.url(session_id, "stop"))
            .send()
            .await
            .map_err(|e| LabError::DaemonStopFailed {
                session_id: session_id.to_string(),
                detail: e.to_string(),
            })?;

        // A daemon that is already gone counts as stopped.
        if response.status() == reqwest::StatusCode::NOT_FOUND || response.status().is_success() {
            return Ok(());
        }

        let status = response.status();
        let detail = response.text().await.unwrap_or_default();
        Err(LabError::DaemonStopFailed {
            session_id: session_id.to_string(),
            detail: format!("{status}: {detail}"),
        })
    }

    async fn navigate(&self, session_id: &str, url: &str) -> LabResult<()> {
        let response = self
            .client
            .post(self.url(session_id, "navigate"))
            .json(&serde_json::json!({ "url": url }))
            .send()
            .await
            .map_err(|e| LabError::NavigationFailed {
                session_id: session_id.to_string(),
                url: url.to_string(),
                detail: e.to_string(),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(LabError::NavigationFailed {
                session_id: session_id.to_string(),
                url: url.to_string(),
                detail: format!("{status}: {detail}"),
            });
        }

        Ok(())
    }

    async fn get_status(&self, session_id: &str) -> LabResult<Option<DaemonStatus>> {
        let response = self
            .client
            .get(self.url(session_id, "status"))
            .send()
            .await
            .map_err(|e| LabError::connection_failed(session_id, e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(LabError::connection_failed(
                session_id,
                format!("status probe returned {}", response.status()),
            ));
        }

        let parsed: DaemonStatus = Self::decode(session_id, response).await?;
        Ok(Some(parsed))
    }

    async fn get_current_url(&self, session_id: &str) -> LabResult<Option<String>> {
        let response = self
            .client
            .get(self.url(session_id, "url"))
            .send()
            .await
            .map_err(|e| LabError::connection_failed(session_id, e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(LabError::connection_failed(
                session_id,
                format!("url probe returned {}", response.status()),
            ));
        }

        let parsed: UrlResponse = Self::decode(session_id, response).await?;
        Ok(parsed.url.filter(|url| !url.trim().is_empty()))
    }

    async fn launch(&self, session_id: &str) -> LabResult<()> {
        let response = self
            .client
            .post(self.url(session_id, "launch"))
            .send()
            .await
            .map_err(|e| LabError::connection_failed(session_id, e.to_string()))?;

        if !response.status().is_success() {
            return Err(LabError::connection_failed(
                session_id,
                format!("launch returned {}", response.status()),
            ));
        }

        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        let url = format!("{}/health", self.base_url.trim_end_matches('/'));
        match self.client.get(url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    async fn execute_command(&self, session_id: &str, command: Value) -> LabResult<CommandResult> {
        let response = self
            .client
            .post(self.url(session_id, "command"))
            .json(&command)
            .send()
            .await
            .map_err(|e| LabError::connection_failed(session_id, e.to_string()))?;

        if !response.status().is_success() {
            return Err(LabError::connection_failed(
                session_id,
                format!("command returned {}", response.status()),
            ));
        }

        Self::decode(session_id, response).await
    }
}
