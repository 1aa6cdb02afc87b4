//! Per-channel snapshot read models.
//!
//! Each channel's snapshot is a query over the state store or the live
//! stores. Loaders are side-effect free; subscription hooks live in the
//! socket handler.

use anyhow::Result;
use serde_json::{json, Value};
use std::sync::Arc;

use lab_protocol::views::{BrowserStateView, CompleteSnapshot, ProjectView, SessionMetadata};
use lab_protocol::Channel;

use crate::browser::BrowserOrchestrator;
use crate::events::AgentEventRepository;
use crate::orchestrate::OrchestrationService;
use crate::project::ProjectRepository;
use crate::proxy::ProxyRouter;
use crate::session::SessionRepository;

use super::live::LiveStores;

/// Loads the initial state a subscriber receives for any channel.
pub struct SnapshotLoaders {
    pub sessions: SessionRepository,
    pub projects: ProjectRepository,
    pub events: AgentEventRepository,
    pub browser: Arc<BrowserOrchestrator>,
    pub orchestration: Arc<OrchestrationService>,
    pub router: Arc<ProxyRouter>,
    pub live: Arc<LiveStores>,
}

impl SnapshotLoaders {
    pub async fn load(&self, channel: &Channel) -> Result<Value> {
        let snapshot = match channel {
            Channel::Projects => {
                let mut views = Vec::new();
                for project in self.projects.list().await? {
                    let container_count = self.projects.definition_count(&project.id).await?;
                    views.push(ProjectView {
                        id: project.id,
                        name: project.name,
                        system_prompt: project.system_prompt,
                        pool_size: project.pool_size,
                        container_count: container_count as usize,
                    });
                }
                serde_json::to_value(views)?
            }

            Channel::Sessions => {
                let summaries: Vec<_> = self
                    .sessions
                    .list_visible()
                    .await?
                    .iter()
                    .map(|session| session.summary())
                    .collect();
                serde_json::to_value(summaries)?
            }

            Channel::SessionMetadata { uuid } => {
                let session = self.sessions.get(uuid).await?;
                let last_message = self
                    .events
                    .messages_snapshot(uuid)
                    .await?
                    .messages
                    .last()
                    .and_then(|message| message.get("content").and_then(Value::as_str))
                    .map(str::to_string);
                match session {
                    Some(session) => serde_json::to_value(SessionMetadata {
                        title: session.title,
                        last_message,
                        inference_status: "idle".to_string(),
                        status: session.status.to_string(),
                    })?,
                    None => Value::Null,
                }
            }

            Channel::SessionContainers { uuid } => {
                let urls: std::collections::BTreeMap<u16, String> = self
                    .router
                    .get_urls(uuid)
                    .into_iter()
                    .map(|route| (route.container_port, route.url))
                    .collect();
                let views: Vec<_> = self
                    .sessions
                    .containers_for_session(uuid)
                    .await?
                    .iter()
                    .map(|container| {
                        let mut view = container.view();
                        view.urls = urls.clone();
                        view
                    })
                    .collect();
                serde_json::to_value(views)?
            }

            Channel::SessionTyping { uuid } => {
                serde_json::to_value(self.live.typing_snapshot(uuid))?
            }

            Channel::SessionChangedFiles { uuid } => Value::Array(self.live.changed_files(uuid)),
            Channel::SessionTasks { uuid } => Value::Array(self.live.tasks(uuid)),
            Channel::SessionBranches { uuid } => Value::Array(self.live.branches(uuid)),
            Channel::SessionLinks { uuid } => Value::Array(self.live.links(uuid)),

            Channel::SessionLogs { uuid } => {
                serde_json::to_value(self.live.logs_snapshot(uuid))?
            }

            Channel::SessionMessages { uuid } => {
                serde_json::to_value(self.events.messages_snapshot(uuid).await?)?
            }

            Channel::SessionAcpEvents { uuid } => {
                serde_json::to_value(self.events.acp_snapshot(uuid).await?)?
            }

            Channel::SessionBrowserState { uuid } => {
                match self.browser.state_repo().get(uuid).await? {
                    Some(state) => serde_json::to_value(self.browser.state_view(&state))?,
                    // No daemon has ever been requested for this session.
                    None => serde_json::to_value(BrowserStateView {
                        session_id: uuid.clone(),
                        desired: "stopped".to_string(),
                        actual: "stopped".to_string(),
                        stream_port: None,
                        stream_host: None,
                        last_url: None,
                        retry_count: 0,
                        error_message: None,
                    })?,
                }
            }

            Channel::SessionBrowserFrames { uuid } => {
                serde_json::to_value(self.browser.last_frame(uuid))?
            }

            // Input is event-only; subscribers get an empty snapshot.
            Channel::SessionBrowserInput { .. } => json!({}),

            Channel::OrchestrationStatus { uuid } => {
                match self.orchestration.status_snapshot(uuid).await? {
                    Some(view) => serde_json::to_value(view)?,
                    None => Value::Null,
                }
            }

            Channel::SessionComplete { uuid } => serde_json::to_value(CompleteSnapshot {
                completed: self.live.is_completed(uuid),
            })?,
        };

        Ok(snapshot)
    }
}
