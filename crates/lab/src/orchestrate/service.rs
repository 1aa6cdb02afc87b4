//! Orchestration request execution.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info};

use lab_protocol::{Channel, Patch};

use crate::bus::ChannelBus;
use crate::project::{Project, ProjectRepository};
use crate::session::{SessionService, SpawnRequest};

use super::{OrchestrationRepository, OrchestrationRequest, OrchestrationStatus};

/// Resolves orchestration requests into sessions.
pub struct OrchestrationService {
    repo: OrchestrationRepository,
    projects: ProjectRepository,
    sessions: Arc<SessionService>,
    bus: Arc<ChannelBus>,
}

/// Outcome returned to the HTTP caller while the request keeps running.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationAccepted {
    pub orchestration_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl OrchestrationService {
    pub fn new(
        repo: OrchestrationRepository,
        projects: ProjectRepository,
        sessions: Arc<SessionService>,
        bus: Arc<ChannelBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            repo,
            projects,
            sessions,
            bus,
        })
    }

    pub fn repo(&self) -> &OrchestrationRepository {
        &self.repo
    }

    /// Accept a request and run it in the background.
    pub async fn submit(
        self: &Arc<Self>,
        content: &str,
        channel_id: Option<&str>,
        model_id: Option<&str>,
    ) -> Result<OrchestrationAccepted> {
        let request = self.repo.create(content, channel_id, model_id).await?;

        let this = Arc::clone(self);
        let request_id = request.id.clone();
        tokio::spawn(async move {
            if let Err(err) = this.execute(&request_id).await {
                error!(request_id, "orchestration failed: {err:#}");
                if let Err(record_err) = this.repo.set_error(&request_id, &format!("{err:#}")).await
                {
                    error!(request_id, "could not record failure: {record_err:#}");
                }
                this.publish_status(&request_id).await;
            }
        });

        Ok(OrchestrationAccepted {
            orchestration_id: request.id,
            project_name: None,
            session_id: None,
        })
    }

    async fn execute(&self, request_id: &str) -> Result<()> {
        let request = self
            .repo
            .get(request_id)
            .await?
            .context("orchestration request vanished")?;

        self.transition(request_id, OrchestrationStatus::Thinking).await?;

        let project = self
            .resolve_project(&request)
            .await?
            .context("no projects are configured")?;
        self.repo
            .set_resolution(request_id, Some(&project.id), None)
            .await?;
        info!(request_id, project = %project.name, "orchestration resolved project");

        self.transition(request_id, OrchestrationStatus::Delegating).await?;

        let spawned = self
            .sessions
            .spawn_session(SpawnRequest {
                project_id: project.id.clone(),
                title: Some(request.content.clone()),
                initial_message: Some(request.content.clone()),
            })
            .await?;
        self.repo
            .set_resolution(request_id, None, Some(&spawned.session.id))
            .await?;

        self.transition(request_id, OrchestrationStatus::Starting).await?;
        self.transition(request_id, OrchestrationStatus::Complete).await?;
        Ok(())
    }

    /// Pick the project the request refers to.
    ///
    /// With the language model out of scope, resolution is lexical: the
    /// first project whose name appears in the content wins, otherwise the
    /// first project overall.
    async fn resolve_project(&self, request: &OrchestrationRequest) -> Result<Option<Project>> {
        let projects = self.projects.list().await?;
        let content = request.content.to_lowercase();
        let matched = projects
            .iter()
            .find(|project| content.contains(&project.name.to_lowercase()))
            .cloned();
        Ok(matched.or_else(|| projects.into_iter().next()))
    }

    async fn transition(&self, request_id: &str, status: OrchestrationStatus) -> Result<()> {
        self.repo.set_status(request_id, status).await?;
        self.publish_status(request_id).await;
        Ok(())
    }

    async fn publish_status(&self, request_id: &str) {
        let Ok(Some(request)) = self.repo.get(request_id).await else {
            return;
        };
        let project_name = match request.resolved_project_id.as_deref() {
            Some(project_id) => self
                .projects
                .get(project_id)
                .await
                .ok()
                .flatten()
                .map(|project| project.name),
            None => None,
        };
        if let Ok(fields) = serde_json::to_value(request.status_view(project_name)) {
            self.bus.publish_patch(
                &Channel::OrchestrationStatus {
                    uuid: request_id.to_string(),
                },
                &Patch::new(fields),
            );
        }
    }

    /// Status snapshot for the channel loader.
    pub async fn status_snapshot(
        &self,
        request_id: &str,
    ) -> Result<Option<lab_protocol::views::OrchestrationStatusView>> {
        let Some(request) = self.repo.get(request_id).await? else {
            return Ok(None);
        };
        let project_name = match request.resolved_project_id.as_deref() {
            Some(project_id) => self
                .projects
                .get(project_id)
                .await?
                .map(|project| project.name),
            None => None,
        };
        Ok(Some(request.status_view(project_name)))
    }
}
