//! The session orchestrator.
//!
//! Owns the write path for sessions and their container clusters: spawn
//! (pool claim or fresh provisioning), background cluster initialization,
//! the per-project warm pool, and idempotent teardown. Spawn and cleanup
//! for the same session serialize on a keyed mutex; cluster I/O happens
//! outside any lock held by readers.

use anyhow::{Context, Result};
use dashmap::DashMap;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use lab_protocol::views::SessionContainerView;
use lab_protocol::{Channel, ListDelta};

use crate::browser::BrowserOrchestrator;
use crate::bus::{ChannelBus, LiveStores};
use crate::error::LabError;
use crate::events::AgentEventRepository;
use crate::project::{ContainerDefinition, ProjectRepository, ProjectWithDefinitions};
use crate::prompts::{agent_prompt, PromptContext};
use crate::proxy::{ClusterContainer, ProxyRouter, RouteInfo};
use crate::sandbox::{
    ContainerSpec, SandboxProvider, LABEL_CONTAINER, LABEL_PROJECT, LABEL_SESSION,
};
use crate::settings::SharedVolumes;

use super::models::{
    container_hostname, network_name, ContainerStatus, Session, SessionContainer, SessionStatus,
    SpawnRequest,
};
use super::repository::SessionRepository;

/// Log source name for orchestrator lifecycle lines.
const LOG_SOURCE: &str = "orchestrator";

/// A session with its containers and proxy routes, as returned to clients.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionWithContainers {
    #[serde(flatten)]
    pub session: Session,
    pub containers: Vec<SessionContainerView>,
    pub urls: Vec<RouteInfo>,
}

pub struct SessionService {
    sessions: SessionRepository,
    projects: ProjectRepository,
    events: AgentEventRepository,
    provider: Arc<dyn SandboxProvider>,
    router: Arc<ProxyRouter>,
    bus: Arc<ChannelBus>,
    browser: Arc<BrowserOrchestrator>,
    live: Arc<LiveStores>,
    volumes: SharedVolumes,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SessionService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sessions: SessionRepository,
        projects: ProjectRepository,
        events: AgentEventRepository,
        provider: Arc<dyn SandboxProvider>,
        router: Arc<ProxyRouter>,
        bus: Arc<ChannelBus>,
        browser: Arc<BrowserOrchestrator>,
        live: Arc<LiveStores>,
        volumes: SharedVolumes,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions,
            projects,
            events,
            provider,
            router,
            bus,
            browser,
            live,
            volumes,
            locks: DashMap::new(),
        })
    }

    pub fn repo(&self) -> &SessionRepository {
        &self.sessions
    }

    pub fn project_repo(&self) -> &ProjectRepository {
        &self.projects
    }

    pub fn event_repo(&self) -> &AgentEventRepository {
        &self.events
    }

    fn lock_for(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // ------------------------------------------------------------------
    // Spawn
    // ------------------------------------------------------------------

    /// Create (or claim) a session and schedule its cluster. Returns the
    /// partial record immediately; clients watch progress on the bus.
    pub async fn spawn_session(self: &Arc<Self>, request: SpawnRequest) -> Result<SessionWithContainers> {
        let title = normalize_title(
            request
                .title
                .as_deref()
                .or(request.initial_message.as_deref()),
        );

        // A warm pooled session skips provisioning entirely.
        if let Some(claimed) = self
            .sessions
            .claim_pooled(&request.project_id, title.as_deref())
            .await?
        {
            info!(session_id = %claimed.id, "claimed pooled session");
            self.publish_session_added(&claimed);
            if let Some(ref message) = request.initial_message {
                self.append_user_message(&claimed.id, message).await?;
            }
            self.kick_pool_reconciler(&request.project_id);
            return self.with_containers(claimed).await;
        }

        let project = self
            .projects
            .get_with_definitions(&request.project_id)
            .await?
            .with_context(|| format!("project not found: {}", request.project_id))?;

        if project.definitions.is_empty() {
            return Err(LabError::NoContainerDefinitions {
                project_id: request.project_id.clone(),
            }
            .into());
        }

        let session = self
            .sessions
            .create(&request.project_id, title.as_deref(), SessionStatus::Creating)
            .await?;

        for (definition, _) in &project.definitions {
            let hostname = container_hostname(&session.id, &definition.id);
            let container = self
                .sessions
                .insert_container(&session.id, &definition.id, &hostname)
                .await?;
            self.publish_container_delta(&session.id, ListDelta::Add {
                item: serde_json::to_value(container.view())?,
            });
        }

        self.publish_session_added(&session);
        if let Some(ref message) = request.initial_message {
            self.append_user_message(&session.id, message).await?;
        }

        let this = Arc::clone(self);
        let session_id = session.id.clone();
        tokio::spawn(async move {
            if let Err(err) = this.initialize_cluster(&session_id).await {
                error!(session_id, "cluster initialization failed: {err:#}");
            }
        });

        self.with_containers(session).await
    }

    async fn with_containers(&self, session: Session) -> Result<SessionWithContainers> {
        let containers = self.sessions.containers_for_session(&session.id).await?;
        let urls = self.router.get_urls(&session.id);
        Ok(SessionWithContainers {
            containers: self.container_views(&session.id, containers),
            urls,
            session,
        })
    }

    /// Decorate container views with their proxy URLs.
    fn container_views(
        &self,
        session_id: &str,
        containers: Vec<SessionContainer>,
    ) -> Vec<SessionContainerView> {
        let urls: std::collections::BTreeMap<u16, String> = self
            .router
            .get_urls(session_id)
            .into_iter()
            .map(|route| (route.container_port, route.url))
            .collect();
        containers
            .into_iter()
            .map(|container| {
                let mut view = container.view();
                view.urls = urls.clone();
                view
            })
            .collect()
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<SessionWithContainers>> {
        let Some(session) = self.sessions.get(session_id).await? else {
            return Ok(None);
        };
        Ok(Some(self.with_containers(session).await?))
    }

    /// Record a user message and surface it on the message channel.
    pub async fn append_user_message(&self, session_id: &str, content: &str) -> Result<()> {
        let event = json!({
            "id": uuid::Uuid::new_v4().to_string(),
            "type": "message",
            "role": "user",
            "content": content,
        });
        self.events.append(session_id, &event).await?;
        self.bus.publish_list_delta(
            &Channel::SessionMessages {
                uuid: session_id.to_string(),
            },
            &ListDelta::Append { message: event },
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Cluster initialization (background)
    // ------------------------------------------------------------------

    /// Bring up the network, volumes, and containers for a session.
    ///
    /// Individual container failures mark that container `error` and move
    /// on; the session is never rolled back to show partial state.
    pub async fn initialize_cluster(self: &Arc<Self>, session_id: &str) -> Result<()> {
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        let session = self
            .sessions
            .get(session_id)
            .await?
            .ok_or_else(|| LabError::session_not_found(session_id))?;
        let project = self
            .projects
            .get_with_definitions(&session.project_id)
            .await?
            .with_context(|| format!("project not found: {}", session.project_id))?;

        let network = network_name(session_id);
        self.provider
            .create_network(&network)
            .await
            .context("creating session network")?;
        self.log(session_id, format!("network {network} ready")).await;

        for volume in self.volumes.names() {
            self.provider
                .create_volume(volume)
                .await
                .with_context(|| format!("ensuring shared volume {volume}"))?;
            self.sessions.touch_volume(volume, "shared").await?;
        }

        let containers = self.sessions.containers_for_session(session_id).await?;
        let mut cluster: Vec<ClusterContainer> = Vec::new();

        for container in &containers {
            let Some((definition, ports)) = project
                .definitions
                .iter()
                .find(|(definition, _)| definition.id == container.container_id)
            else {
                warn!(session_id, container = %container.id, "definition vanished; skipping");
                continue;
            };

            match self
                .start_container(&session, &project, container, definition, ports, &network)
                .await
            {
                Ok(entry) => {
                    self.sessions
                        .update_container_status(&container.id, ContainerStatus::Running)
                        .await?;
                    self.publish_container_update(session_id, &container.id).await?;
                    self.log(
                        session_id,
                        format!("container {} running", container.hostname),
                    )
                    .await;

                    cluster.push(entry);
                    self.router
                        .register_cluster(session_id, &network, cluster.clone());
                }
                Err(err) => {
                    error!(session_id, container = %container.id, "container start failed: {err:#}");
                    self.sessions
                        .mark_container_error(&container.id, &format!("{err:#}"))
                        .await?;
                    self.publish_container_update(session_id, &container.id).await?;
                    self.log(
                        session_id,
                        format!("container {} failed: {err:#}", container.hostname),
                    )
                    .await;
                }
            }
        }

        // Pooled spares stay pooled; user-facing sessions go running.
        let session = self
            .sessions
            .get(session_id)
            .await?
            .ok_or_else(|| LabError::session_not_found(session_id))?;
        if session.status == SessionStatus::Creating {
            self.sessions
                .update_status(session_id, SessionStatus::Running)
                .await?;
            self.publish_session_updated(session_id).await?;
        }

        self.kick_pool_reconciler(&session.project_id);
        Ok(())
    }

    async fn start_container(
        &self,
        session: &Session,
        project: &ProjectWithDefinitions,
        container: &SessionContainer,
        definition: &ContainerDefinition,
        ports: &[u16],
        network: &str,
    ) -> Result<ClusterContainer> {
        let mut env = render_env_template(
            definition.env_template.as_deref(),
            &session.id,
            &session.project_id,
        )?;
        env.insert(
            "LAB_SYSTEM_PROMPT".to_string(),
            agent_prompt(&PromptContext {
                session_id: session.id.clone(),
                project_name: project.project.name.clone(),
                project_prompt: project.project.system_prompt.clone(),
                title: session.title.clone(),
            }),
        );
        env.insert("LAB_SESSION_ID".to_string(), session.id.clone());

        let spec = ContainerSpec {
            name: format!("lab-{}", container.hostname),
            image: definition.image.clone(),
            hostname: Some(container.hostname.clone()),
            labels: HashMap::from([
                (LABEL_SESSION.to_string(), session.id.clone()),
                (LABEL_PROJECT.to_string(), session.project_id.clone()),
                (LABEL_CONTAINER.to_string(), definition.id.clone()),
            ]),
            env,
            binds: vec![
                (self.volumes.workspaces.clone(), "/workspaces".to_string()),
                (
                    self.volumes.opencode_auth.clone(),
                    "/opencode-auth".to_string(),
                ),
                (
                    self.volumes.browser_socket.clone(),
                    "/browser-socket".to_string(),
                ),
            ],
            workdir: Some(format!("/workspaces/{}", session.id)),
            network: None,
            restart_max_retries: 3,
            command: Vec::new(),
        };

        let runtime_id = self
            .provider
            .create_container(&spec)
            .await
            .context("creating container")?;
        self.sessions
            .set_container_runtime_id(&container.id, &runtime_id)
            .await?;

        self.provider
            .start_container(&runtime_id)
            .await
            .context("starting container")?;

        // Move the container from the default network onto the session
        // network, aliased per declared port so the proxy resolves it.
        if let Err(err) = self.provider.disconnect(&runtime_id, "bridge").await {
            warn!(runtime_id, "could not leave default network: {err}");
        }
        let aliases: Vec<String> = ports
            .iter()
            .map(|port| format!("{}--{}", session.id, port))
            .collect();
        self.provider
            .connect(&runtime_id, network, &aliases)
            .await
            .context("connecting to session network")?;

        // Published host ports (if the provider mapped any) win over alias
        // routing in the proxy.
        let observed = self
            .provider
            .inspect(&runtime_id)
            .await
            .unwrap_or_default()
            .map(|inspect| inspect.ports)
            .unwrap_or_default();
        let port_map: HashMap<u16, Option<u16>> = ports
            .iter()
            .map(|port| (*port, observed.get(port).copied().flatten()))
            .collect();

        Ok(ClusterContainer {
            container_id: container.container_id.clone(),
            hostname: container.hostname.clone(),
            ports: port_map,
        })
    }

    // ------------------------------------------------------------------
    // Pool
    // ------------------------------------------------------------------

    /// Schedule a pool reconcile for a project.
    pub fn kick_pool_reconciler(self: &Arc<Self>, project_id: &str) {
        let this = Arc::clone(self);
        let project_id = project_id.to_string();
        tokio::spawn(async move {
            if let Err(err) = this.reconcile_pool(&project_id).await {
                warn!(project_id, "pool reconcile failed: {err:#}");
            }
        });
    }

    /// Ensure the project has exactly `pool_size` pooled sessions.
    pub async fn reconcile_pool(self: &Arc<Self>, project_id: &str) -> Result<()> {
        let Some(project) = self.projects.get_with_definitions(project_id).await? else {
            return Ok(());
        };
        if project.definitions.is_empty() {
            return Ok(());
        }

        let target = project.project.pool_size.max(0);
        let mut pooled = self.sessions.count_pooled(project_id).await?;

        while pooled < target {
            let session = self
                .sessions
                .create(project_id, None, SessionStatus::Pooled)
                .await?;
            for (definition, _) in &project.definitions {
                let hostname = container_hostname(&session.id, &definition.id);
                self.sessions
                    .insert_container(&session.id, &definition.id, &hostname)
                    .await?;
            }
            info!(project_id, session_id = %session.id, "provisioning pooled session");
            self.initialize_cluster(&session.id).await?;
            pooled += 1;
        }

        while pooled > target {
            let spare = self
                .sessions
                .list_with_status(SessionStatus::Pooled)
                .await?
                .into_iter()
                .find(|session| session.project_id == project_id);
            let Some(spare) = spare else { break };
            info!(project_id, session_id = %spare.id, "draining excess pooled session");
            self.cleanup_session(&spare.id).await?;
            pooled -= 1;
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Destroy
    // ------------------------------------------------------------------

    /// Tear a session down. Every step is idempotent; the same routine runs
    /// on crash-recovery sweeps.
    pub async fn cleanup_session(&self, session_id: &str) -> Result<()> {
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        let Some(session) = self.sessions.get(session_id).await? else {
            // Already gone; finish the idempotent leftovers.
            self.router.unregister_cluster(session_id);
            self.live.forget_session(session_id);
            return Ok(());
        };

        if session.status != SessionStatus::Deleting {
            self.sessions
                .update_status(session_id, SessionStatus::Deleting)
                .await?;
        }
        self.bus.publish_list_delta(
            &Channel::Sessions,
            &ListDelta::Remove {
                item: json!({"id": session_id}),
            },
        );

        for container in self.sessions.containers_for_session(session_id).await? {
            let Some(runtime_id) = container.runtime_id else {
                continue;
            };
            if let Err(err) = self.provider.stop_container(&runtime_id).await {
                warn!(session_id, runtime_id, "stop failed during cleanup: {err}");
            }
            if let Err(err) = self.provider.remove_container(&runtime_id, true).await {
                warn!(session_id, runtime_id, "remove failed during cleanup: {err}");
            }
            match self.provider.container_exists(&runtime_id).await {
                Ok(true) => warn!(session_id, runtime_id, "container survived removal"),
                Ok(false) => {}
                Err(err) => warn!(session_id, runtime_id, "could not verify removal: {err}"),
            }
        }

        if let Err(err) = self.browser.force_stop(session_id).await {
            warn!(session_id, "browser force stop failed: {err:#}");
        }

        self.router.unregister_cluster(session_id);

        let network = network_name(session_id);
        if let Err(err) = self.provider.remove_network(&network).await {
            warn!(session_id, network, "network removal failed: {err}");
        }

        self.sessions.delete(session_id).await?;
        self.live.forget_session(session_id);
        info!(session_id, "session cleaned up");
        Ok(())
    }

    /// Boot sweep: finish interrupted deletions and refill pools.
    pub async fn recover(self: &Arc<Self>) -> Result<()> {
        for session in self.sessions.list_with_status(SessionStatus::Deleting).await? {
            info!(session_id = %session.id, "resuming interrupted cleanup");
            if let Err(err) = self.cleanup_session(&session.id).await {
                warn!(session_id = %session.id, "recovery cleanup failed: {err:#}");
            }
        }
        for project in self.projects.list().await? {
            self.kick_pool_reconciler(&project.id);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Bus publishing
    // ------------------------------------------------------------------

    fn publish_session_added(&self, session: &Session) {
        if let Ok(item) = serde_json::to_value(session.summary()) {
            self.bus
                .publish_list_delta(&Channel::Sessions, &ListDelta::Add { item });
        }
    }

    async fn publish_session_updated(&self, session_id: &str) -> Result<()> {
        if let Some(session) = self.sessions.get(session_id).await? {
            if let Ok(item) = serde_json::to_value(session.summary()) {
                self.bus
                    .publish_list_delta(&Channel::Sessions, &ListDelta::Update { item });
            }
        }
        Ok(())
    }

    fn publish_container_delta(&self, session_id: &str, delta: ListDelta) {
        self.bus.publish_list_delta(
            &Channel::SessionContainers {
                uuid: session_id.to_string(),
            },
            &delta,
        );
    }

    async fn publish_container_update(&self, session_id: &str, container_id: &str) -> Result<()> {
        let containers = self.sessions.containers_for_session(session_id).await?;
        if let Some(container) = containers.iter().find(|c| c.id == container_id) {
            self.publish_container_delta(
                session_id,
                ListDelta::Update {
                    item: serde_json::to_value(container.view())?,
                },
            );
        }
        Ok(())
    }

    async fn log(&self, session_id: &str, line: String) {
        let log_line = self.live.append_log(session_id, LOG_SOURCE, line);
        if let Ok(data) = serde_json::to_value(&log_line) {
            self.bus.publish_delta(
                &Channel::SessionLogs {
                    uuid: session_id.to_string(),
                },
                json!({"type": "append", "source": LOG_SOURCE, "line": data}),
            );
        }
    }
}

/// Trim and collapse internal whitespace; empty input yields `None`.
pub fn normalize_title(raw: Option<&str>) -> Option<String> {
    let normalized = raw?.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

/// Render a definition's env template, substituting session placeholders.
fn render_env_template(
    template: Option<&str>,
    session_id: &str,
    project_id: &str,
) -> Result<HashMap<String, String>> {
    let Some(template) = template else {
        return Ok(HashMap::new());
    };
    let parsed: HashMap<String, String> =
        serde_json::from_str(template).context("parsing env template")?;
    Ok(parsed
        .into_iter()
        .map(|(key, value)| {
            let value = value
                .replace("{{SESSION_ID}}", session_id)
                .replace("{{PROJECT_ID}}", project_id);
            (key, value)
        })
        .collect())
}
