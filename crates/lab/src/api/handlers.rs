//! HTTP API handlers.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use lab_protocol::views::ProjectView;

use crate::github::GithubSettings;
use crate::session::{SessionWithContainers, SpawnRequest};

use super::error::{ApiError, ApiResult};
use super::state::AppState;

/// GET /health
pub async fn health() -> &'static str {
    "OK"
}

/// GET /projects
pub async fn list_projects(State(state): State<AppState>) -> ApiResult<Json<Vec<ProjectView>>> {
    let projects = state.sessions.project_repo().list().await?;
    let mut views = Vec::with_capacity(projects.len());
    for project in projects {
        let container_count = state
            .sessions
            .project_repo()
            .definition_count(&project.id)
            .await?;
        views.push(ProjectView {
            id: project.id,
            name: project.name,
            system_prompt: project.system_prompt,
            pool_size: project.pool_size,
            container_count: container_count as usize,
        });
    }
    Ok(Json(views))
}

/// GET /sessions
pub async fn list_sessions(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<lab_protocol::views::SessionSummary>>> {
    let sessions = state.sessions.repo().list_visible().await?;
    Ok(Json(
        sessions.iter().map(|session| session.summary()).collect(),
    ))
}

/// POST /sessions
pub async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<SpawnRequest>,
) -> ApiResult<(StatusCode, Json<SessionWithContainers>)> {
    let spawned = state.sessions.spawn_session(request).await?;
    info!(session_id = %spawned.session.id, "session spawn accepted");
    Ok((StatusCode::CREATED, Json(spawned)))
}

/// GET /sessions/{id}
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<SessionWithContainers>> {
    let session = state
        .sessions
        .get_session(&session_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("session not found: {session_id}")))?;
    Ok(Json(session))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSessionRequest {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub agent_session_id: Option<String>,
}

/// PATCH /sessions/{id}
pub async fn update_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<UpdateSessionRequest>,
) -> ApiResult<Json<SessionWithContainers>> {
    let repo = state.sessions.repo();
    if repo.get(&session_id).await?.is_none() {
        return Err(ApiError::not_found(format!(
            "session not found: {session_id}"
        )));
    }

    if let Some(ref title) = request.title {
        repo.update_title(&session_id, Some(title)).await?;
    }
    if let Some(ref agent_session_id) = request.agent_session_id {
        repo.update_agent_session_id(&session_id, agent_session_id)
            .await?;
    }

    let session = state
        .sessions
        .get_session(&session_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("session not found: {session_id}")))?;
    Ok(Json(session))
}

/// DELETE /sessions/{id}
pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<StatusCode> {
    if state.sessions.repo().get(&session_id).await?.is_none() {
        return Err(ApiError::not_found(format!(
            "session not found: {session_id}"
        )));
    }

    // Teardown talks to the provider; run it off the request path.
    let sessions = state.sessions.clone();
    tokio::spawn(async move {
        if let Err(err) = sessions.cleanup_session(&session_id).await {
            warn!(session_id, "background cleanup failed: {err:#}");
        }
    });

    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrateRequest {
    pub content: String,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub model_id: Option<String>,
}

/// POST /orchestrate
pub async fn orchestrate(
    State(state): State<AppState>,
    Json(request): Json<OrchestrateRequest>,
) -> ApiResult<Json<crate::orchestrate::OrchestrationAccepted>> {
    if request.content.trim().is_empty() {
        return Err(ApiError::bad_request("content must not be empty"));
    }
    let accepted = state
        .orchestration
        .submit(
            &request.content,
            request.channel_id.as_deref(),
            request.model_id.as_deref(),
        )
        .await?;
    Ok(Json(accepted))
}

/// GET /github/settings
pub async fn get_github_settings(
    State(state): State<AppState>,
) -> ApiResult<Json<crate::github::GithubSettingsView>> {
    let settings = state.github.get().await?;
    Ok(Json(settings.view()))
}

/// POST /github/settings
pub async fn put_github_settings(
    State(state): State<AppState>,
    Json(settings): Json<GithubSettings>,
) -> ApiResult<Json<crate::github::GithubSettingsView>> {
    let saved = state.github.upsert(&settings).await?;
    state
        .auth_events
        .publish(json!({"kind": "github", "configured": saved.view().configured}));
    Ok(Json(saved.view()))
}

/// DELETE /github/settings
pub async fn delete_github_settings(State(state): State<AppState>) -> ApiResult<StatusCode> {
    state.github.clear().await?;
    state
        .auth_events
        .publish(json!({"kind": "github", "configured": false}));
    Ok(StatusCode::NO_CONTENT)
}

/// GET /agent-auth/events
///
/// SSE stream of credential status changes. `Last-Event-ID` replays events
/// a reconnecting client missed while the ring still holds them.
pub async fn agent_auth_events(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let last_event_id = headers
        .get("last-event-id")
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.parse::<u64>().ok());

    let (missed, live) = state.auth_events.subscribe(last_event_id);

    let replay = tokio_stream::iter(missed.into_iter().map(|event| {
        Ok(Event::default()
            .id(event.id.to_string())
            .data(event.data.to_string()))
    }));

    let live = BroadcastStream::new(live).filter_map(|item| match item {
        Ok(event) => Some(Ok(Event::default()
            .id(event.id.to_string())
            .data(event.data.to_string()))),
        // A lagged receiver skips to the live edge; the ring covers the gap
        // on the next reconnect.
        Err(_) => None,
    });

    Sse::new(replay.chain(live)).keep_alive(KeepAlive::default())
}
