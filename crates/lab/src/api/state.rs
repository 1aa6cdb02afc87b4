//! Application state shared across handlers.

use std::sync::Arc;

use crate::browser::BrowserOrchestrator;
use crate::bus::{ChannelBus, LiveStores, SnapshotLoaders};
use crate::github::GithubSettingsRepository;
use crate::orchestrate::OrchestrationService;
use crate::proxy::ProxyRouter;
use crate::sandbox::SandboxProvider;
use crate::session::SessionService;
use crate::sse::EventRing;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Session orchestrator.
    pub sessions: Arc<SessionService>,
    /// Browser reconciler (viewer hooks, frames, input passthrough).
    pub browser: Arc<BrowserOrchestrator>,
    /// Orchestration request executor.
    pub orchestration: Arc<OrchestrationService>,
    /// Channel bus hub.
    pub bus: Arc<ChannelBus>,
    /// Live (non-persisted) channel stores.
    pub live: Arc<LiveStores>,
    /// Per-channel snapshot loaders.
    pub snapshots: Arc<SnapshotLoaders>,
    /// Proxy route table, for session URLs.
    pub router: Arc<ProxyRouter>,
    /// GitHub settings storage.
    pub github: GithubSettingsRepository,
    /// Agent credential status events (SSE replay ring).
    pub auth_events: Arc<EventRing>,
    /// Sandbox provider, for health probes.
    pub provider: Arc<dyn SandboxProvider>,
}
