//! The browser reconciliation loop.
//!
//! One orchestrator per process. Each tick drives every session's `actual`
//! state toward `desired` through the daemon controller, holding a
//! per-session mutex so actions on the same session never interleave.
//! Failures are recorded on the row, surfaced on the state channel, and
//! never stop the loop.

use anyhow::Result;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use lab_protocol::views::FrameSnapshot;
use lab_protocol::{Channel, Patch};

use crate::bus::ChannelBus;
use crate::error::LabError;
use crate::ports::{PortAllocator, PortKind, PortReservationRepository};

use super::controller::DaemonController;
use super::models::{select_action, Action, ActualState, BrowserSessionState, DesiredState};
use super::repository::BrowserStateRepository;

/// A per-session failure from one reconcile pass.
#[derive(Debug, Clone)]
pub struct ReconcileFailure {
    pub session_id: String,
    pub error: String,
}

/// Orchestrator configuration, split from [`crate::settings::Settings`] so
/// tests can tune intervals directly.
#[derive(Debug, Clone)]
pub struct BrowserOrchestratorConfig {
    pub reconcile_interval: Duration,
    pub cleanup_delay: Duration,
    pub max_retries: u32,
    /// Host clients dial for stream WebSockets, surfaced on the state view.
    pub stream_host: String,
}

pub struct BrowserOrchestrator {
    repo: BrowserStateRepository,
    controller: Arc<dyn DaemonController>,
    allocator: Arc<PortAllocator>,
    reservations: PortReservationRepository,
    bus: Arc<ChannelBus>,
    config: BrowserOrchestratorConfig,
    /// Per-session reconcile locks.
    locks: DashMap<String, Arc<Mutex<()>>>,
    /// Active viewer counts per session.
    viewers: DashMap<String, usize>,
    /// Last frame payload per session, served to new subscribers.
    frames: DashMap<String, FrameSnapshot>,
    errors_tx: broadcast::Sender<Vec<ReconcileFailure>>,
}

impl BrowserOrchestrator {
    pub fn new(
        repo: BrowserStateRepository,
        controller: Arc<dyn DaemonController>,
        allocator: Arc<PortAllocator>,
        reservations: PortReservationRepository,
        bus: Arc<ChannelBus>,
        config: BrowserOrchestratorConfig,
    ) -> Arc<Self> {
        let (errors_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            repo,
            controller,
            allocator,
            reservations,
            bus,
            config,
            locks: DashMap::new(),
            viewers: DashMap::new(),
            frames: DashMap::new(),
            errors_tx,
        })
    }

    /// Listen for aggregated per-tick failures.
    pub fn on_error(&self) -> broadcast::Receiver<Vec<ReconcileFailure>> {
        self.errors_tx.subscribe()
    }

    pub fn state_repo(&self) -> &BrowserStateRepository {
        &self.repo
    }

    fn lock_for(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// The session's state view, decorated with the stream host.
    pub fn state_view(&self, state: &BrowserSessionState) -> lab_protocol::views::BrowserStateView {
        let mut view = state.view();
        view.stream_host = Some(self.config.stream_host.clone());
        view
    }

    fn publish_state(&self, state: &BrowserSessionState) {
        let channel = Channel::SessionBrowserState {
            uuid: state.session_id.clone(),
        };
        if let Ok(fields) = serde_json::to_value(self.state_view(state)) {
            self.bus.publish_patch(&channel, &Patch::new(fields));
        }
    }

    async fn publish_current(&self, session_id: &str) -> Result<()> {
        if let Some(state) = self.repo.get(session_id).await? {
            self.publish_state(&state);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Viewer reference counting
    // ------------------------------------------------------------------

    /// First viewer joins: want the daemon running.
    pub async fn subscribe(self: &Arc<Self>, session_id: &str) -> Result<()> {
        let previous = {
            let mut count = self.viewers.entry(session_id.to_string()).or_insert(0);
            let previous = *count;
            *count += 1;
            previous
        };

        if previous == 0 {
            info!(session_id, "first browser viewer; requesting daemon");
            self.repo.get_or_create(session_id).await?;
            if let Err(err) = self.controller.launch(session_id).await {
                debug!(session_id, "viewport launch signal failed: {err}");
            }
            self.repo.set_desired(session_id, DesiredState::Running).await?;
            self.publish_current(session_id).await?;

            let this = Arc::clone(self);
            let session_id = session_id.to_string();
            tokio::spawn(async move {
                if let Err(err) = this.reconcile(&session_id).await {
                    warn!(session_id, "eager reconcile failed: {err:#}");
                }
            });
        }
        Ok(())
    }

    /// Last viewer leaves: debounce, then want the daemon stopped.
    pub async fn unsubscribe(self: &Arc<Self>, session_id: &str) -> Result<()> {
        let remaining = {
            let Some(mut count) = self.viewers.get_mut(session_id) else {
                return Ok(());
            };
            *count = count.saturating_sub(1);
            *count
        };

        if remaining == 0 {
            let this = Arc::clone(self);
            let session_id = session_id.to_string();
            let delay = self.config.cleanup_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let still_zero = this
                    .viewers
                    .get(&session_id)
                    .map(|count| *count == 0)
                    .unwrap_or(true);
                if !still_zero {
                    return;
                }
                debug!(session_id, "browser viewer debounce expired; stopping");
                if let Err(err) = this
                    .repo
                    .set_desired(&session_id, DesiredState::Stopped)
                    .await
                {
                    warn!(session_id, "failed to set desired=stopped: {err:#}");
                    return;
                }
                let _ = this.publish_current(&session_id).await;
                if let Err(err) = this.reconcile(&session_id).await {
                    warn!(session_id, "cleanup reconcile failed: {err:#}");
                }
            });
        }
        Ok(())
    }

    pub fn viewer_count(&self, session_id: &str) -> usize {
        self.viewers.get(session_id).map(|c| *c).unwrap_or(0)
    }

    // ------------------------------------------------------------------
    // Frame cache
    // ------------------------------------------------------------------

    /// Memoize the latest frame so new subscribers are never blank.
    pub fn record_frame(&self, session_id: &str, payload: String) {
        let snapshot = FrameSnapshot {
            last_frame: Some(payload),
            timestamp: Some(Utc::now()),
        };
        self.frames.insert(session_id.to_string(), snapshot);
    }

    pub fn last_frame(&self, session_id: &str) -> FrameSnapshot {
        self.frames
            .get(session_id)
            .map(|snapshot| snapshot.clone())
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------

    /// Drive one session one step toward its desired state.
    pub async fn reconcile(&self, session_id: &str) -> Result<()> {
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        let state = self.repo.get_or_create(session_id).await?;
        let action = select_action(
            state.desired,
            state.actual,
            state.retry_count,
            self.config.max_retries,
        );
        debug!(session_id, ?action, desired = %state.desired, actual = %state.actual, "reconcile");

        match action {
            Action::NoOp => Ok(()),
            Action::StartDaemon => self.start_daemon(&state).await,
            Action::WaitForReady => self.wait_for_ready(&state).await,
            Action::CheckAlive => self.check_alive(&state).await,
            Action::ResetToStopped => self.reset_to_stopped(&state).await,
            Action::StopDaemon => self.stop_daemon(&state).await,
            Action::WaitForStopped => self.wait_for_stopped(&state).await,
        }
    }

    /// Reconcile every known session, collecting failures without stopping.
    pub async fn reconcile_all(&self, cancel: &CancellationToken) -> Result<()> {
        let states = self.repo.list().await?;
        let mut failures = Vec::new();

        for state in states {
            if cancel.is_cancelled() {
                break;
            }
            if let Err(err) = self.reconcile(&state.session_id).await {
                warn!(session_id = %state.session_id, "reconcile failed: {err:#}");
                failures.push(ReconcileFailure {
                    session_id: state.session_id.clone(),
                    error: format!("{err:#}"),
                });
            }
        }

        if !failures.is_empty() {
            let _ = self.errors_tx.send(failures);
        }
        Ok(())
    }

    /// Tick `reconcile_all` until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.reconcile_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("browser reconciler stopping");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.reconcile_all(&cancel).await {
                        warn!("reconcile pass failed: {err:#}");
                    }
                }
            }
        }
    }

    async fn start_daemon(&self, state: &BrowserSessionState) -> Result<()> {
        let session_id = &state.session_id;
        let retry = self.repo.increment_retry(session_id).await?;

        let port = match state.stream_port_u16() {
            Some(existing) => existing,
            None => {
                let port = match self.allocator.allocate(PortKind::Stream) {
                    Ok(port) => port,
                    Err(err) => {
                        self.repo.set_error(session_id, Some(&err.to_string())).await?;
                        self.repo.set_actual(session_id, ActualState::Error).await?;
                        self.publish_current(session_id).await?;
                        return Err(err.into());
                    }
                };
                self.reservations
                    .insert(session_id, port, PortKind::Stream)
                    .await?;
                self.repo.set_stream_port(session_id, Some(port)).await?;
                port
            }
        };

        self.repo.set_actual(session_id, ActualState::Starting).await?;
        self.publish_current(session_id).await?;
        info!(session_id, port, retry, "starting browser daemon");

        match self.controller.start(session_id, state.last_url.as_deref()).await {
            Ok(reported) => {
                if reported != port {
                    // The daemon bound elsewhere; track the port it actually
                    // serves so the reservation matches reality.
                    debug!(session_id, port, reported, "daemon reported different port");
                    self.reservations.delete(port, PortKind::Stream).await?;
                    self.allocator.release(port, PortKind::Stream);
                    if self.allocator.range().contains(reported) {
                        self.allocator.reserve(reported, PortKind::Stream);
                    }
                    self.reservations
                        .insert(session_id, reported, PortKind::Stream)
                        .await?;
                    self.repo.set_stream_port(session_id, Some(reported)).await?;
                    self.publish_current(session_id).await?;
                }
                Ok(())
            }
            Err(err) => {
                warn!(session_id, "daemon start failed: {err}");
                self.release_port(Some(port)).await?;
                self.repo.set_stream_port(session_id, None).await?;
                self.repo.set_error(session_id, Some(&err.to_string())).await?;
                self.repo.set_actual(session_id, ActualState::Error).await?;
                self.publish_current(session_id).await?;
                Ok(())
            }
        }
    }

    async fn wait_for_ready(&self, state: &BrowserSessionState) -> Result<()> {
        let session_id = &state.session_id;
        match self.controller.get_status(session_id).await {
            Ok(Some(status)) if status.ready => {
                self.repo.set_actual(session_id, ActualState::Running).await?;
                self.repo.set_error(session_id, None).await?;
                self.publish_current(session_id).await?;
                info!(session_id, "browser daemon ready");

                if let Some(ref url) = state.last_url {
                    if let Err(err) = self.controller.navigate(session_id, url).await {
                        warn!(session_id, url, "initial navigation failed: {err}");
                        self.repo.set_error(session_id, Some(&err.to_string())).await?;
                        self.publish_current(session_id).await?;
                    }
                }
                Ok(())
            }
            Ok(Some(_)) => Ok(()),
            Ok(None) => {
                // Daemon vanished mid-start; back to stopped so a
                // still-desired session gets another start.
                warn!(session_id, "daemon disappeared while starting");
                self.release_port(state.stream_port_u16()).await?;
                self.repo.set_stream_port(session_id, None).await?;
                self.repo.set_actual(session_id, ActualState::Stopped).await?;
                self.publish_current(session_id).await?;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn check_alive(&self, state: &BrowserSessionState) -> Result<()> {
        let session_id = &state.session_id;
        match self.controller.get_status(session_id).await {
            Ok(Some(status)) if status.running => {
                self.repo.set_actual(session_id, ActualState::Running).await?;
                Ok(())
            }
            Ok(_) => {
                warn!(session_id, "daemon no longer running; marking stopped");
                self.release_port(state.stream_port_u16()).await?;
                self.repo.set_stream_port(session_id, None).await?;
                self.repo.set_actual(session_id, ActualState::Stopped).await?;
                self.publish_current(session_id).await?;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn reset_to_stopped(&self, state: &BrowserSessionState) -> Result<()> {
        let session_id = &state.session_id;
        self.release_port(state.stream_port_u16()).await?;
        self.repo.set_stream_port(session_id, None).await?;
        self.repo.set_actual(session_id, ActualState::Stopped).await?;
        self.publish_current(session_id).await?;
        Ok(())
    }

    async fn stop_daemon(&self, state: &BrowserSessionState) -> Result<()> {
        let session_id = &state.session_id;

        // Preserve where the user was for the next start.
        match self.controller.get_current_url(session_id).await {
            Ok(Some(url)) if !url.trim().is_empty() => {
                self.repo.set_last_url(session_id, &url).await?;
            }
            Ok(_) => {}
            Err(err) => debug!(session_id, "could not read current url: {err}"),
        }

        self.repo.set_actual(session_id, ActualState::Stopping).await?;
        self.publish_current(session_id).await?;

        match self.controller.stop(session_id).await {
            Ok(()) => {
                self.release_port(state.stream_port_u16()).await?;
                self.repo.mark_stopped(session_id).await?;
                self.publish_current(session_id).await?;
                info!(session_id, "browser daemon stopped");
                Ok(())
            }
            Err(err) => {
                warn!(session_id, "daemon stop failed: {err}");
                self.repo.set_error(session_id, Some(&err.to_string())).await?;
                self.publish_current(session_id).await?;
                Ok(())
            }
        }
    }

    async fn wait_for_stopped(&self, state: &BrowserSessionState) -> Result<()> {
        let session_id = &state.session_id;
        match self.controller.get_status(session_id).await {
            Ok(Some(status)) if status.running => Ok(()),
            Ok(_) => {
                self.release_port(state.stream_port_u16()).await?;
                self.repo.mark_stopped(session_id).await?;
                self.publish_current(session_id).await?;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn release_port(&self, port: Option<u16>) -> Result<()> {
        if let Some(port) = port {
            self.reservations.delete(port, PortKind::Stream).await?;
            self.allocator.release(port, PortKind::Stream);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Direct controls
    // ------------------------------------------------------------------

    /// Unconditional teardown used by session cleanup. Idempotent.
    pub async fn force_stop(&self, session_id: &str) -> Result<()> {
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        let Some(state) = self.repo.get(session_id).await? else {
            return Ok(());
        };

        if let Err(err) = self.controller.stop(session_id).await {
            warn!(session_id, "force stop: daemon stop failed: {err}");
        }
        self.release_port(state.stream_port_u16()).await?;
        self.repo.set_desired(session_id, DesiredState::Stopped).await?;
        self.repo.mark_stopped(session_id).await?;
        self.publish_current(session_id).await?;

        self.viewers.remove(session_id);
        self.frames.remove(session_id);
        self.locks.remove(session_id);
        Ok(())
    }

    /// Operator reset out of the parked error state.
    pub async fn reset(&self, session_id: &str) -> Result<()> {
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;
        self.repo.reset(session_id).await?;
        self.publish_current(session_id).await?;
        Ok(())
    }

    /// Navigate the running daemon and remember the destination.
    pub async fn navigate(&self, session_id: &str, url: &str) -> Result<(), LabError> {
        self.controller.navigate(session_id, url).await?;
        if let Err(err) = self.repo.set_last_url(session_id, url).await {
            warn!(session_id, "failed to persist last url: {err:#}");
        }
        Ok(())
    }

    /// Pass a viewer input command through to the daemon.
    pub async fn execute_command(
        &self,
        session_id: &str,
        command: Value,
    ) -> Result<Value, LabError> {
        let result = self.controller.execute_command(session_id, command).await?;
        serde_json::to_value(&result).map_err(|e| LabError::InvalidResponse {
            detail: e.to_string(),
        })
    }
}
