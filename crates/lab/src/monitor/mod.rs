//! Container event monitor.
//!
//! One long-running task consumes the provider's label-filtered event
//! stream, folds actions into container statuses, and publishes deltas on
//! the affected session's container channel. The stream reconnects with
//! exponential backoff and never takes the process down with it.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use lab_protocol::{Channel, ListDelta};

use crate::bus::{ChannelBus, LiveStores};
use crate::sandbox::{ProviderEvent, SandboxProvider, LABEL_SESSION};
use crate::session::{ContainerStatus, SessionRepository};

/// First reconnect delay after a stream failure.
const RECONNECT_INITIAL: Duration = Duration::from_secs(1);
/// Reconnect delay ceiling.
const RECONNECT_MAX: Duration = Duration::from_secs(60);

/// Log source name for monitor lines.
const LOG_SOURCE: &str = "monitor";

/// Map a provider action onto a container status delta.
///
/// Unmapped actions (exec lifecycle, attach, ...) are ignored.
pub fn map_action(action: &str) -> Option<ContainerStatus> {
    match action {
        "start" => Some(ContainerStatus::Running),
        "stop" | "die" | "kill" => Some(ContainerStatus::Stopped),
        "restart" => Some(ContainerStatus::Starting),
        "oom" => Some(ContainerStatus::Error),
        action if action.starts_with("health_status") => {
            if action.contains("unhealthy") {
                Some(ContainerStatus::Error)
            } else {
                None
            }
        }
        _ => None,
    }
}

pub struct ContainerEventMonitor {
    provider: Arc<dyn SandboxProvider>,
    sessions: SessionRepository,
    bus: Arc<ChannelBus>,
    live: Arc<LiveStores>,
}

impl ContainerEventMonitor {
    pub fn new(
        provider: Arc<dyn SandboxProvider>,
        sessions: SessionRepository,
        bus: Arc<ChannelBus>,
        live: Arc<LiveStores>,
    ) -> Self {
        Self {
            provider,
            sessions,
            bus,
            live,
        }
    }

    /// Consume events until cancelled, reconnecting on stream failure.
    pub async fn run(self, cancel: CancellationToken) {
        let mut backoff = RECONNECT_INITIAL;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let mut stream = match self.provider.stream_events(LABEL_SESSION).await {
                Ok(stream) => {
                    info!("container event stream connected");
                    backoff = RECONNECT_INITIAL;
                    stream
                }
                Err(err) => {
                    warn!("event stream connect failed: {err}; retrying in {backoff:?}");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(RECONNECT_MAX);
                    continue;
                }
            };

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = stream.recv() => {
                        match event {
                            Some(event) => self.handle_event(event).await,
                            None => {
                                warn!("container event stream ended; reconnecting");
                                break;
                            }
                        }
                    }
                }
            }
        }
        info!("container event monitor stopping");
    }

    async fn handle_event(&self, event: ProviderEvent) {
        let Some(status) = map_action(&event.action) else {
            return;
        };
        let Some(session_id) = event.attributes.get(LABEL_SESSION) else {
            debug!(action = %event.action, "event without session label ignored");
            return;
        };

        let container = match self.sessions.container_by_runtime_id(&event.runtime_id).await {
            Ok(Some(container)) => container,
            Ok(None) => {
                debug!(runtime_id = %event.runtime_id, "event for unknown container");
                return;
            }
            Err(err) => {
                warn!("container lookup failed: {err:#}");
                return;
            }
        };

        if let Err(err) = self
            .sessions
            .update_container_status(&container.id, status)
            .await
        {
            warn!(container = %container.id, "status update failed: {err:#}");
            return;
        }

        debug!(
            session_id,
            container = %container.id,
            action = %event.action,
            %status,
            "observed container transition"
        );

        let mut view = container.view();
        view.status = status.to_string();
        if let Ok(item) = serde_json::to_value(view) {
            self.bus.publish_list_delta(
                &Channel::SessionContainers {
                    uuid: session_id.clone(),
                },
                &ListDelta::Update { item },
            );
        }

        let line = self.live.append_log(
            session_id,
            LOG_SOURCE,
            format!("container {} -> {}", container.hostname, status),
        );
        if let Ok(data) = serde_json::to_value(&line) {
            self.bus.publish_delta(
                &Channel::SessionLogs {
                    uuid: session_id.clone(),
                },
                json!({"type": "append", "source": LOG_SOURCE, "line": data}),
            );
        }
    }
}
