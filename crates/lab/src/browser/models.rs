//! Browser session state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use lab_protocol::views::BrowserStateView;

/// What the viewers want.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    Stopped,
    Running,
}

impl std::fmt::Display for DesiredState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DesiredState::Stopped => write!(f, "stopped"),
            DesiredState::Running => write!(f, "running"),
        }
    }
}

impl std::str::FromStr for DesiredState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stopped" => Ok(DesiredState::Stopped),
            "running" => Ok(DesiredState::Running),
            other => Err(format!("unknown desired state: {other}")),
        }
    }
}

impl TryFrom<String> for DesiredState {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

/// What the daemon is actually doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActualState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl ActualState {
    /// States during which the stream port reservation is held.
    pub fn holds_port(&self) -> bool {
        matches!(
            self,
            ActualState::Starting | ActualState::Running | ActualState::Stopping
        )
    }
}

impl std::fmt::Display for ActualState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActualState::Stopped => write!(f, "stopped"),
            ActualState::Starting => write!(f, "starting"),
            ActualState::Running => write!(f, "running"),
            ActualState::Stopping => write!(f, "stopping"),
            ActualState::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for ActualState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stopped" => Ok(ActualState::Stopped),
            "starting" => Ok(ActualState::Starting),
            "running" => Ok(ActualState::Running),
            "stopping" => Ok(ActualState::Stopping),
            "error" => Ok(ActualState::Error),
            other => Err(format!("unknown actual state: {other}")),
        }
    }
}

impl TryFrom<String> for ActualState {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

/// Persisted per-session browser state.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BrowserSessionState {
    pub session_id: String,
    #[sqlx(try_from = "String")]
    pub desired: DesiredState,
    #[sqlx(try_from = "String")]
    pub actual: ActualState,
    pub stream_port: Option<i64>,
    pub last_url: Option<String>,
    pub retry_count: i64,
    pub error_message: Option<String>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

impl BrowserSessionState {
    pub fn stream_port_u16(&self) -> Option<u16> {
        self.stream_port.and_then(|p| u16::try_from(p).ok())
    }

    pub fn view(&self) -> BrowserStateView {
        BrowserStateView {
            session_id: self.session_id.clone(),
            desired: self.desired.to_string(),
            actual: self.actual.to_string(),
            stream_port: self.stream_port_u16(),
            stream_host: None,
            last_url: self.last_url.clone(),
            retry_count: self.retry_count,
            error_message: self.error_message.clone(),
        }
    }
}

/// The next move the reconciler should make for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    StartDaemon,
    WaitForReady,
    CheckAlive,
    ResetToStopped,
    StopDaemon,
    WaitForStopped,
    NoOp,
}

/// Pick the action for a `(desired, actual)` pair.
///
/// Pure so the whole decision table is unit-testable; the reconciler owns
/// the side effects.
pub fn select_action(
    desired: DesiredState,
    actual: ActualState,
    retry_count: i64,
    max_retries: u32,
) -> Action {
    if actual == ActualState::Error && retry_count >= i64::from(max_retries) {
        return Action::NoOp;
    }

    match (desired, actual) {
        (DesiredState::Running, ActualState::Stopped) => Action::StartDaemon,
        (DesiredState::Running, ActualState::Starting) => Action::WaitForReady,
        (DesiredState::Running, ActualState::Running) => Action::CheckAlive,
        (DesiredState::Running, ActualState::Error) => Action::ResetToStopped,
        (DesiredState::Running, ActualState::Stopping) => Action::WaitForStopped,
        (DesiredState::Stopped, ActualState::Running) => Action::StopDaemon,
        (DesiredState::Stopped, ActualState::Starting) => Action::StopDaemon,
        (DesiredState::Stopped, ActualState::Stopping) => Action::WaitForStopped,
        (DesiredState::Stopped, ActualState::Stopped) => Action::NoOp,
        (DesiredState::Stopped, ActualState::Error) => Action::NoOp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converged_state_is_noop() {
        assert_eq!(
            select_action(DesiredState::Stopped, ActualState::Stopped, 0, 3),
            Action::NoOp
        );
        assert_eq!(
            select_action(DesiredState::Running, ActualState::Running, 0, 3),
            Action::CheckAlive
        );
    }

    #[test]
    fn start_when_wanted_and_stopped() {
        assert_eq!(
            select_action(DesiredState::Running, ActualState::Stopped, 0, 3),
            Action::StartDaemon
        );
    }

    #[test]
    fn error_resets_until_retries_exhausted() {
        assert_eq!(
            select_action(DesiredState::Running, ActualState::Error, 2, 3),
            Action::ResetToStopped
        );
        assert_eq!(
            select_action(DesiredState::Running, ActualState::Error, 3, 3),
            Action::NoOp
        );
        assert_eq!(
            select_action(DesiredState::Running, ActualState::Error, 7, 3),
            Action::NoOp
        );
    }

    #[test]
    fn stop_cancels_inflight_start() {
        assert_eq!(
            select_action(DesiredState::Stopped, ActualState::Starting, 0, 3),
            Action::StopDaemon
        );
        assert_eq!(
            select_action(DesiredState::Stopped, ActualState::Running, 0, 3),
            Action::StopDaemon
        );
        assert_eq!(
            select_action(DesiredState::Stopped, ActualState::Stopping, 0, 3),
            Action::WaitForStopped
        );
    }

    #[test]
    fn port_holding_states() {
        assert!(!ActualState::Stopped.holds_port());
        assert!(ActualState::Starting.holds_port());
        assert!(ActualState::Running.holds_port());
        assert!(ActualState::Stopping.holds_port());
        assert!(!ActualState::Error.holds_port());
    }
}
