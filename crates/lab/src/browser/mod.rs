//! Browser orchestration: a desired/actual reconciler for per-session
//! headless-browser daemons.

mod controller;
mod models;
mod reconciler;
mod repository;

pub use controller::{CommandResult, DaemonController, DaemonStatus, HttpDaemonController};
pub use models::{select_action, Action, ActualState, BrowserSessionState, DesiredState};
pub use reconciler::{BrowserOrchestrator, BrowserOrchestratorConfig, ReconcileFailure};
pub use repository::BrowserStateRepository;
