//! Test utilities: in-memory database, stub provider/controller seams, and
//! a fully wired application.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use lab::api::{self, AppState};
use lab::browser::{
    BrowserOrchestrator, BrowserOrchestratorConfig, BrowserStateRepository, CommandResult,
    DaemonController, DaemonStatus,
};
use lab::bus::{ChannelBus, LiveStores, SnapshotLoaders};
use lab::db::Database;
use lab::error::{LabError, LabResult};
use lab::events::AgentEventRepository;
use lab::github::GithubSettingsRepository;
use lab::orchestrate::{OrchestrationRepository, OrchestrationService};
use lab::ports::{PortAllocator, PortReservationRepository};
use lab::project::ProjectRepository;
use lab::proxy::ProxyRouter;
use lab::sandbox::{
    ContainerInspect, ContainerSpec, ProviderError, ProviderErrorCode, ProviderEvent,
    ProviderResult, SandboxProvider,
};
use lab::session::{SessionRepository, SessionService};
use lab::settings::{PortRange, SharedVolumes};
use lab::sse::EventRing;

// Unused-by-some-binaries warnings are expected in a shared test module.
#[allow(dead_code)]
pub const BASE_DOMAIN: &str = "lab.test";

/// In-memory sandbox provider that records everything it is told to do.
#[derive(Default)]
pub struct StubProvider {
    next_id: AtomicU64,
    /// runtime id -> (spec, state string)
    pub containers: DashMap<String, (ContainerSpec, String)>,
    /// network name -> connected runtime ids
    pub networks: DashMap<String, Vec<String>>,
    pub volumes: DashMap<String, ()>,
    pub fail_create: AtomicBool,
    events_tx: Mutex<Option<mpsc::Sender<ProviderEvent>>>,
}

#[allow(dead_code)]
impl StubProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Feed an event into a stream previously opened by the monitor.
    pub async fn emit(&self, event: ProviderEvent) {
        let tx = self
            .events_tx
            .lock()
            .unwrap()
            .clone()
            .expect("no event stream open");
        tx.send(event).await.expect("event stream closed");
    }

    pub fn container_count(&self) -> usize {
        self.containers.len()
    }
}

#[async_trait]
impl SandboxProvider for StubProvider {
    async fn create_container(&self, spec: &ContainerSpec) -> ProviderResult<String> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ProviderError::new(
                ProviderErrorCode::CommandFailed,
                "stub create failure",
            ));
        }
        let id = format!("rt-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.containers
            .insert(id.clone(), (spec.clone(), "created".to_string()));
        Ok(id)
    }

    async fn start_container(&self, runtime_id: &str) -> ProviderResult<()> {
        let mut entry = self.containers.get_mut(runtime_id).ok_or_else(|| {
            ProviderError::new(ProviderErrorCode::NotFound, "no such container")
        })?;
        entry.1 = "running".to_string();
        Ok(())
    }

    async fn stop_container(&self, runtime_id: &str) -> ProviderResult<()> {
        if let Some(mut entry) = self.containers.get_mut(runtime_id) {
            entry.1 = "exited".to_string();
        }
        Ok(())
    }

    async fn remove_container(&self, runtime_id: &str, _force: bool) -> ProviderResult<()> {
        self.containers.remove(runtime_id);
        Ok(())
    }

    async fn inspect(&self, runtime_id: &str) -> ProviderResult<Option<ContainerInspect>> {
        Ok(self.containers.get(runtime_id).map(|entry| ContainerInspect {
            state: entry.1.clone(),
            ports: HashMap::new(),
        }))
    }

    async fn container_exists(&self, runtime_id: &str) -> ProviderResult<bool> {
        Ok(self.containers.contains_key(runtime_id))
    }

    async fn create_network(&self, name: &str) -> ProviderResult<()> {
        self.networks.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> ProviderResult<()> {
        self.networks.remove(name);
        Ok(())
    }

    async fn connect(
        &self,
        runtime_id: &str,
        network: &str,
        _aliases: &[String],
    ) -> ProviderResult<()> {
        self.networks
            .entry(network.to_string())
            .or_default()
            .push(runtime_id.to_string());
        Ok(())
    }

    async fn disconnect(&self, runtime_id: &str, network: &str) -> ProviderResult<()> {
        if let Some(mut members) = self.networks.get_mut(network) {
            members.retain(|member| member != runtime_id);
        }
        Ok(())
    }

    async fn is_connected(&self, runtime_id: &str, network: &str) -> ProviderResult<bool> {
        Ok(self
            .networks
            .get(network)
            .map(|members| members.iter().any(|member| member == runtime_id))
            .unwrap_or(false))
    }

    async fn create_volume(&self, name: &str) -> ProviderResult<()> {
        self.volumes.insert(name.to_string(), ());
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> ProviderResult<()> {
        self.volumes.remove(name);
        Ok(())
    }

    async fn stream_events(
        &self,
        _label_filter: &str,
    ) -> ProviderResult<mpsc::Receiver<ProviderEvent>> {
        let (tx, rx) = mpsc::channel(64);
        *self.events_tx.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn health_check(&self) -> ProviderResult<String> {
        Ok("stub".to_string())
    }
}

/// Scriptable daemon controller.
pub struct StubController {
    pub fail_start: AtomicBool,
    pub start_calls: AtomicU32,
    /// The port the fake daemon claims to bind.
    pub report_port: AtomicU32,
    pub daemons: DashMap<String, DaemonStatus>,
    pub current_urls: DashMap<String, String>,
    pub navigations: Mutex<Vec<(String, String)>>,
}

#[allow(dead_code)]
impl StubController {
    pub fn new(report_port: u16) -> Arc<Self> {
        Arc::new(Self {
            fail_start: AtomicBool::new(false),
            start_calls: AtomicU32::new(0),
            report_port: AtomicU32::new(u32::from(report_port)),
            daemons: DashMap::new(),
            current_urls: DashMap::new(),
            navigations: Mutex::new(Vec::new()),
        })
    }

    pub fn always_fail(self: &Arc<Self>) {
        self.fail_start.store(true, Ordering::SeqCst);
    }

    pub fn starts(&self) -> u32 {
        self.start_calls.load(Ordering::SeqCst)
    }

    /// Simulate a daemon crash.
    pub fn kill(&self, session_id: &str) {
        self.daemons.remove(session_id);
    }
}

#[async_trait]
impl DaemonController for StubController {
    async fn start(&self, session_id: &str, url: Option<&str>) -> LabResult<u16> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(LabError::DaemonStartFailed {
                session_id: session_id.to_string(),
                detail: "stub start failure".to_string(),
            });
        }
        let port = self.report_port.load(Ordering::SeqCst) as u16;
        self.daemons.insert(
            session_id.to_string(),
            DaemonStatus {
                running: true,
                ready: true,
                port,
            },
        );
        if let Some(url) = url {
            self.current_urls
                .insert(session_id.to_string(), url.to_string());
        }
        Ok(port)
    }

    async fn stop(&self, session_id: &str) -> LabResult<()> {
        self.daemons.remove(session_id);
        Ok(())
    }

    async fn navigate(&self, session_id: &str, url: &str) -> LabResult<()> {
        self.current_urls
            .insert(session_id.to_string(), url.to_string());
        self.navigations
            .lock()
            .unwrap()
            .push((session_id.to_string(), url.to_string()));
        Ok(())
    }

    async fn get_status(&self, session_id: &str) -> LabResult<Option<DaemonStatus>> {
        Ok(self.daemons.get(session_id).map(|status| *status))
    }

    async fn get_current_url(&self, session_id: &str) -> LabResult<Option<String>> {
        Ok(self.current_urls.get(session_id).map(|url| url.clone()))
    }

    async fn launch(&self, _session_id: &str) -> LabResult<()> {
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        true
    }

    async fn execute_command(&self, _session_id: &str, command: Value) -> LabResult<CommandResult> {
        Ok(CommandResult {
            id: "stub".to_string(),
            success: true,
            data: Some(command),
            error: None,
        })
    }
}

/// A fully wired application over stubs and an in-memory database.
pub struct TestApp {
    pub router: axum::Router,
    pub state: AppState,
    pub provider: Arc<StubProvider>,
    pub controller: Arc<StubController>,
    pub allocator: Arc<PortAllocator>,
    pub reservations: PortReservationRepository,
    pub browser: Arc<BrowserOrchestrator>,
    pub sessions: Arc<SessionService>,
}

#[allow(dead_code)]
pub async fn test_app() -> TestApp {
    test_app_with(TestOptions::default()).await
}

#[derive(Clone)]
pub struct TestOptions {
    pub port_range: PortRange,
    pub cleanup_delay: Duration,
    pub max_retries: u32,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            port_range: PortRange { lo: 9300, hi: 9500 },
            cleanup_delay: Duration::from_millis(50),
            max_retries: 3,
        }
    }
}

pub async fn test_app_with(options: TestOptions) -> TestApp {
    let db = Database::in_memory().await.unwrap();
    let pool = db.pool().clone();

    let provider = StubProvider::new();
    let controller = StubController::new(options.port_range.lo);

    let allocator = Arc::new(PortAllocator::new(options.port_range));
    let reservations = PortReservationRepository::new(pool.clone());
    let router = Arc::new(ProxyRouter::new(BASE_DOMAIN));
    let bus = Arc::new(ChannelBus::new());
    let live = Arc::new(LiveStores::new());

    let browser = BrowserOrchestrator::new(
        BrowserStateRepository::new(pool.clone()),
        controller.clone(),
        allocator.clone(),
        reservations.clone(),
        bus.clone(),
        BrowserOrchestratorConfig {
            reconcile_interval: Duration::from_millis(20),
            cleanup_delay: options.cleanup_delay,
            max_retries: options.max_retries,
            stream_host: "127.0.0.1".to_string(),
        },
    );

    let session_repo = SessionRepository::new(pool.clone());
    let project_repo = ProjectRepository::new(pool.clone());
    let event_repo = AgentEventRepository::new(pool.clone());
    let sessions = SessionService::new(
        session_repo.clone(),
        project_repo.clone(),
        event_repo.clone(),
        provider.clone(),
        router.clone(),
        bus.clone(),
        browser.clone(),
        live.clone(),
        SharedVolumes::default(),
    );

    let orchestration = OrchestrationService::new(
        OrchestrationRepository::new(pool.clone()),
        project_repo.clone(),
        sessions.clone(),
        bus.clone(),
    );

    let snapshots = Arc::new(SnapshotLoaders {
        sessions: session_repo,
        projects: project_repo,
        events: event_repo,
        browser: browser.clone(),
        orchestration: orchestration.clone(),
        router: router.clone(),
        live: live.clone(),
    });

    let state = AppState {
        sessions: sessions.clone(),
        browser: browser.clone(),
        orchestration,
        bus,
        live,
        snapshots,
        router,
        github: GithubSettingsRepository::new(pool.clone()),
        auth_events: Arc::new(EventRing::new()),
        provider: provider.clone(),
    };

    TestApp {
        router: api::create_router(state.clone()),
        state,
        provider,
        controller,
        allocator,
        reservations,
        browser,
        sessions,
    }
}

/// Seed a project with one container definition and the given ports.
#[allow(dead_code)]
pub async fn seed_project(app: &TestApp, name: &str, pool_size: i64, ports: &[u16]) -> String {
    let project = app
        .sessions
        .project_repo()
        .create(
            name,
            Some("Prefer small, verified changes."),
            pool_size,
            &[("lab-agent:latest".to_string(), None, ports.to_vec())],
        )
        .await
        .unwrap();
    project.id
}

/// Poll until a predicate over the app holds or the deadline passes.
#[allow(dead_code)]
pub async fn wait_until<F, Fut>(deadline: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    loop {
        if check().await {
            return true;
        }
        if start.elapsed() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
