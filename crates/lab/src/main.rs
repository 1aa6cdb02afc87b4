use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use lab::api::{self, AppState};
use lab::browser::{
    BrowserOrchestrator, BrowserStateRepository, DaemonController, HttpDaemonController,
};
use lab::bus::{ChannelBus, LiveStores, SnapshotLoaders};
use lab::db::Database;
use lab::events::AgentEventRepository;
use lab::github::GithubSettingsRepository;
use lab::monitor::ContainerEventMonitor;
use lab::orchestrate::{OrchestrationRepository, OrchestrationService};
use lab::ports::{PortAllocator, PortReservationRepository};
use lab::project::ProjectRepository;
use lab::proxy::{proxy_app, ProxyContext, ProxyRouter};
use lab::sandbox::{DockerCli, SandboxProvider};
use lab::session::{SessionRepository, SessionService};
use lab::settings::Settings;
use lab::sse::EventRing;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "lab - background-agent platform server",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<String>,
    /// Reduce output to only errors
    #[arg(short, long, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the API server, subdomain proxy, and reconcilers
    Serve(ServeCommand),
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Host address to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
    /// API port (overrides configuration)
    #[arg(long)]
    api_port: Option<u16>,
    /// Proxy port (overrides configuration)
    #[arg(long)]
    proxy_port: Option<u16>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.common)?;

    let mut settings =
        Settings::load(cli.common.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Command::Serve(cmd) => {
            if let Some(port) = cmd.api_port {
                settings.api_port = port;
            }
            if let Some(port) = cmd.proxy_port {
                settings.proxy_port = port;
            }
            run_serve(settings, cmd.host)
        }
    }
}

fn init_logging(opts: &CommonOpts) -> Result<()> {
    let default = if opts.quiet {
        "error"
    } else {
        match opts.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_log::LogTracer::init().context("installing log bridge")?;
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("installing tracing subscriber")?;
    Ok(())
}

#[tokio::main]
async fn run_serve(settings: Settings, host: String) -> Result<()> {
    info!(
        api_port = settings.api_port,
        proxy_port = settings.proxy_port,
        base_domain = %settings.proxy_base_domain,
        "starting lab server"
    );

    let db = Database::connect(&settings.database_url).await?;
    let pool = db.pool().clone();

    let provider: Arc<dyn SandboxProvider> =
        Arc::new(DockerCli::new(settings.sandbox_endpoint.clone()));
    match provider.health_check().await {
        Ok(_) => info!("sandbox provider reachable"),
        Err(err) => warn!("sandbox provider health check failed: {err}"),
    }

    // Port allocator, rehydrated from persisted reservations.
    let allocator = Arc::new(PortAllocator::new(settings.stream_port_range));
    let reservations = PortReservationRepository::new(pool.clone());
    let rehydrated = reservations.rehydrate(&allocator).await?;
    if rehydrated > 0 {
        info!(count = rehydrated, "rehydrated port reservations");
    }

    let router = Arc::new(ProxyRouter::new(settings.proxy_base_domain.clone()));
    let bus = Arc::new(ChannelBus::new());
    let live = Arc::new(LiveStores::new());

    let browser_repo = BrowserStateRepository::new(pool.clone());
    let swept = browser_repo.reset_transitional().await?;
    if swept > 0 {
        info!(count = swept, "reset interrupted browser sessions");
    }
    let controller = Arc::new(HttpDaemonController::new(settings.browser_api_url.clone()));
    if !controller.is_healthy().await {
        warn!(url = %settings.browser_api_url, "browser daemon API unreachable");
    }
    let browser = BrowserOrchestrator::new(
        browser_repo,
        controller,
        allocator.clone(),
        reservations.clone(),
        bus.clone(),
        lab::browser::BrowserOrchestratorConfig {
            reconcile_interval: Duration::from_millis(settings.reconcile_interval_ms),
            cleanup_delay: Duration::from_millis(settings.browser_cleanup_delay_ms),
            max_retries: settings.max_daemon_retries,
            stream_host: settings.browser_ws_host.clone(),
        },
    );

    // Surface aggregated reconcile failures in the log.
    let mut reconcile_errors = browser.on_error();
    tokio::spawn(async move {
        while let Ok(failures) = reconcile_errors.recv().await {
            for failure in failures {
                warn!(session_id = %failure.session_id, "reconcile error: {}", failure.error);
            }
        }
    });

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
        settings.shared_volumes.clone(),
    );

    let orchestration = OrchestrationService::new(
        OrchestrationRepository::new(pool.clone()),
        project_repo.clone(),
        sessions.clone(),
        bus.clone(),
    );

    let snapshots = Arc::new(SnapshotLoaders {
        sessions: session_repo.clone(),
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
        bus: bus.clone(),
        live: live.clone(),
        snapshots,
        router: router.clone(),
        github: GithubSettingsRepository::new(pool.clone()),
        auth_events: Arc::new(EventRing::new()),
        provider: provider.clone(),
    };

    // Finish whatever a previous process left half-done.
    sessions.recover().await?;

    let cancel = CancellationToken::new();

    let monitor = ContainerEventMonitor::new(
        provider.clone(),
        session_repo,
        bus.clone(),
        live.clone(),
    );
    tokio::spawn(monitor.run(cancel.clone()));
    tokio::spawn(browser.clone().run(cancel.clone()));

    let api_addr: SocketAddr = format!("{host}:{}", settings.api_port)
        .parse()
        .context("parsing API bind address")?;
    let proxy_addr: SocketAddr = format!("{host}:{}", settings.proxy_port)
        .parse()
        .context("parsing proxy bind address")?;

    let api_listener = TcpListener::bind(api_addr)
        .await
        .with_context(|| format!("binding API listener on {api_addr}"))?;
    let proxy_listener = TcpListener::bind(proxy_addr)
        .await
        .with_context(|| format!("binding proxy listener on {proxy_addr}"))?;
    info!(%api_addr, %proxy_addr, "listeners bound");

    let api_router = api::create_router(state);
    let proxy_router = proxy_app(ProxyContext::new(
        router,
        Duration::from_secs(settings.proxy_idle_timeout_secs),
    ));

    let api_cancel = cancel.clone();
    let api_task = tokio::spawn(async move {
        axum::serve(api_listener, api_router)
            .with_graceful_shutdown(async move { api_cancel.cancelled().await })
            .await
    });
    let proxy_cancel = cancel.clone();
    let proxy_task = tokio::spawn(async move {
        // Connect info feeds the proxy's X-Forwarded-For chain.
        axum::serve(
            proxy_listener,
            proxy_router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { proxy_cancel.cancelled().await })
        .await
    });

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown signal received");
    cancel.cancel();

    api_task.await.context("API server task")??;
    proxy_task.await.context("proxy server task")??;

    info!("lab server stopped");
    Ok(())
}
