use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use tm_bus::{Bus, MemoryBus};
use tm_domain::config::ConfigSeverity;
use tm_domain::{Config, ProcessMode};
use tm_provider::ChatClient;
use tm_wire::IdentityNature;

use tm_runtime::dispatch::Dispatcher;
use tm_runtime::heartbeat::HeartbeatTask;
use tm_runtime::http;
use tm_runtime::identity::IdentityManager;
use tm_runtime::reconcile::Reconciler;
use tm_runtime::sessions::stdio::StdioSession;
use tm_runtime::sessions::SessionManager;
use tm_runtime::state::AppState;
use tm_runtime::view::SessionIdentity;

#[derive(Debug, Parser)]
#[command(name = "toolmeshd", about = "toolmesh edge runtime")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Run the runtime (default).
    Serve,
    /// Print the version and exit.
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing();
            let config = Arc::new(Config::from_env());
            run(config).await
        }
        Some(Command::Version) => {
            println!("toolmeshd {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tm_runtime=debug")),
        )
        .json()
        .init();
}

/// The bus client is wired in here. The in-process bus backs tests and
/// standalone mode; any other scheme requires an external bus client build.
fn connect_bus(config: &Config) -> anyhow::Result<Arc<dyn Bus>> {
    if config.bus_url.starts_with("mem://") || config.bus_url.starts_with("bus://") {
        Ok(Arc::new(MemoryBus::new()))
    } else {
        anyhow::bail!("unsupported bus scheme in BUS_URL: {}", config.bus_url)
    }
}

async fn run(config: Arc<Config>) -> anyhow::Result<()> {
    let mode = config.mode();
    tracing::info!(mode = %mode, "toolmesh runtime starting");

    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── Bus + identity ───────────────────────────────────────────────
    let bus = connect_bus(&config)?;
    let identity_manager = Arc::new(
        IdentityManager::load_from_environment(bus.clone(), &config)
            .context("loading credentials")?,
    );

    match mode {
        ProcessMode::EdgeStream => run_edge(config, bus, identity_manager).await,
        ProcessMode::StandaloneStream => run_standalone(config, bus).await,
        ProcessMode::StdioMcp => run_stdio(config, bus, identity_manager).await,
    }
}

/// Full edge runtime: runtime handshake, heartbeat, reconciler, dispatcher,
/// and both HTTP transports.
async fn run_edge(
    config: Arc<Config>,
    bus: Arc<dyn Bus>,
    identity_manager: Arc<IdentityManager>,
) -> anyhow::Result<()> {
    let runtime_key = config
        .runtime_key
        .clone()
        .context("edge mode requires RUNTIME_KEY")?;
    let identity = identity_manager
        .handshake(
            &runtime_key,
            IdentityNature::Runtime,
            config.runtime_name.as_deref(),
        )
        .await
        .context("runtime handshake")?;

    let heartbeat = Arc::new(HeartbeatTask::start(
        bus.clone(),
        &identity,
        config.heartbeat_interval,
    ));

    let dispatcher = Arc::new(Dispatcher::new(
        bus.clone(),
        identity_manager.executed_by(),
        Some(identity.workspace_id.clone()),
        Some(identity.id.clone()),
    ));

    let llm = ChatClient::new(&config.llm_base_url, config.llm_api_key.clone())
        .context("building LLM client")?;
    let reconciler = Reconciler::new(
        bus.clone(),
        dispatcher.clone(),
        llm,
        identity.workspace_id.clone(),
        identity.id.clone(),
    );
    let reconciler_task = reconciler.run();

    let sessions = SessionManager::new(
        bus.clone(),
        config.call_tool_timeout,
        true,
        identity.workspace_id.clone(),
        identity.name.clone(),
    );

    serve_http(config.clone(), sessions.clone()).await?;

    // ── Shutdown: top-down, tolerating per-step errors ──────────────
    tracing::info!("shutting down");
    sessions.close_all();
    reconciler.shutdown().await;
    reconciler_task.abort();
    dispatcher.shutdown().await;
    heartbeat.shutdown().await;
    Ok(())
}

/// HTTP transports without authentication enforcement and without a
/// control plane.
async fn run_standalone(config: Arc<Config>, bus: Arc<dyn Bus>) -> anyhow::Result<()> {
    let sessions = SessionManager::new(
        bus,
        config.call_tool_timeout,
        false,
        config.workspace_or_default(),
        config.toolset_name.clone().unwrap_or_else(|| "standalone".into()),
    );

    serve_http(config, sessions.clone()).await?;

    tracing::info!("shutting down");
    sessions.close_all();
    Ok(())
}

/// Stdio MCP server for one toolset. When a runtime key is also configured
/// the reconciler and dispatcher run alongside, and client roots propagate
/// to stdio providers.
async fn run_stdio(
    config: Arc<Config>,
    bus: Arc<dyn Bus>,
    identity_manager: Arc<IdentityManager>,
) -> anyhow::Result<()> {
    // Refuse to start without a valid toolset identity.
    let key = config
        .master_key
        .clone()
        .or_else(|| config.toolset_key.clone())
        .context("stdio mode requires MASTER_KEY or TOOLSET_KEY")?;
    let name = config
        .toolset_name
        .clone()
        .or_else(|| config.tool_set.clone());
    let toolset = identity_manager
        .handshake(&key, IdentityNature::Toolset, name.as_deref())
        .await
        .context("toolset handshake")?;

    // Optional provider supervision next to the stdio session.
    let mut reconciler = None;
    let mut reconciler_task = None;
    let mut dispatcher = None;
    if let Some(runtime_key) = &config.runtime_key {
        let runtime = identity_manager
            .handshake(
                runtime_key,
                IdentityNature::Runtime,
                config.runtime_name.as_deref(),
            )
            .await
            .context("runtime handshake")?;
        let d = Arc::new(Dispatcher::new(
            bus.clone(),
            identity_manager.executed_by(),
            Some(runtime.workspace_id.clone()),
            Some(runtime.id.clone()),
        ));
        let llm = ChatClient::new(&config.llm_base_url, config.llm_api_key.clone())
            .context("building LLM client")?;
        let r = Reconciler::new(
            bus.clone(),
            d.clone(),
            llm,
            runtime.workspace_id.clone(),
            runtime.id,
        );
        reconciler_task = Some(r.run());
        reconciler = Some(r);
        dispatcher = Some(d);
    }

    let session_identity = SessionIdentity {
        workspace_id: toolset.workspace_id,
        target_id: toolset.id,
        name: toolset.name,
        skill_mode: false,
    };
    let session = StdioSession::new(
        bus,
        session_identity,
        config.call_tool_timeout,
        reconciler.clone(),
    );
    session.run().await.context("stdio session")?;

    tracing::info!("shutting down");
    if let Some(reconciler) = reconciler {
        reconciler.shutdown().await;
    }
    if let Some(task) = reconciler_task {
        task.abort();
    }
    if let Some(dispatcher) = dispatcher {
        dispatcher.shutdown().await;
    }
    Ok(())
}

/// Bind the shared HTTP server and serve until ctrl-c.
async fn serve_http(config: Arc<Config>, sessions: Arc<SessionManager>) -> anyhow::Result<()> {
    let state = AppState {
        config: config.clone(),
        sessions,
    };
    let app = http::router(state);

    let addr = format!("0.0.0.0:{}", config.remote_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!(addr = %addr, "toolmesh listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("ctrl-c received");
        })
        .await
        .context("http server error")?;
    Ok(())
}
