use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use clickup_orchestrator_core::model::CommandSpec;
use clickup_orchestrator_core::now_ms;
use clickup_orchestrator_daemon::clickup::ApiKey;
use clickup_orchestrator_daemon::config::{DaemonConfig, CLICKUP_API_BASE};
use clickup_orchestrator_daemon::db::Db;
use clickup_orchestrator_daemon::state::AppState;
use clickup_orchestrator_daemon::{api, scheduler};
use tokio::signal;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "clickup-orchestrator", version, about = "Runs coding agents for ClickUp tasks")]
struct Cli {
    /// Address the HTTP/WebSocket API listens on.
    #[arg(long, env = "ORCHESTRATOR_LISTEN", default_value = "127.0.0.1:5150")]
    listen: String,

    /// SQLite database file.
    #[arg(long, env = "ORCHESTRATOR_DB", default_value = ".orchestrator/orchestrator.db")]
    db: PathBuf,

    /// Seconds between ClickUp polls / admission passes.
    #[arg(long, env = "ORCHESTRATOR_POLL_INTERVAL_SECS", default_value_t = 5)]
    poll_interval_secs: u64,

    /// Seconds between SIGTERM and SIGKILL when stopping an agent.
    #[arg(long, env = "ORCHESTRATOR_KILL_GRACE_SECS", default_value_t = 5)]
    kill_grace_secs: u64,

    /// Output lines kept per terminal for reconnecting clients.
    #[arg(long, env = "ORCHESTRATOR_REPLAY_LINES", default_value_t = 2000)]
    replay_lines: usize,

    /// Minutes an idle refinement session is kept.
    #[arg(long, env = "ORCHESTRATOR_SESSION_IDLE_MINS", default_value_t = 240)]
    session_idle_mins: u64,

    #[arg(long, env = "CLICKUP_API_BASE", default_value = CLICKUP_API_BASE)]
    clickup_api_base: String,

    /// Env file loaded at startup; the setup flow writes the API key here.
    #[arg(long, env = "ORCHESTRATOR_ENV_FILE", default_value = ".env")]
    env_file: PathBuf,

    /// Run this program instead of the agent CLIs (development).
    #[arg(long, env = "ORCHESTRATOR_AGENT_PROGRAM")]
    agent_program: Option<String>,

    /// Argument for --agent-program; repeatable.
    #[arg(long = "agent-arg", requires = "agent_program", allow_hyphen_values = true)]
    agent_args: Vec<String>,

    /// Log filter (env-filter syntax); RUST_LOG wins when set.
    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Values from ./.env act as fallbacks for the flags below.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let env_loaded = match dotenvy::from_path(&cli.env_file) {
        Ok(()) => Ok(()),
        Err(e) if e.not_found() => Ok(()),
        Err(e) => Err(e),
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log));
    fmt().with_target(false).with_env_filter(filter).init();
    if let Err(e) = env_loaded {
        tracing::warn!(env_file = %cli.env_file.display(), error = %e, "failed to load env file");
    }

    let config = DaemonConfig {
        listen: cli.listen,
        db_path: cli.db,
        poll_interval: Duration::from_secs(cli.poll_interval_secs.max(1)),
        kill_grace: Duration::from_secs(cli.kill_grace_secs),
        replay_lines: cli.replay_lines,
        session_idle_ttl: Duration::from_secs(cli.session_idle_mins * 60),
        clickup_api_base: cli.clickup_api_base,
        env_file: cli.env_file,
        agent_command: cli
            .agent_program
            .map(|program| CommandSpec::new(program, cli.agent_args)),
    };
    info!(?config, "starting orchestrator");

    let db = Db::open(&config.db_path)?;
    let orphans = db.recover_orphans(now_ms())?;
    if !orphans.is_empty() {
        info!(?orphans, "tasks left running by a previous instance marked stopped");
    }

    let api_key = ApiKey::from_env();
    if !api_key.is_set() {
        info!("CLICKUP_API_KEY not set; ClickUp sync disabled until setup completes");
    }

    let state = AppState::start(config.clone(), db, api_key, None);
    scheduler::spawn_scheduler(state.tasks.clone(), config.poll_interval);

    let app = api::router(state.clone())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    info!("listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let killed = state.supervisor.kill_all().await;
    if killed > 0 {
        info!(killed, "waiting for agents to exit");
        tokio::time::sleep(config.kill_grace + Duration::from_secs(1)).await;
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
