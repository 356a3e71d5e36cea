use anyhow::Context;
use clap::Parser;
use cronctl_cache::{Bucketizer, MemoryCache};
use cronctl_core::config::CronctlConfig;
use cronctl_scheduler::ActionRegistry;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

mod app;
mod cli;
mod http;

use cli::{Cli, Commands};

/// Cache key of the published cron-array view.
const CRON_VIEW_KEY: &str = "cron_array";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "cronctl_gateway=info,cronctl_scheduler=info,tower_http=debug".into()
            }),
        )
        .init();

    let cli = Cli::parse();

    // load config: --config > CRONCTL_CONFIG env > ~/.cronctl/cronctl.toml
    let config_path = cli
        .config
        .clone()
        .or_else(|| std::env::var("CRONCTL_CONFIG").ok());
    let config = CronctlConfig::load(config_path.as_deref())?;

    let state = Arc::new(build_state(config)?);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(state).await,
        Commands::Events(command) => cli::run_events(&state, command).await,
        Commands::Legacy(command) => cli::run_legacy(&state, command),
    }
}

/// Open the database and wire every component over it.
///
/// The standalone gateway only carries the internal handlers; user actions
/// are registered by whatever process embeds the scheduler.
fn build_state(config: CronctlConfig) -> anyhow::Result<app::AppState> {
    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, backend = ?config.database.backend, "opening SQLite database");

    let db = rusqlite::Connection::open(db_path)
        .with_context(|| format!("opening database at {db_path}"))?;
    db.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;

    let view = Arc::new(Bucketizer::new(
        Arc::new(MemoryCache::new()),
        CRON_VIEW_KEY,
        &config.cache,
    ));
    let store = cronctl_store::open_observed(config.database.backend, db, view.clone())?;
    info!("database migrations complete");

    let registry = Arc::new(ActionRegistry::new());
    app::AppState::new(config, store, registry, view)
}

async fn serve(state: Arc<app::AppState>) -> anyhow::Result<()> {
    let now = chrono::Utc::now().timestamp();
    let scheduled = state.supervisor.ensure_scheduled(now)?;
    info!(scheduled, "internal events checked");

    let addr: SocketAddr =
        format!("{}:{}", state.config.gateway.bind, state.config.gateway.port).parse()?;
    if state.config.gateway.secret.is_none() {
        tracing::warn!("gateway.secret is unset, every runner request will be refused");
    }
    info!(endpoint = %state.config.gateway.run_url(), "cronctl gateway listening on {}", addr);

    let router = app::build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

/// Create the database directory. A failure is only logged; opening the
/// database reports the hard error right after.
fn ensure_parent_dir(path: &str) {
    let Some(parent) = std::path::Path::new(path).parent() else {
        return;
    };
    if parent.as_os_str().is_empty() {
        return;
    }
    if let Err(e) = std::fs::create_dir_all(parent) {
        tracing::warn!(dir = %parent.display(), "could not create database directory: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::ensure_parent_dir;

    #[test]
    fn creates_missing_database_directory() {
        let root = std::env::temp_dir().join(format!("cronctl-dir-{}", std::process::id()));
        let db = root.join("nested").join("cronctl.db");
        ensure_parent_dir(db.to_str().unwrap());
        assert!(root.join("nested").is_dir());
        std::fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn unwritable_directory_is_logged_not_fatal() {
        let blocker = std::env::temp_dir().join(format!("cronctl-file-{}", std::process::id()));
        std::fs::write(&blocker, b"").unwrap();
        let db = blocker.join("sub").join("cronctl.db");
        ensure_parent_dir(db.to_str().unwrap());
        assert!(!blocker.join("sub").exists());
        std::fs::remove_file(&blocker).unwrap();
        ensure_parent_dir("cronctl.db");
    }
}
