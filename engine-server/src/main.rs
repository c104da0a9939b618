//! HTTP (and optional MQ) entry point for the outreach task-execution
//! engine.
//!
//! Mirrors the teacher's `server` binary: a config-dir positional argument,
//! jemalloc as the global allocator, JSON logs rolled daily, a handful of
//! CLI overrides, and a graceful shutdown that races the server future
//! against SIGTERM/SIGINT.

mod api;
mod backend;
#[cfg(feature = "mq")]
mod consumer;
#[cfg(test)]
mod tests;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use engine_core::account_pool::AccountPool;
use engine_core::config_loader::ConfigManager;
use engine_core::manager::TaskManager;
use engine_core::session_pool::SessionPool;
use engine_core::store::{DurableStore, SqliteStore};
use engine_shared::config::ServerConfig;
use tokio::net::TcpListener;

use crate::backend::{PlaceholderBackend, PlaceholderDriverFactory};

#[cfg(not(target_os = "windows"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Parser, Debug)]
#[command(name = "engine-server", about = "Outreach task-execution engine HTTP facade")]
struct CliArgs {
    /// Directory containing engine.toml and accounts.toml.
    config_dir: PathBuf,

    /// Overrides ServerConfig::bind_addr.
    #[arg(long)]
    bind_addr: Option<String>,

    /// Overrides ServerConfig::api_key.
    #[arg(long)]
    api_key: Option<String>,

    /// Seconds to wait for background tasks to finish during shutdown.
    #[arg(long, default_value_t = 30)]
    shutdown_timeout_secs: u64,
}

/// Reads `server.toml` from the config directory if present, falling back
/// to defaults; this file is engine-server's own concern and isn't handled
/// by `ConfigManager` (which only owns `engine.toml`/`accounts.toml`).
async fn load_server_config(config_dir: &std::path::Path) -> anyhow::Result<ServerConfig> {
    let path = config_dir.join("server.toml");
    match tokio::fs::read_to_string(&path).await {
        Ok(body) => Ok(toml::from_str(&body)?),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(ServerConfig::default()),
        Err(err) => Err(err.into()),
    }
}

struct Server {
    config_manager: ConfigManager,
    listen_address: SocketAddr,
    server_config: ServerConfig,
    shutdown_timeout: Duration,
}

impl Server {
    fn new(args: &CliArgs, config_manager: ConfigManager, mut server_config: ServerConfig) -> anyhow::Result<Self> {
        if let Some(bind) = &args.bind_addr {
            server_config.bind_addr = bind.clone();
        }
        if let Some(key) = &args.api_key {
            server_config.api_key = key.clone();
        }
        let listen_address: SocketAddr = server_config.bind_addr.parse()?;
        Ok(Self {
            config_manager,
            listen_address,
            server_config,
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout_secs),
        })
    }

    async fn run(self) -> anyhow::Result<()> {
        let engine_config = self.config_manager.engine_config.clone().expect("loaded before Server::new");
        let accounts_config = self.config_manager.accounts_config.clone().expect("loaded before Server::new");

        let db_path = std::path::Path::new(&engine_config.task_root).join("engine.sqlite3");
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let store: Arc<dyn DurableStore> = Arc::new(SqliteStore::open(&db_path)?);

        let account_pool = Arc::new(AccountPool::new(accounts_config.accounts));
        let session_pool = SessionPool::new(
            Arc::new(PlaceholderBackend),
            Arc::clone(&account_pool),
            engine_config.pool_min,
            engine_config.pool_max,
        );
        let driver_factory = Arc::new(PlaceholderDriverFactory);

        let manager = TaskManager::new(store, account_pool, session_pool, driver_factory, engine_config).await?;

        let state = api::AppState::new(
            Arc::clone(&manager),
            self.server_config.api_key.clone(),
            Duration::from_secs(self.server_config.rate_limit_window_secs),
            self.server_config.rate_limit_max_requests,
            self.server_config.default_page_size,
        );
        let app = api::create_router(state);

        tracing::info!(addr = %self.listen_address, "engine-server listening");
        let listener = TcpListener::bind(self.listen_address).await?;

        let shutdown_manager = Arc::clone(&manager);
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                setup_shutdown_signal().await;
                tracing::info!("shutdown signal received, draining scheduler routines");
                tokio::time::timeout(self.shutdown_timeout, shutdown_manager.shutdown()).await.ok();
            })
            .await?;

        Ok(())
    }
}

/// Races SIGTERM against SIGINT on unix; falls back to `ctrl_c` everywhere
/// else (and if unix signal registration itself fails).
async fn setup_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut term), Ok(mut int)) => {
                tokio::select! {
                    _ = term.recv() => {}
                    _ = int.recv() => {}
                }
                return;
            }
            _ => {
                tracing::warn!("failed to register unix signal handlers, falling back to ctrl_c");
            }
        }
    }
    let _ = tokio::signal::ctrl_c().await;
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    let file_appender = tracing_appender::rolling::daily("./logs", "server.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(non_blocking)
        .init();

    let mut config_manager = ConfigManager::new(args.config_dir.clone())?;
    config_manager.load().await?;
    let server_config = load_server_config(&args.config_dir).await?;

    let server = Server::new(&args, config_manager, server_config)?;
    server.run().await
}

