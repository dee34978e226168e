use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use libamux::{
    AdapterSpawner, FsStore, InteractionCoordinator, ProcessSpawner, SessionRegistry, TaskManager,
};

use amux_server::config::Config;
use amux_server::server::{AppState, build_cors, build_router};

/// Agent session multiplexer daemon.
#[derive(Parser, Debug)]
#[command(name = "amux-server", version, about = "Agent session multiplexer daemon")]
struct Args {
    /// Address to listen on (overrides the config file).
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Path to a TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for session metadata and transcripts.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Adapter command line, e.g. "amux-adapter --verbose".
    #[arg(long)]
    adapter_cmd: Option<String>,

    /// Allowed CORS origin (repeatable); "*" allows any.
    #[arg(long = "allow-origin")]
    allow_origin: Vec<String>,
}

impl Args {
    fn into_config(self) -> Result<Config> {
        let Args {
            listen,
            config,
            data_dir,
            adapter_cmd,
            allow_origin,
        } = self;
        let mut config = Config::load(config.as_deref())?;
        if let Some(listen) = listen {
            config.listen = listen;
        }
        if let Some(data_dir) = data_dir {
            config.data_dir = data_dir;
        }
        if let Some(adapter_cmd) = adapter_cmd {
            let mut parts = adapter_cmd.split_whitespace().map(str::to_string);
            config.adapter_command = parts.next().context("--adapter-cmd must not be empty")?;
            config.adapter_args = parts.collect();
        }
        if !allow_origin.is_empty() {
            config.allow_origins = allow_origin;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "amux_server=info,libamux=info".into()),
        )
        .init();

    let config = Args::parse().into_config()?;
    let cors = build_cors(&config.allow_origins)?;

    let mut spawner = ProcessSpawner::new(&config.adapter_command, config.adapter_args.clone());
    if let Some(addendum) = &config.prompt_addendum {
        spawner = spawner.with_prompt_addendum(addendum);
    }
    let spawner: Arc<dyn AdapterSpawner> = Arc::new(spawner);

    let registry = Arc::new(SessionRegistry::new(
        FsStore::new(&config.data_dir),
        spawner.clone(),
    ));
    let state = Arc::new(AppState {
        interactions: InteractionCoordinator::new(registry.clone()),
        tasks: Arc::new(TaskManager::new(registry.clone(), spawner)),
        registry,
    });

    let app = build_router(state.clone(), cors);
    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    tracing::info!(
        addr = %config.listen,
        data_dir = %config.data_dir.display(),
        adapter = %config.adapter_command,
        "amux-server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;

    state.registry.shutdown().await;
    Ok(())
}
