use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use chorus_domain::config::Config;
use chorus_gateway::session::spawn_idle_sweeper;
use chorus_gateway::state::AppState;
use chorus_gateway::ws::build_router;

#[derive(Parser)]
#[command(name = "chorus", about = "Real-time multimodal conversational hub")]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, global = true, default_value = "chorus.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway (default).
    Serve,
    /// Parse the configuration and print the effective values.
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing();
            let config = load_config(&cli.config)?;
            run_server(Arc::new(config)).await
        }
        Some(Command::CheckConfig) => {
            let config = load_config(&cli.config)?;
            let rendered =
                toml::to_string_pretty(&config).context("rendering effective config")?;
            println!("{rendered}");
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,chorus=debug"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Load the TOML config; a missing file yields defaults. Environment
/// overrides apply either way.
fn load_config(path: &PathBuf) -> anyhow::Result<Config> {
    let mut config = if path.exists() {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
    } else {
        tracing::info!(path = %path.display(), "no config file; using defaults");
        Config::default()
    };
    config.apply_env();
    Ok(config)
}

async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    let bind = config.server.bind.clone();
    let state = AppState::from_config(config).context("building application state")?;

    let shutdown = CancellationToken::new();
    spawn_idle_sweeper(state.clone(), shutdown.clone());

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    tracing::info!(bind = %bind, "chorus gateway listening");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            server_shutdown.cancel();
        })
        .await
        .context("serving")?;

    shutdown.cancel();
    Ok(())
}
