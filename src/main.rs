use clap::Parser;
use directories::ProjectDirs;
use pedestal::app_config::AppConfig;
use pedestal::config_store::ConfigStore;
use pedestal::engine::Engine;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "pedestal",
    version,
    about = "Integration engine for JVC Connected Cam camcorders: discovery, control sessions, tally routing"
)]
struct Cli {
    /// Device and tally configuration document (created when missing).
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,
}

fn default_config_path() -> PathBuf {
    ProjectDirs::from("", "", "pedestal")
        .map(|dirs| dirs.config_dir().join("config.json"))
        .unwrap_or_else(|| PathBuf::from("pedestal-config.json"))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("🎥 Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    let cli = Cli::parse();
    let app_config = AppConfig::load();
    info!("✅ Loaded configuration");

    let config_path = cli.config.unwrap_or_else(default_config_path);
    let store = match ConfigStore::open(&config_path).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("❌ {}", e);
            return ExitCode::from(2);
        }
    };

    let engine = match Engine::open(app_config.engine_settings(), store).await {
        Ok(engine) => engine,
        Err(e) => {
            error!("❌ Engine failed to start: {}", e);
            return ExitCode::from(1);
        }
    };
    info!("🔥 {} is up and running", env!("CARGO_PKG_NAME"));

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("❌ Could not listen for shutdown signal: {}", e);
    }
    info!("Received shutdown signal");
    engine.shutdown().await;

    ExitCode::SUCCESS
}
