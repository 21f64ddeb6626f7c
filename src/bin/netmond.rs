//! Daemon entry point: loads a config file, builds the [`Engine`], starts
//! the scheduler, and blocks until Ctrl-C. Repurposed from the old `cli.rs`
//! clap surface, trimmed to what a headless daemon needs.

use clap::Parser;
use netmon_core::model::config::ConfigSnapshot;
use netmon_core::{logging, Engine};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "netmond")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Background network-health monitoring daemon")]
struct Cli {
    /// Path to a TOML or JSON configuration file.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Directory to store daily result files in. Overrides the config file.
    #[arg(long = "data-dir")]
    data_dir: Option<PathBuf>,

    /// Stay attached to the terminal instead of detaching. The daemon never
    /// forks itself; this flag only controls log output framing.
    #[arg(long = "foreground")]
    foreground: bool,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init_tracing();

    let mut config = match &cli.config {
        Some(path) => match ConfigSnapshot::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("failed to load config {}: {e}", path.display());
                return ExitCode::FAILURE;
            }
        },
        None => ConfigSnapshot::default(),
    };
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    if cli.foreground {
        tracing::info!(target: "netmond", "running in foreground");
    }

    let engine = match Engine::new(config).await {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("failed to start engine: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = engine.start().await {
        eprintln!("failed to start scheduler: {e}");
        return ExitCode::FAILURE;
    }
    tracing::info!(target: "netmond", "scheduler started");

    if let Err(e) = tokio::signal::ctrl_c().await {
        eprintln!("failed to listen for ctrl-c: {e}");
    }

    tracing::info!(target: "netmond", "shutting down");
    if let Err(e) = engine.stop().await {
        eprintln!("error during shutdown: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
