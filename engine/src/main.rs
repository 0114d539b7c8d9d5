// Cadence Workflow Orchestrator
// Main entry point for the cadence binary

use clap::Parser;

use cadence_engine::cli::{Cli, Command};
use cadence_engine::config::Config;
use cadence_engine::handlers::{handle_history, handle_run, OutputFormat};
use cadence_engine::telemetry::{init_telemetry, init_telemetry_with_level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Initialize basic telemetry first (before config is loaded)
    init_telemetry();

    // Determine output format
    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    // Load configuration (or use custom path if provided)
    let config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)?
    } else {
        Config::load_or_create()?
    };

    // Re-initialize telemetry with the CLI or config-driven log level
    // (only takes effect if RUST_LOG env var is not set)
    let log_level = cli.log.as_deref().unwrap_or(&config.core.log_level);
    init_telemetry_with_level(log_level);

    match cli.command {
        Command::Run {
            description,
            task_type,
            mode,
            plan_with_model,
            dry_run,
        } => {
            handle_run(
                description,
                task_type,
                mode,
                plan_with_model,
                dry_run,
                &config,
                format,
            )
            .await
        }

        Command::History { limit } => handle_history(limit, &config, format).await,
    }
}
