//! Tessera CLI - Command-line interface for the Tessera training framework
//!
//! This CLI provides a `tessera` command that trains models assembled from
//! named parts and inspects the trained model folders.

mod commands;
mod config;
mod reference;

use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use commands::{ModelsCommand, TrainCommand, models, train, worker};
use config::{Settings, SettingsFile};

/// Tessera CLI - Train models assembled from named parts
///
/// Configs are YAML files in the config folder. Every run gets its own
/// numbered folder in the model folder holding the resolved config, the
/// progress log and the checkpoints.
#[derive(Parser, Debug)]
#[command(name = "tessera", author, version, about = "Tessera - Train models assembled from named parts")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Config folder (overrides TESSERA_CONFIG_DIR)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Model folder (overrides TESSERA_MODEL_DIR)
    #[arg(long, global = true)]
    model_dir: Option<PathBuf>,

    /// Rendezvous file for multi-process runs (overrides TESSERA_RENDEZVOUS)
    #[arg(long, global = true)]
    rendezvous: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train a model from a config
    ///
    /// Resolves the config and its overrides, saves it under a new model ID,
    /// then runs one worker per device.
    Train(TrainCommand),

    /// Inspect trained models
    #[command(subcommand)]
    Models(ModelsCommand),

    /// Run one spawned training worker (arguments are read from stdin)
    #[command(hide = true)]
    Worker,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(level).without_time().with_target(false).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // If no command provided, show help
    let Some(command) = args.command else {
        Args::command().print_help()?;
        return Ok(());
    };

    let flags =
        SettingsFile { config_folder: args.config_dir, model_folder: args.model_dir, rendezvous_path: args.rendezvous };
    let settings = Settings::discover(flags)?;

    match command {
        Command::Train(train_command) => train::execute(train_command, &settings, &args.log_level).await?,
        Command::Models(models_command) => models::execute(models_command, &settings)?,
        Command::Worker => worker::execute(&settings)?,
    }

    Ok(())
}
