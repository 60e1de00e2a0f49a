//! Training command implementation.

use crate::commands::types::TrainCommand;
use crate::config::Settings;
use crate::reference::ReferenceFactory;
use anyhow::{Context, Result};
use colored::Colorize;
use tessera_training::{RunOptions, Session, WorkerCommand};

pub async fn execute(command: TrainCommand, settings: &Settings, log_level: &str) -> Result<()> {
    let session = Session::new(ReferenceFactory::new(), settings.session_paths());
    // Spawned workers re-enter this binary through the hidden `worker` command.
    let worker = WorkerCommand::current_exe(["--log-level", log_level, "worker"])
        .context("Failed to locate the tessera executable")?;

    let options = RunOptions {
        devices: command.devices.clone(),
        validate_every: command.validate_every,
        logger_min_wait: command.logger_min_wait,
    };
    let model_id = session
        .train(&command.config, &command.overrides, options, &worker)
        .await
        .with_context(|| format!("Training '{}' failed", command.config))?;

    let layout = session.layout();
    println!();
    println!("{}", format!("Trained model {model_id}").bold().green());
    println!("  Config:      {}", layout.config_path(&model_id).display().to_string().dimmed());
    println!("  Checkpoints: {}", layout.checkpoints_dir(&model_id).display().to_string().dimmed());
    println!("  Log:         {}", layout.log_path(&model_id).display().to_string().dimmed());
    println!();
    Ok(())
}
