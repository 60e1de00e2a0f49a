//! Hidden entry point of a spawned training worker.

use crate::config::Settings;
use crate::reference::ReferenceFactory;
use anyhow::{Context, Result};
use tessera_training::{Session, SessionPaths, WorkerArgs};

/// Reads this worker's argument bundle from stdin and runs it.
pub fn execute(settings: &Settings) -> Result<()> {
    let args = WorkerArgs::read_from(std::io::stdin().lock()).context("Failed to read the worker arguments")?;
    let paths = SessionPaths {
        config_folder: settings.config_folder.clone(),
        model_folder: args.model_folder.clone(),
        rendezvous_path: args.rendezvous_path.clone(),
    };
    let rank = args.rank;
    Session::new(ReferenceFactory::new(), paths)
        .run_worker(args)
        .with_context(|| format!("Worker rank {rank} failed"))?;
    Ok(())
}
