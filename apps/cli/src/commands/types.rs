//! Command type definitions shared between main.rs and the command modules.

use clap::{Args, Subcommand};
use tessera_abstraction::Device;

#[derive(Args, Debug, Clone)]
pub struct TrainCommand {
    /// Name of the config in the config folder (without `.yaml`)
    pub config: String,

    /// Config overrides as dotted `key=value` pairs (e.g. `optimizer.lr=0.01`)
    pub overrides: Vec<String>,

    /// Devices to train on, one worker per device (e.g. `cpu,cpu` or `0,1`)
    #[arg(long, value_delimiter = ',', default_value = "cpu")]
    pub devices: Vec<Device>,

    /// Validate every N batches; -1 disables mid-epoch validation
    #[arg(long, allow_negative_numbers = true)]
    pub validate_every: Option<i64>,

    /// Minimum seconds between two progress lines
    #[arg(long)]
    pub logger_min_wait: Option<f64>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ModelsCommand {
    /// List trained models
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the config and checkpoints of a trained model
    Show {
        /// Model ID
        model_id: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}
