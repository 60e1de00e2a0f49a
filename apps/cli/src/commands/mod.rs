//! Command implementations for the Tessera CLI.

pub mod models;
pub mod train;
pub mod types;
pub mod worker;

pub use types::{ModelsCommand, TrainCommand};
