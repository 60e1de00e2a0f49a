//! Tessera Training
//!
//! Orchestration of multi-part, multi-process training runs:
//! - Resolving layered YAML configs into a training plan (`ConfigResolver`)
//! - Assembling named model parts, with pretrained weights (`PartAssembler`)
//! - Partitioning parameters across optimizers (`optim::assign`)
//! - Launching one worker per device around a file rendezvous (`launch`)
//! - Running the epoch/batch loop with validation and checkpoints (`TrainingLoop`)

pub mod artifacts;
pub mod assembler;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod job;
pub mod launcher;
pub mod layout;
pub mod metrics;
pub mod optim;
pub mod precision;
pub mod progress;
pub mod registry;
pub mod rendezvous;
pub mod session;
pub mod trainer;
pub mod training_loop;

#[cfg(test)]
mod testing;

pub use artifacts::{CheckpointEntry, CheckpointManifest};
pub use assembler::{ArchitectureRegistry, PartAssembler, PartConstructor, Parts};
pub use checkpoint::{CheckpointSaver, Snapshot, checkpoint_tag};
pub use config::{Config, ConfigResolver, OptimizerSpec, PartSpec};
pub use error::{TrainingError, TrainingResult};
pub use job::{RunOptions, WorkerArgs};
pub use launcher::{WorkerCommand, launch};
pub use layout::ModelLayout;
pub use metrics::{RunningAverage, TrainMetrics};
pub use optim::{GLOBAL_OPTIMIZER_KEY, OptimizerKind, OptimizerRegistry, Optimizers};
pub use precision::DynamicLossScaler;
pub use progress::{ProgressEvent, ProgressLogger, TrainLogger};
pub use registry::{CheckpointRef, ModelRegistry, WeightsRef};
pub use rendezvous::FileProcessGroup;
pub use session::{Session, SessionPaths, TrainerContext, TrainerFactory};
pub use trainer::{DataLoader, Trainer, VecLoader};
pub use training_loop::{LoopSettings, LoopState, LoopSummary, ResumePoint, TrainingLoop};
