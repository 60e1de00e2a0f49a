use std::path::PathBuf;
use tessera_abstraction::EngineError;
use thiserror::Error;

pub type TrainingResult<T> = std::result::Result<T, TrainingError>;

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("config not found: {}", .0.display())]
    ConfigNotFound(PathBuf),

    #[error("malformed reference '{reference}': expected {expected}")]
    MalformedReference { reference: String, expected: &'static str },

    #[error("invalid override '{0}': expected key=value")]
    InvalidOverride(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("part '{0}' declares no architecture (set `arch` or `architecture`)")]
    MissingArchitecture(String),

    #[error("model {model_id} has no part named '{part}'")]
    PartNotInModel { model_id: String, part: String },

    #[error("checkpoint {} has no weights for part '{part}'", .checkpoint.display())]
    PartNotInCheckpoint { part: String, checkpoint: PathBuf },

    #[error("checkpoint not found: {}", .0.display())]
    CheckpointNotFound(PathBuf),

    #[error("unsupported optimizer '{0}'")]
    UnsupportedOptimizer(String),

    #[error("cannot parse jit shape '{spec}': {reason}")]
    ShapeParse { spec: String, reason: String },

    #[error("collective communication failed: {0}")]
    CollectiveCommunicationFailure(String),

    #[error("worker rank {rank} failed: {reason}")]
    WorkerFailed { rank: usize, reason: String },

    #[error("running average has zero total weight")]
    DivisionByZeroWeight,

    #[error("invalid observation weight {0}")]
    InvalidWeight(f64),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
