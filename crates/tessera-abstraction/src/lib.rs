//! Engine abstraction layer for Tessera.
//!
//! This crate defines the narrow interfaces through which the training
//! orchestration core talks to the numeric engine: model parts, parameters,
//! losses, optimizers, mixed precision and collective communication. Nothing
//! here knows what a part computes.

pub mod collective;
pub mod device;
pub mod optimizer;
pub mod part;
pub mod precision;
pub mod tensor;

pub use collective::Collective;
pub use device::{DType, Device};
pub use optimizer::{Optimizer, OptimizerState};
pub use part::{Batch, Loss, Part, ToDevice};
pub use precision::MixedPrecision;
pub use tensor::{ParamData, Parameter, StateDict, SyntheticInput, TensorState};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Represents an error raised by an engine collaborator.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineError {
    /// A state entry did not match the shape of the parameter it targets.
    #[error("Shape mismatch for '{name}': expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Parameter name.
        name: String,
        /// Shape of the live parameter.
        expected: Vec<usize>,
        /// Shape found in the state.
        actual: Vec<usize>,
    },

    /// A parameter had no entry in the state being loaded.
    #[error("Missing state entry: {0}")]
    MissingState(String),

    /// The state being loaded contained an entry no parameter claims.
    #[error("Unexpected state entry: {0}")]
    UnexpectedState(String),

    /// The device string could not be parsed.
    #[error("Invalid device: {0}")]
    InvalidDevice(String),

    /// The collaborator cannot run on the requested device.
    #[error("Unsupported device: {0}")]
    UnsupportedDevice(String),

    /// The collaborator does not implement the requested operation.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Serialized optimizer or scaler state was unreadable.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A collective operation across ranks failed.
    #[error("Collective communication failed: {0}")]
    Collective(String),

    /// A forward, backward or step computation failed.
    #[error("Step failed: {0}")]
    Step(String),

    /// Other unexpected errors.
    #[error("Other engine error: {0}")]
    Other(String),
}

/// Result type for engine collaborators.
pub type EngineResult<T> = Result<T, EngineError>;
