//! Optimizer interface.

use crate::EngineResult;
use crate::tensor::Parameter;

/// Opaque serialized optimizer state as stored in checkpoints.
pub type OptimizerState = serde_json::Value;

/// Updates a fixed set of parameters from their accumulated gradients.
pub trait Optimizer: Send {
    /// Algorithm name, e.g. `adam`.
    fn name(&self) -> &str;

    /// Parameters this optimizer owns, in construction order.
    fn parameters(&self) -> &[Parameter];

    fn zero_grad(&mut self) {
        for param in self.parameters() {
            param.zero_grad();
        }
    }

    fn step(&mut self) -> EngineResult<()>;

    fn state(&self) -> EngineResult<OptimizerState>;

    fn load_state(&mut self, state: &OptimizerState) -> EngineResult<()>;
}
