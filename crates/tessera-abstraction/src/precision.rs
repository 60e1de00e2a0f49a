//! Mixed-precision collaborator.

use crate::EngineResult;
use crate::optimizer::Optimizer;
use crate::part::{Loss, Part};

/// Loss scaling for reduced-precision training.
///
/// `initialize` receives parts and optimizers as ordered lists and must return
/// them in the same order so callers can re-associate them with their keys.
pub trait MixedPrecision: Send {
    fn initialize(
        &mut self,
        parts: Vec<Box<dyn Part>>,
        optimizers: Vec<Box<dyn Optimizer>>,
        opt_level: &str,
    ) -> EngineResult<(Vec<Box<dyn Part>>, Vec<Box<dyn Optimizer>>)>;

    /// Runs the backward pass of the scaled loss across all optimizers.
    ///
    /// Returns `false` when the optimizers must not step this batch
    /// (e.g. the unscaled gradients overflowed).
    fn scaled_backward(&mut self, loss: &mut dyn Loss, optimizers: &[&dyn Optimizer]) -> EngineResult<bool>;

    fn state(&self) -> Option<serde_json::Value> {
        None
    }

    fn load_state(&mut self, state: &serde_json::Value) -> EngineResult<()> {
        let _ = state;
        Ok(())
    }
}
