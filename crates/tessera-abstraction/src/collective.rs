//! Collective communication between worker processes.

use crate::EngineResult;

/// A joined process group.
pub trait Collective: Send {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Blocks until every rank has reached the barrier.
    fn barrier(&mut self) -> EngineResult<()>;

    /// Replaces `values` on every rank with the element-wise mean across ranks.
    fn all_reduce_mean(&mut self, values: &mut [f32]) -> EngineResult<()>;
}
