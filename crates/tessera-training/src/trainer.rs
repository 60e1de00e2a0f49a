use crate::assembler::Parts;
use crate::error::TrainingResult;
use crate::metrics::TrainMetrics;
use std::collections::BTreeMap;
use tessera_abstraction::{Batch, EngineResult, Loss, ToDevice};

/// A finite, re-iterable sequence of batches.
pub trait DataLoader<T>: Send {
    /// Number of batches one epoch yields.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates one epoch.
    fn batches(&mut self) -> Box<dyn Iterator<Item = EngineResult<Batch<T>>> + '_>;
}

/// A loader over batches held in memory.
#[derive(Debug, Clone)]
pub struct VecLoader<T> {
    batches: Vec<Batch<T>>,
}

impl<T> VecLoader<T> {
    #[must_use]
    pub fn new(batches: Vec<Batch<T>>) -> Self {
        Self { batches }
    }
}

impl<T: Clone + Send> DataLoader<T> for VecLoader<T> {
    fn len(&self) -> usize {
        self.batches.len()
    }

    fn batches(&mut self) -> Box<dyn Iterator<Item = EngineResult<Batch<T>>> + '_> {
        Box::new(self.batches.iter().cloned().map(Ok))
    }
}

/// What a model has to provide to be trained.
///
/// Only the data loader and the train step are required; validation and
/// train meters are opt-in.
pub trait Trainer: Send {
    type Tensor: ToDevice;

    fn get_dataloader(&mut self, batch_size: usize) -> TrainingResult<Box<dyn DataLoader<Self::Tensor>>>;

    /// Runs the forward pass and returns the loss to backpropagate.
    fn train_step(
        &mut self,
        parts: &mut Parts,
        batch: Batch<Self::Tensor>,
        batch_idx: usize,
        metrics: &mut TrainMetrics,
    ) -> EngineResult<Box<dyn Loss>>;

    /// Metrics of one validation batch. A `weight` entry weights the batch.
    fn validation_step(
        &mut self,
        parts: &mut Parts,
        batch: Batch<Self::Tensor>,
        batch_idx: usize,
    ) -> EngineResult<BTreeMap<String, f64>> {
        let _ = (parts, batch, batch_idx);
        Ok(BTreeMap::new())
    }

    fn get_validation_dataloader(
        &mut self,
        batch_size: usize,
    ) -> TrainingResult<Option<Box<dyn DataLoader<Self::Tensor>>>> {
        let _ = batch_size;
        Ok(None)
    }

    /// Names of the meters `train_step` updates.
    fn get_train_metrics(&self) -> Vec<String> {
        Vec::new()
    }
}
