//! The epoch/batch loop run by every worker.

use crate::assembler::Parts;
use crate::checkpoint::CheckpointSaver;
use crate::config::Config;
use crate::error::{TrainingError, TrainingResult};
use crate::metrics::{RunningAverage, TrainMetrics};
use crate::optim::Optimizers;
use crate::precision::initialize_sorted;
use crate::progress::ProgressLogger;
use crate::trainer::{DataLoader, Trainer};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use tessera_abstraction::{Collective, Device, MixedPrecision, Optimizer};
use tracing::{debug, info, warn};

/// Batch indices after which to validate mid-epoch.
///
/// Positive multiples of `every` below `batch_count`, except the last batch
/// index, which the end-of-epoch validation already covers.
#[must_use]
pub fn validation_triggers(batch_count: usize, every: Option<usize>) -> BTreeSet<usize> {
    let Some(every) = every.filter(|n| *n > 0) else {
        return BTreeSet::new();
    };
    (every..batch_count)
        .step_by(every)
        .filter(|idx| *idx + 1 != batch_count)
        .collect()
}

/// Position to continue from after a checkpoint taken at `(epoch, batch)`.
#[must_use]
pub fn resume_position(epoch: usize, batch: usize, batch_count: usize) -> (usize, usize) {
    let next = batch + 1;
    if next >= batch_count { (epoch + 1, 0) } else { (epoch, next) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Initializing,
    EpochRunning { epoch: usize },
    Validating { epoch: usize, batch: usize },
    Completed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoopSettings {
    pub epochs: usize,
    pub batch_size: usize,
    pub validation_batch_size: usize,
    pub validate_every: Option<usize>,
    /// Requested mixed-precision opt level.
    pub mixed_precision: Option<String>,
}

impl LoopSettings {
    pub fn from_config(config: &Config, validate_every: Option<usize>) -> TrainingResult<Self> {
        Ok(Self {
            epochs: config.epochs()?,
            batch_size: config.batch_size()?,
            validation_batch_size: config.validation_batch_size()?,
            validate_every,
            mixed_precision: config.mixed_precision(),
        })
    }
}

/// Where a resumed run picks up.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumePoint {
    pub epoch: usize,
    pub batch: usize,
    pub mixed_precision: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoopSummary {
    pub batches_run: usize,
    pub epochs_completed: usize,
    pub last_validation: BTreeMap<String, f64>,
    pub last_checkpoint: Option<PathBuf>,
}

type Loader<T> = Box<dyn DataLoader<T>>;

pub struct TrainingLoop<'t, T: Trainer + ?Sized> {
    trainer: &'t mut T,
    parts: Parts,
    optimizers: Optimizers,
    frozen: BTreeSet<String>,
    settings: LoopSettings,
    device: Device,
    logger: Option<Box<dyn ProgressLogger>>,
    saver: Option<CheckpointSaver>,
    mixed_precision: Option<Box<dyn MixedPrecision>>,
    scaling: bool,
    collective: Option<Box<dyn Collective>>,
    resume: Option<ResumePoint>,
    state: LoopState,
    summary: LoopSummary,
}

impl<'t, T: Trainer + ?Sized> TrainingLoop<'t, T> {
    pub fn new(trainer: &'t mut T, parts: Parts, optimizers: Optimizers, settings: LoopSettings, device: Device) -> Self {
        Self {
            trainer,
            parts,
            optimizers,
            frozen: BTreeSet::new(),
            settings,
            device,
            logger: None,
            saver: None,
            mixed_precision: None,
            scaling: false,
            collective: None,
            resume: None,
            state: LoopState::Initializing,
            summary: LoopSummary::default(),
        }
    }

    /// Parts that stay without gradients after validation.
    #[must_use]
    pub fn with_frozen(mut self, frozen: impl IntoIterator<Item = String>) -> Self {
        self.frozen = frozen.into_iter().collect();
        self
    }

    #[must_use]
    pub fn with_logger(mut self, logger: Option<Box<dyn ProgressLogger>>) -> Self {
        self.logger = logger;
        self
    }

    #[must_use]
    pub fn with_saver(mut self, saver: Option<CheckpointSaver>) -> Self {
        self.saver = saver;
        self
    }

    #[must_use]
    pub fn with_mixed_precision(mut self, mixed_precision: Option<Box<dyn MixedPrecision>>) -> Self {
        self.mixed_precision = mixed_precision;
        self
    }

    #[must_use]
    pub fn with_collective(mut self, collective: Option<Box<dyn Collective>>) -> Self {
        self.collective = collective;
        self
    }

    #[must_use]
    pub fn resume_from(mut self, resume: Option<ResumePoint>) -> Self {
        self.resume = resume;
        self
    }

    #[must_use]
    pub fn state(&self) -> LoopState {
        self.state
    }

    #[must_use]
    pub fn parts(&self) -> &Parts {
        &self.parts
    }

    #[must_use]
    pub fn optimizers(&self) -> &Optimizers {
        &self.optimizers
    }

    pub fn into_parts(self) -> (Parts, Optimizers) {
        (self.parts, self.optimizers)
    }

    fn transition(&mut self, next: LoopState) {
        debug!(from = ?self.state, to = ?next, "loop state");
        self.state = next;
    }

    pub fn run(&mut self) -> TrainingResult<LoopSummary> {
        let mut loader = self.trainer.get_dataloader(self.settings.batch_size)?;
        let mut validation_loader = self.trainer.get_validation_dataloader(self.settings.validation_batch_size)?;
        let batch_count = loader.len();
        let triggers = validation_triggers(batch_count, self.settings.validate_every);
        debug!(batch_count, triggers = ?triggers, "validation schedule");

        self.initialize_mixed_precision()?;

        let (mut epoch, mut skip) = match self.resume.take() {
            Some(point) => {
                if let (Some(state), Some(mp)) = (&point.mixed_precision, self.mixed_precision.as_mut())
                    && self.scaling
                {
                    mp.load_state(state)?;
                }
                let position = resume_position(point.epoch, point.batch, batch_count);
                info!(epoch = position.0, batch = position.1, "resuming");
                position
            }
            None => (0, 0),
        };

        let meter_names = self.trainer.get_train_metrics();
        let mut train_metrics = TrainMetrics::with_meters(meter_names.iter().cloned());
        if let Some(logger) = self.logger.as_mut() {
            for name in &meter_names {
                logger.add_meter(name);
            }
            logger.start(batch_count, epoch, skip);
        }

        while epoch < self.settings.epochs {
            self.transition(LoopState::EpochRunning { epoch });
            train_metrics.reset();

            for (batch_idx, batch) in loader.batches().enumerate() {
                let batch = batch?;
                if batch_idx < skip {
                    continue;
                }
                self.train_batch(batch, batch_idx, &mut train_metrics)?;
                self.summary.batches_run += 1;
                if let Some(logger) = self.logger.as_mut() {
                    logger.batch(&train_metrics.averages());
                }
                if triggers.contains(&batch_idx) {
                    self.validate(epoch, batch_idx, &mut validation_loader)?;
                    self.transition(LoopState::EpochRunning { epoch });
                }
            }
            skip = 0;

            if let Some(logger) = self.logger.as_mut() {
                logger.epoch();
            }
            self.validate(epoch, batch_count.saturating_sub(1), &mut validation_loader)?;
            self.summary.epochs_completed += 1;
            epoch += 1;
        }

        self.transition(LoopState::Completed);
        if let Some(logger) = self.logger.as_mut() {
            logger.finish(self.summary.batches_run);
        }
        Ok(self.summary.clone())
    }

    fn initialize_mixed_precision(&mut self) -> TrainingResult<()> {
        let Some(opt_level) = self.settings.mixed_precision.clone() else {
            return Ok(());
        };
        let Some(mixed_precision) = self.mixed_precision.as_deref_mut() else {
            warn!(opt_level = %opt_level, "mixed precision requested but not available, training at full precision");
            return Ok(());
        };
        let parts = std::mem::take(&mut self.parts);
        let optimizers = std::mem::take(&mut self.optimizers);
        let (parts, optimizers) = initialize_sorted(mixed_precision, parts, optimizers, &opt_level)?;
        self.parts = parts;
        self.optimizers = optimizers;
        self.scaling = true;
        info!(opt_level = %opt_level, "mixed precision enabled");
        Ok(())
    }

    fn train_batch(
        &mut self,
        batch: tessera_abstraction::Batch<T::Tensor>,
        batch_idx: usize,
        metrics: &mut TrainMetrics,
    ) -> TrainingResult<()> {
        for optimizer in self.optimizers.values_mut() {
            optimizer.zero_grad();
        }

        let batch = batch.to_device(&self.device)?;
        let mut loss = self.trainer.train_step(&mut self.parts, batch, batch_idx, metrics)?;

        let mut step = match self.mixed_precision.as_mut() {
            Some(mixed_precision) if self.scaling => {
                let optimizers: Vec<&dyn Optimizer> = self.optimizers.values().map(|o| o.as_ref()).collect();
                mixed_precision.scaled_backward(loss.as_mut(), &optimizers)?
            }
            _ => {
                loss.backward(1.0)?;
                true
            }
        };

        if let Some(collective) = self.collective.as_mut()
            && collective.world_size() > 1
        {
            step = average_gradients(collective.as_mut(), &self.optimizers, step)?;
        }

        if step {
            for optimizer in self.optimizers.values_mut() {
                optimizer.step()?;
            }
        } else {
            debug!(batch = batch_idx, "optimizer step skipped");
        }
        Ok(())
    }

    fn validate(
        &mut self,
        epoch: usize,
        batch: usize,
        loader: &mut Option<Loader<T::Tensor>>,
    ) -> TrainingResult<()> {
        self.transition(LoopState::Validating { epoch, batch });

        let metrics = match loader.as_mut() {
            Some(loader) => self.run_validation(loader.as_mut())?,
            None => BTreeMap::new(),
        };

        if let Some(logger) = self.logger.as_mut() {
            logger.validation(batch, &metrics);
        }
        if let Some(saver) = &self.saver {
            let scaler_state = if self.scaling { self.mixed_precision.as_ref().and_then(|m| m.state()) } else { None };
            let path = saver.save(&self.parts, &self.optimizers, scaler_state, epoch, batch, metrics.clone())?;
            self.summary.last_checkpoint = Some(path);
        }
        self.summary.last_validation = metrics;
        Ok(())
    }

    fn run_validation(&mut self, loader: &mut dyn DataLoader<T::Tensor>) -> TrainingResult<BTreeMap<String, f64>> {
        for (_, part) in self.parts.iter_mut() {
            part.set_grad_enabled(false);
        }
        let result = self.collect_validation_metrics(loader);
        for (name, part) in self.parts.iter_mut() {
            part.set_grad_enabled(!self.frozen.contains(name));
        }
        result
    }

    fn collect_validation_metrics(
        &mut self,
        loader: &mut dyn DataLoader<T::Tensor>,
    ) -> TrainingResult<BTreeMap<String, f64>> {
        let mut estimators: BTreeMap<String, RunningAverage> = BTreeMap::new();
        for (batch_idx, batch) in loader.batches().enumerate() {
            let batch = batch?.to_device(&self.device)?;
            let metrics = self.trainer.validation_step(&mut self.parts, batch, batch_idx)?;
            let weight = metrics.get("weight").copied().unwrap_or(1.0);
            for (name, value) in metrics {
                estimators.entry(name).or_default().update(value, weight)?;
            }
        }
        Ok(estimators.into_iter().map(|(name, avg)| (name, avg.get())).collect())
    }
}

/// Averages the gradients of every optimized parameter across ranks in one
/// exchange. The step flag travels along so a veto on any rank skips the step
/// everywhere.
fn average_gradients(collective: &mut dyn Collective, optimizers: &Optimizers, step: bool) -> TrainingResult<bool> {
    let params: Vec<_> = optimizers.values().flat_map(|o| o.parameters().iter().cloned()).collect();

    let mut buffer: Vec<f32> = Vec::new();
    for param in &params {
        let data = param.read();
        // A vetoed rank may hold non-finite gradients; it contributes zeros.
        match &data.grad {
            Some(grad) if step => buffer.extend_from_slice(grad),
            _ => buffer.extend(std::iter::repeat_n(0.0, data.values.len())),
        }
    }
    buffer.push(if step { 1.0 } else { 0.0 });

    collective
        .all_reduce_mean(&mut buffer)
        .map_err(|e| TrainingError::CollectiveCommunicationFailure(e.to_string()))?;

    let mut offset = 0;
    for param in &params {
        let mut data = param.write();
        let numel = data.values.len();
        if data.requires_grad {
            data.grad = Some(buffer[offset..offset + numel].to_vec());
        }
        offset += numel;
    }
    Ok(buffer.last().is_some_and(|flag| *flag >= 1.0))
}
