//! Small parts, losses and trainers shared by the unit tests.

use crate::assembler::{PartConstructor, Parts};
use crate::config::{Config, PartSpec};
use crate::error::{TrainingError, TrainingResult};
use crate::metrics::TrainMetrics;
use crate::progress::ProgressLogger;
use crate::trainer::{DataLoader, Trainer, VecLoader};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tessera_abstraction::{
    Batch, Device, EngineError, EngineResult, Loss, Parameter, Part, StateDict, SyntheticInput, TensorState,
    ToDevice,
};

type TraceLog = Arc<Mutex<Vec<Vec<Vec<usize>>>>>;

/// A part with a zero-initialized `weight` of `size` and a scalar `bias`.
#[derive(Debug, Clone)]
pub struct Toy {
    weight: Parameter,
    bias: Parameter,
    traces: TraceLog,
}

impl Toy {
    pub fn new(size: usize) -> Self {
        Self { weight: Parameter::zeros(vec![size]), bias: Parameter::zeros(vec![1]), traces: TraceLog::default() }
    }

    pub fn weight(&self) -> &Parameter {
        &self.weight
    }
}

impl Part for Toy {
    fn named_parameters(&self) -> Vec<(String, Parameter)> {
        vec![("weight".to_string(), self.weight.clone()), ("bias".to_string(), self.bias.clone())]
    }

    fn to_device(&mut self, _device: &Device) -> EngineResult<()> {
        Ok(())
    }

    fn trace(&self, inputs: &[SyntheticInput]) -> EngineResult<Box<dyn Part>> {
        self.traces.lock().unwrap().push(inputs.iter().map(|i| i.shape.clone()).collect());
        Ok(Box::new(self.clone()))
    }
}

/// Builds `toy` parts, sized by their `size` key, and remembers every trace.
#[derive(Debug, Default)]
pub struct ToyConstructor {
    traces: TraceLog,
}

impl ToyConstructor {
    /// Input shapes of every traced part, in trace order.
    pub fn traced(&self) -> Vec<Vec<Vec<usize>>> {
        self.traces.lock().unwrap().clone()
    }
}

impl PartConstructor for ToyConstructor {
    fn construct(&self, architecture: &str, spec: &PartSpec, _config: &Config) -> TrainingResult<Box<dyn Part>> {
        self.check(architecture, spec)?;
        let mut toy = Toy::new(spec.usize_or("size", 2)?);
        toy.traces = Arc::clone(&self.traces);
        Ok(Box::new(toy))
    }

    fn check(&self, architecture: &str, _spec: &PartSpec) -> TrainingResult<()> {
        if architecture == "toy" {
            Ok(())
        } else {
            Err(TrainingError::InvalidConfig(format!("unknown architecture '{architecture}'")))
        }
    }
}

/// State matching a [`Toy`] of `size`, filled with `value`.
pub fn toy_state(size: usize, value: f32) -> StateDict {
    [
        ("weight".to_string(), TensorState { shape: vec![size], values: vec![value; size] }),
        ("bias".to_string(), TensorState { shape: vec![1], values: vec![value] }),
    ]
    .into_iter()
    .collect()
}

/// `loss = sum(g · p)` over the given parameters, so backward adds `scale * g`.
pub struct LinearLoss {
    terms: Vec<(Parameter, Vec<f32>)>,
}

impl LinearLoss {
    pub fn new(terms: Vec<(Parameter, Vec<f32>)>) -> Self {
        Self { terms }
    }
}

impl Loss for LinearLoss {
    fn value(&self) -> f64 {
        self.terms
            .iter()
            .map(|(p, g)| p.values().iter().zip(g).map(|(v, g)| f64::from(v * g)).sum::<f64>())
            .sum()
    }

    fn backward(&mut self, scale: f32) -> EngineResult<()> {
        for (param, grad) in &self.terms {
            let scaled: Vec<f32> = grad.iter().map(|g| g * scale).collect();
            param.accumulate_grad(&scaled)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample(pub f32);

impl ToDevice for Sample {
    fn to_device(self, _device: &Device) -> EngineResult<Self> {
        Ok(self)
    }
}

/// A trainer whose every train step pushes all parameters along a fixed
/// gradient. Validation batch `i` reports `score = i + 1` with weight `2i + 1`.
pub struct ScriptedTrainer {
    batches: usize,
    validation_batches: usize,
    gradient: f32,
    fail_at: Option<usize>,
    /// Batch indices handed to `train_step`.
    pub seen: Vec<usize>,
    /// Whether any parameter tracked gradients during each validation step.
    pub validation_grad_enabled: Vec<bool>,
}

impl ScriptedTrainer {
    pub fn new(batches: usize, validation_batches: usize) -> Self {
        Self {
            batches,
            validation_batches,
            gradient: 1.0,
            fail_at: None,
            seen: Vec::new(),
            validation_grad_enabled: Vec::new(),
        }
    }

    pub fn with_gradient(mut self, gradient: f32) -> Self {
        self.gradient = gradient;
        self
    }

    pub fn failing_at(mut self, batch_idx: usize) -> Self {
        self.fail_at = Some(batch_idx);
        self
    }
}

fn samples(count: usize) -> Box<dyn DataLoader<Sample>> {
    Box::new(VecLoader::new((0..count).map(|i| Batch::Single(Sample(i as f32))).collect()))
}

impl Trainer for ScriptedTrainer {
    type Tensor = Sample;

    fn get_dataloader(&mut self, _batch_size: usize) -> TrainingResult<Box<dyn DataLoader<Sample>>> {
        Ok(samples(self.batches))
    }

    fn train_step(
        &mut self,
        parts: &mut Parts,
        _batch: Batch<Sample>,
        batch_idx: usize,
        metrics: &mut TrainMetrics,
    ) -> EngineResult<Box<dyn Loss>> {
        if self.fail_at == Some(batch_idx) {
            return Err(EngineError::Step(format!("scripted failure at batch {batch_idx}")));
        }
        self.seen.push(batch_idx);
        let terms = parts
            .iter()
            .flat_map(|(_, part)| part.parameters())
            .map(|p| {
                let grad = vec![self.gradient; p.numel()];
                (p, grad)
            })
            .collect();
        let _ = metrics.update("loss", 1.0, 1.0);
        Ok(Box::new(LinearLoss::new(terms)))
    }

    fn validation_step(
        &mut self,
        parts: &mut Parts,
        _batch: Batch<Sample>,
        batch_idx: usize,
    ) -> EngineResult<BTreeMap<String, f64>> {
        let tracking = parts.iter().flat_map(|(_, part)| part.parameters()).any(|p| p.requires_grad());
        self.validation_grad_enabled.push(tracking);
        let i = batch_idx as f64;
        Ok([("score".to_string(), i + 1.0), ("weight".to_string(), 2.0 * i + 1.0)].into_iter().collect())
    }

    fn get_validation_dataloader(&mut self, _batch_size: usize) -> TrainingResult<Option<Box<dyn DataLoader<Sample>>>> {
        Ok((self.validation_batches > 0).then(|| samples(self.validation_batches)))
    }

    fn get_train_metrics(&self) -> Vec<String> {
        vec!["loss".to_string()]
    }
}

/// Logs every callback as a short line.
#[derive(Debug, Clone, Default)]
pub struct RecordingLogger {
    pub events: Arc<Mutex<Vec<String>>>,
}

impl RecordingLogger {
    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl ProgressLogger for RecordingLogger {
    fn start(&mut self, batches_per_epoch: usize, epoch: usize, batch: usize) {
        self.push(format!("start {batches_per_epoch} {epoch} {batch}"));
    }

    fn batch(&mut self, _metrics: &BTreeMap<String, f64>) {
        self.push("batch".to_string());
    }

    fn epoch(&mut self) {
        self.push("epoch".to_string());
    }

    fn validation(&mut self, batch: usize, _metrics: &BTreeMap<String, f64>) {
        self.push(format!("validation {batch}"));
    }

    fn finish(&mut self, batches_run: usize) {
        self.push(format!("finish {batches_run}"));
    }

    fn set_min_wait(&mut self, _min_wait: Duration) {}

    fn add_meter(&mut self, _name: &str) {}
}
