//! `regression` trainer: fits the sum of all parts to a synthetic linear
//! target with a mean squared error.
//!
//! The target is `y = Σ (j + 1) · x_j + 0.5`. Inputs are generated from the
//! sample index and the run seed, so every rank sees the same data set and
//! takes every `world_size`-th sample of it.

use std::collections::BTreeMap;
use tessera_abstraction::{Batch, Device, EngineError, EngineResult, Loss, Parameter, ToDevice};
use tessera_training::{
    Config, DataLoader, Parts, TrainMetrics, Trainer, TrainerContext, TrainingError, TrainingResult, VecLoader,
};

pub const TRAINER: &str = "regression";

const TARGET_BIAS: f32 = 0.5;

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub x: Vec<f32>,
    pub y: f32,
}

impl ToDevice for Sample {
    fn to_device(self, device: &Device) -> EngineResult<Self> {
        if device.is_cpu() { Ok(self) } else { Err(EngineError::UnsupportedDevice(device.to_string())) }
    }
}

/// Deterministic sample `index` of a data set with `features` inputs.
pub fn sample(index: usize, features: usize, seed: u64) -> Sample {
    let x: Vec<f32> = (0..features)
        .map(|j| {
            let raw = (index as u64 * 31 + j as u64 * 17 + seed) % 23;
            raw as f32 / 11.0 - 1.0
        })
        .collect();
    let y = x.iter().enumerate().map(|(j, x)| (j + 1) as f32 * x).sum::<f32>() + TARGET_BIAS;
    Sample { x, y }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DataSettings {
    features: usize,
    samples: usize,
    validation_samples: usize,
}

impl DataSettings {
    fn from_config(config: &Config) -> TrainingResult<Self> {
        let read = |key: &str, default: u64| -> TrainingResult<usize> {
            match config.lookup(&format!("data.{key}")) {
                None => Ok(default as usize),
                Some(value) => value
                    .as_u64()
                    .map(|n| n as usize)
                    .ok_or_else(|| TrainingError::InvalidConfig(format!("`data.{key}` must be a non-negative integer"))),
            }
        };
        Ok(Self { features: read("features", 1)?, samples: read("samples", 64)?, validation_samples: read("validation_samples", 16)? })
    }
}

pub struct RegressionTrainer {
    train: Vec<Sample>,
    validation: Vec<Sample>,
}

impl RegressionTrainer {
    pub fn new(context: &TrainerContext<'_>) -> TrainingResult<Self> {
        if let Some(name) = context.config.get("trainer").and_then(serde_yaml::Value::as_str)
            && name != TRAINER
        {
            return Err(TrainingError::InvalidConfig(format!("unknown trainer '{name}' (known: {TRAINER})")));
        }
        let data = DataSettings::from_config(context.config)?;
        let shard = |range: std::ops::Range<usize>| -> Vec<Sample> {
            range
                .filter(|i| i % context.world_size == context.rank)
                .map(|i| sample(i, data.features, context.seed))
                .collect()
        };
        let total = data.samples + data.validation_samples;
        Ok(Self { train: shard(0..data.samples), validation: shard(data.samples..total) })
    }
}

fn loader(samples: &[Sample], batch_size: usize) -> Box<dyn DataLoader<Sample>> {
    let batches = samples.chunks(batch_size.max(1)).map(|chunk| Batch::Many(chunk.to_vec())).collect();
    Box::new(VecLoader::new(batches))
}

/// Weight and bias of a `linear` part.
fn linear_parameters(name: &str, parts: &Parts) -> EngineResult<(Parameter, Parameter)> {
    let part = parts.get(name).ok_or_else(|| EngineError::Step(format!("no part named '{name}'")))?;
    let mut weight = None;
    let mut bias = None;
    for (param_name, param) in part.named_parameters() {
        match param_name.as_str() {
            "weight" => weight = Some(param),
            "bias" => bias = Some(param),
            _ => {}
        }
    }
    weight.zip(bias).ok_or_else(|| EngineError::Step(format!("part '{name}' is not a linear part")))
}

/// Mean squared error of the summed part outputs, with its gradients.
pub struct MseLoss {
    value: f64,
    gradients: Vec<(Parameter, Vec<f32>)>,
}

impl MseLoss {
    pub fn compute(parts: &Parts, samples: &[Sample]) -> EngineResult<Self> {
        if samples.is_empty() {
            return Err(EngineError::Step("empty batch".to_string()));
        }
        let linears = parts
            .names()
            .into_iter()
            .map(|name| linear_parameters(name, parts))
            .collect::<EngineResult<Vec<_>>>()?;
        let snapshot: Vec<(Vec<f32>, f32)> =
            linears.iter().map(|(w, b)| (w.values(), b.values().first().copied().unwrap_or(0.0))).collect();

        let residuals: Vec<f32> = samples
            .iter()
            .map(|s| {
                let prediction: f32 = snapshot
                    .iter()
                    .map(|(w, b)| w.iter().zip(&s.x).map(|(w, x)| w * x).sum::<f32>() + b)
                    .sum();
                prediction - s.y
            })
            .collect();

        let n = samples.len() as f32;
        let value = residuals.iter().map(|r| f64::from(r * r)).sum::<f64>() / f64::from(n);

        let mut gradients = Vec::with_capacity(linears.len() * 2);
        for (weight, bias) in linears {
            let mut grad_w = vec![0.0; weight.numel()];
            for (s, r) in samples.iter().zip(&residuals) {
                for (g, x) in grad_w.iter_mut().zip(&s.x) {
                    *g += 2.0 * r * x / n;
                }
            }
            let grad_b = residuals.iter().map(|r| 2.0 * r / n).sum::<f32>();
            gradients.push((weight, grad_w));
            gradients.push((bias, vec![grad_b]));
        }
        Ok(Self { value, gradients })
    }
}

impl Loss for MseLoss {
    fn value(&self) -> f64 {
        self.value
    }

    fn backward(&mut self, scale: f32) -> EngineResult<()> {
        for (param, grad) in &self.gradients {
            let scaled: Vec<f32> = grad.iter().map(|g| g * scale).collect();
            param.accumulate_grad(&scaled)?;
        }
        Ok(())
    }
}

impl Trainer for RegressionTrainer {
    type Tensor = Sample;

    fn get_dataloader(&mut self, batch_size: usize) -> TrainingResult<Box<dyn DataLoader<Sample>>> {
        Ok(loader(&self.train, batch_size))
    }

    fn train_step(
        &mut self,
        parts: &mut Parts,
        batch: Batch<Sample>,
        _batch_idx: usize,
        metrics: &mut TrainMetrics,
    ) -> EngineResult<Box<dyn Loss>> {
        let samples = batch.into_vec();
        let loss = MseLoss::compute(parts, &samples)?;
        metrics
            .update("loss", loss.value(), samples.len() as f64)
            .map_err(|e| EngineError::Other(e.to_string()))?;
        Ok(Box::new(loss))
    }

    fn validation_step(
        &mut self,
        parts: &mut Parts,
        batch: Batch<Sample>,
        _batch_idx: usize,
    ) -> EngineResult<BTreeMap<String, f64>> {
        let samples = batch.into_vec();
        let loss = MseLoss::compute(parts, &samples)?;
        Ok([("mse".to_string(), loss.value()), ("weight".to_string(), samples.len() as f64)].into_iter().collect())
    }

    fn get_validation_dataloader(&mut self, batch_size: usize) -> TrainingResult<Option<Box<dyn DataLoader<Sample>>>> {
        Ok((!self.validation.is_empty()).then(|| loader(&self.validation, batch_size)))
    }

    fn get_train_metrics(&self) -> Vec<String> {
        vec!["loss".to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::linear::Linear;
    use tessera_abstraction::Part;

    fn parts(features: usize) -> Parts {
        let mut parts = Parts::new();
        parts.insert("a", Box::new(Linear::new(features)));
        parts
    }

    #[test]
    fn test_samples_follow_the_target() {
        let s = sample(5, 2, 42);
        let expected = s.x[0] + 2.0 * s.x[1] + TARGET_BIAS;
        assert!((s.y - expected).abs() < 1e-6);
        assert_eq!(sample(5, 2, 42), s);
        assert_ne!(sample(5, 2, 7), s);
    }

    #[test]
    fn test_gradients_match_the_loss() {
        let parts = parts(1);
        let samples = vec![Sample { x: vec![1.0], y: 2.0 }, Sample { x: vec![-1.0], y: 0.0 }];
        let mut loss = MseLoss::compute(&parts, &samples).unwrap();
        // Predictions are 0: residuals -2 and 0.
        assert!((loss.value() - 2.0).abs() < 1e-9);

        loss.backward(1.0).unwrap();
        let params = parts.get("a").unwrap().parameters();
        assert_eq!(params[0].grad(), Some(vec![-2.0]));
        assert_eq!(params[1].grad(), Some(vec![-2.0]));
    }

    #[test]
    fn test_parts_are_summed() {
        let mut parts = parts(1);
        parts.insert("b", Box::new(Linear::new(1)));
        for (_, part) in parts.iter_mut() {
            part.parameters()[1].write().values = vec![1.0];
        }
        let loss = MseLoss::compute(&parts, &[Sample { x: vec![0.0], y: 2.0 }]).unwrap();
        assert!(loss.value().abs() < 1e-9);
    }

    #[test]
    fn test_ranks_split_the_data() {
        let config = Config::from_yaml_str("data: {samples: 10, validation_samples: 4}\n").unwrap();
        let context = |rank| TrainerContext { config: &config, rank, world_size: 2, device: Device::Cpu, seed: 42 };
        let first = RegressionTrainer::new(&context(0)).unwrap();
        let second = RegressionTrainer::new(&context(1)).unwrap();
        assert_eq!((first.train.len(), second.train.len()), (5, 5));
        assert_eq!((first.validation.len(), second.validation.len()), (2, 2));
        assert_eq!(first.train[0], sample(0, 1, 42));
        assert_eq!(second.train[0], sample(1, 1, 42));
    }

    #[test]
    fn test_rejects_other_trainers() {
        let config = Config::from_yaml_str("trainer: gan\n").unwrap();
        let context = TrainerContext { config: &config, rank: 0, world_size: 1, device: Device::Cpu, seed: 42 };
        assert!(matches!(RegressionTrainer::new(&context), Err(TrainingError::InvalidConfig(_))));
    }
}
