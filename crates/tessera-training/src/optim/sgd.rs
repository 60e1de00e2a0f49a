use crate::config::OptimizerSpec;
use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use tessera_abstraction::{EngineError, EngineResult, Optimizer, OptimizerState, Parameter};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SgdConfig {
    pub lr: f64,
    pub momentum: f64,
    pub dampening: f64,
    pub weight_decay: f64,
    pub nesterov: bool,
}

impl Default for SgdConfig {
    fn default() -> Self {
        Self { lr: 1e-3, momentum: 0.0, dampening: 0.0, weight_decay: 0.0, nesterov: false }
    }
}

impl SgdConfig {
    pub fn from_spec(spec: &OptimizerSpec) -> TrainingResult<Self> {
        let d = Self::default();
        let config = Self {
            lr: spec.f64_or("lr", d.lr)?,
            momentum: spec.f64_or("momentum", d.momentum)?,
            dampening: spec.f64_or("dampening", d.dampening)?,
            weight_decay: spec.f64_or("weight_decay", d.weight_decay)?,
            nesterov: spec.bool_or("nesterov", d.nesterov)?,
        };
        if config.nesterov && (config.momentum <= 0.0 || config.dampening != 0.0) {
            return Err(TrainingError::InvalidConfig(
                "sgd: nesterov requires positive momentum and zero dampening".to_string(),
            ));
        }
        Ok(config)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SgdState {
    config: SgdConfig,
    momentum_buffers: Vec<Option<Vec<f32>>>,
}

/// Stochastic gradient descent with momentum, dampening and Nesterov.
#[derive(Debug)]
pub struct Sgd {
    params: Vec<Parameter>,
    config: SgdConfig,
    momentum_buffers: Vec<Option<Vec<f32>>>,
}

impl Sgd {
    #[must_use]
    pub fn new(params: Vec<Parameter>, config: SgdConfig) -> Self {
        let momentum_buffers = vec![None; params.len()];
        Self { params, config, momentum_buffers }
    }

    #[must_use]
    pub fn config(&self) -> &SgdConfig {
        &self.config
    }
}

impl Optimizer for Sgd {
    fn name(&self) -> &str {
        "sgd"
    }

    fn parameters(&self) -> &[Parameter] {
        &self.params
    }

    fn step(&mut self) -> EngineResult<()> {
        let SgdConfig { lr, momentum, dampening, weight_decay, nesterov } = self.config;

        for (param, buffer) in self.params.iter().zip(self.momentum_buffers.iter_mut()) {
            let mut data = param.write();
            let Some(grad) = data.grad.clone() else {
                continue;
            };

            let mut d_p: Vec<f64> = grad
                .iter()
                .zip(&data.values)
                .map(|(g, v)| weight_decay.mul_add(f64::from(*v), f64::from(*g)))
                .collect();

            if momentum != 0.0 {
                if let Some(buf) = buffer.as_mut() {
                    for (b, d) in buf.iter_mut().zip(&d_p) {
                        *b = momentum.mul_add(f64::from(*b), (1.0 - dampening) * d) as f32;
                    }
                } else {
                    *buffer = Some(d_p.iter().map(|d| *d as f32).collect());
                }
                for (d, b) in d_p.iter_mut().zip(buffer.iter().flatten()) {
                    *d = if nesterov { momentum.mul_add(f64::from(*b), *d) } else { f64::from(*b) };
                }
            }

            for (v, d) in data.values.iter_mut().zip(&d_p) {
                *v -= (lr * d) as f32;
            }
        }
        Ok(())
    }

    fn state(&self) -> EngineResult<OptimizerState> {
        serde_json::to_value(SgdState { config: self.config, momentum_buffers: self.momentum_buffers.clone() })
            .map_err(|e| EngineError::InvalidState(e.to_string()))
    }

    fn load_state(&mut self, state: &OptimizerState) -> EngineResult<()> {
        let state: SgdState =
            serde_json::from_value(state.clone()).map_err(|e| EngineError::InvalidState(e.to_string()))?;
        if state.momentum_buffers.len() != self.params.len() {
            return Err(EngineError::InvalidState(format!(
                "sgd state covers {} parameters, optimizer has {}",
                state.momentum_buffers.len(),
                self.params.len()
            )));
        }
        for (param, buffer) in self.params.iter().zip(&state.momentum_buffers) {
            if buffer.as_ref().is_some_and(|b| b.len() != param.numel()) {
                return Err(EngineError::InvalidState("sgd momentum size does not match parameter".to_string()));
            }
        }
        self.config = state.config;
        self.momentum_buffers = state.momentum_buffers;
        Ok(())
    }
}
