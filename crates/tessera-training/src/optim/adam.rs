use crate::config::OptimizerSpec;
use crate::error::TrainingResult;
use serde::{Deserialize, Serialize};
use tessera_abstraction::{EngineError, EngineResult, Optimizer, OptimizerState, Parameter};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdamConfig {
    pub lr: f64,
    pub betas: (f64, f64),
    pub eps: f64,
    pub weight_decay: f64,
    pub amsgrad: bool,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self { lr: 1e-3, betas: (0.9, 0.999), eps: 1e-8, weight_decay: 0.0, amsgrad: false }
    }
}

impl AdamConfig {
    pub fn from_spec(spec: &OptimizerSpec) -> TrainingResult<Self> {
        let d = Self::default();
        Ok(Self {
            lr: spec.f64_or("lr", d.lr)?,
            betas: spec.pair_or("betas", d.betas)?,
            eps: spec.f64_or("eps", d.eps)?,
            weight_decay: spec.f64_or("weight_decay", d.weight_decay)?,
            amsgrad: spec.bool_or("amsgrad", d.amsgrad)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Moments {
    step: u64,
    exp_avg: Vec<f32>,
    exp_avg_sq: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_exp_avg_sq: Option<Vec<f32>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AdamState {
    config: AdamConfig,
    moments: Vec<Option<Moments>>,
}

/// Adam with optional AMSGrad and L2 weight decay.
#[derive(Debug)]
pub struct Adam {
    params: Vec<Parameter>,
    config: AdamConfig,
    moments: Vec<Option<Moments>>,
}

impl Adam {
    #[must_use]
    pub fn new(params: Vec<Parameter>, config: AdamConfig) -> Self {
        let moments = vec![None; params.len()];
        Self { params, config, moments }
    }

    #[must_use]
    pub fn config(&self) -> &AdamConfig {
        &self.config
    }
}

impl Optimizer for Adam {
    fn name(&self) -> &str {
        "adam"
    }

    fn parameters(&self) -> &[Parameter] {
        &self.params
    }

    fn step(&mut self) -> EngineResult<()> {
        let AdamConfig { lr, betas: (beta1, beta2), eps, weight_decay, amsgrad } = self.config;

        for (param, slot) in self.params.iter().zip(self.moments.iter_mut()) {
            let mut data = param.write();
            let Some(grad) = data.grad.clone() else {
                continue;
            };
            let numel = data.values.len();
            let m = slot.get_or_insert_with(|| Moments {
                step: 0,
                exp_avg: vec![0.0; numel],
                exp_avg_sq: vec![0.0; numel],
                max_exp_avg_sq: amsgrad.then(|| vec![0.0; numel]),
            });
            m.step += 1;

            let bias_correction1 = 1.0 - beta1.powi(m.step as i32);
            let bias_correction2_sqrt = (1.0 - beta2.powi(m.step as i32)).sqrt();
            let step_size = lr / bias_correction1;

            for i in 0..numel {
                let mut g = f64::from(grad[i]);
                if weight_decay != 0.0 {
                    g += weight_decay * f64::from(data.values[i]);
                }
                let avg = beta1.mul_add(f64::from(m.exp_avg[i]), (1.0 - beta1) * g);
                let avg_sq = beta2.mul_add(f64::from(m.exp_avg_sq[i]), (1.0 - beta2) * g * g);
                m.exp_avg[i] = avg as f32;
                m.exp_avg_sq[i] = avg_sq as f32;

                let second = match m.max_exp_avg_sq.as_mut() {
                    Some(max) => {
                        max[i] = max[i].max(avg_sq as f32);
                        f64::from(max[i])
                    }
                    None => avg_sq,
                };
                let denom = second.sqrt() / bias_correction2_sqrt + eps;
                data.values[i] -= (step_size * avg / denom) as f32;
            }
        }
        Ok(())
    }

    fn state(&self) -> EngineResult<OptimizerState> {
        serde_json::to_value(AdamState { config: self.config, moments: self.moments.clone() })
            .map_err(|e| EngineError::InvalidState(e.to_string()))
    }

    fn load_state(&mut self, state: &OptimizerState) -> EngineResult<()> {
        let state: AdamState =
            serde_json::from_value(state.clone()).map_err(|e| EngineError::InvalidState(e.to_string()))?;
        if state.moments.len() != self.params.len() {
            return Err(EngineError::InvalidState(format!(
                "adam state covers {} parameters, optimizer has {}",
                state.moments.len(),
                self.params.len()
            )));
        }
        for (param, moments) in self.params.iter().zip(&state.moments) {
            if let Some(m) = moments
                && (m.exp_avg.len() != param.numel() || m.exp_avg_sq.len() != param.numel())
            {
                return Err(EngineError::InvalidState("adam moment size does not match parameter".to_string()));
            }
        }
        self.config = state.config;
        self.moments = state.moments;
        Ok(())
    }
}
