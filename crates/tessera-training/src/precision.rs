//! Loss scaling for reduced-precision training.

use crate::assembler::Parts;
use crate::error::TrainingResult;
use crate::optim::Optimizers;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tessera_abstraction::{EngineError, EngineResult, Loss, MixedPrecision, Optimizer, Part};
use tracing::{debug, warn};

/// Hands parts and optimizers to `mixed_precision` as lists sorted by key and
/// re-associates the returned objects with their keys.
///
/// Parts come back in their original declaration order.
pub fn initialize_sorted(
    mixed_precision: &mut dyn MixedPrecision,
    parts: Parts,
    optimizers: Optimizers,
    opt_level: &str,
) -> TrainingResult<(Parts, Optimizers)> {
    let declaration_order: Vec<String> = parts.names().into_iter().map(str::to_string).collect();

    let mut part_entries = parts.into_entries();
    part_entries.sort_by(|a, b| a.0.cmp(&b.0));
    let (part_names, part_objects): (Vec<String>, Vec<Box<dyn Part>>) = part_entries.into_iter().unzip();
    let (optimizer_keys, optimizer_objects): (Vec<String>, Vec<Box<dyn Optimizer>>) = optimizers.into_iter().unzip();

    let (wrapped_parts, wrapped_optimizers) =
        mixed_precision.initialize(part_objects, optimizer_objects, opt_level)?;
    if wrapped_parts.len() != part_names.len() || wrapped_optimizers.len() != optimizer_keys.len() {
        return Err(EngineError::InvalidState(format!(
            "mixed precision returned {} parts and {} optimizers, expected {} and {}",
            wrapped_parts.len(),
            wrapped_optimizers.len(),
            part_names.len(),
            optimizer_keys.len()
        ))
        .into());
    }

    let mut by_name: HashMap<String, Box<dyn Part>> = part_names.into_iter().zip(wrapped_parts).collect();
    let mut parts = Parts::new();
    for name in declaration_order {
        if let Some(part) = by_name.remove(&name) {
            parts.insert(name, part);
        }
    }
    let optimizers = optimizer_keys.into_iter().zip(wrapped_optimizers).collect();
    debug!(opt_level, parts = parts.len(), "mixed precision initialized");
    Ok((parts, optimizers))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct ScalerState {
    scale: f32,
    good_steps: u32,
}

/// Dynamic loss scaling.
///
/// The loss is multiplied by `scale` before backward and gradients are divided
/// by it afterwards. Non-finite gradients veto the optimizer step and halve the
/// scale; `growth_interval` consecutive clean steps double it.
#[derive(Debug, Clone)]
pub struct DynamicLossScaler {
    scale: f32,
    growth_factor: f32,
    backoff_factor: f32,
    growth_interval: u32,
    good_steps: u32,
    enabled: bool,
}

impl Default for DynamicLossScaler {
    fn default() -> Self {
        Self {
            scale: 65536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            good_steps: 0,
            enabled: true,
        }
    }
}

impl DynamicLossScaler {
    #[must_use]
    pub fn new(initial_scale: f32, growth_interval: u32) -> Self {
        Self { scale: initial_scale, growth_interval: growth_interval.max(1), ..Self::default() }
    }

    #[must_use]
    pub fn scale(&self) -> f32 {
        if self.enabled { self.scale } else { 1.0 }
    }
}

impl MixedPrecision for DynamicLossScaler {
    fn initialize(
        &mut self,
        parts: Vec<Box<dyn Part>>,
        optimizers: Vec<Box<dyn Optimizer>>,
        opt_level: &str,
    ) -> EngineResult<(Vec<Box<dyn Part>>, Vec<Box<dyn Optimizer>>)> {
        self.enabled = !opt_level.eq_ignore_ascii_case("O0");
        Ok((parts, optimizers))
    }

    fn scaled_backward(&mut self, loss: &mut dyn Loss, optimizers: &[&dyn Optimizer]) -> EngineResult<bool> {
        let scale = self.scale();
        loss.backward(scale)?;

        let inverse = scale.recip();
        let mut overflow = false;
        for optimizer in optimizers {
            for param in optimizer.parameters() {
                let mut data = param.write();
                if let Some(grad) = data.grad.as_mut() {
                    for g in grad.iter_mut() {
                        *g *= inverse;
                        overflow |= !g.is_finite();
                    }
                }
            }
        }

        if !self.enabled {
            return Ok(!overflow);
        }
        if overflow {
            self.scale *= self.backoff_factor;
            self.good_steps = 0;
            warn!(scale = self.scale, "gradient overflow, skipping step");
            return Ok(false);
        }
        self.good_steps += 1;
        if self.good_steps >= self.growth_interval {
            self.scale *= self.growth_factor;
            self.good_steps = 0;
        }
        Ok(true)
    }

    fn state(&self) -> Option<serde_json::Value> {
        serde_json::to_value(ScalerState { scale: self.scale, good_steps: self.good_steps }).ok()
    }

    fn load_state(&mut self, state: &serde_json::Value) -> EngineResult<()> {
        let state: ScalerState =
            serde_json::from_value(state.clone()).map_err(|e| EngineError::InvalidState(e.to_string()))?;
        self.scale = state.scale;
        self.good_steps = state.good_steps;
        Ok(())
    }
}
