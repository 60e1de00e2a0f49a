//! Weighted running averages.

use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Incremental weighted mean.
///
/// After any sequence of updates `average` equals `Σ(w·x) / Σw`, regardless
/// of the order the observations arrived in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningAverage {
    average: f64,
    total_weight: f64,
}

impl RunningAverage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds in one observation with the given weight.
    ///
    /// A zero weight is a no-op once something has been observed; before
    /// that it would leave the mean undefined.
    pub fn update(&mut self, value: f64, weight: f64) -> TrainingResult<()> {
        if !weight.is_finite() || weight < 0.0 {
            return Err(TrainingError::InvalidWeight(weight));
        }
        let total = self.total_weight + weight;
        if total <= 0.0 {
            return Err(TrainingError::DivisionByZeroWeight);
        }
        self.total_weight = total;
        self.average += (value - self.average) * weight / total;
        Ok(())
    }

    /// Shorthand for an update with weight 1.
    pub fn observe(&mut self, value: f64) -> TrainingResult<()> {
        self.update(value, 1.0)
    }

    #[must_use]
    pub fn get(&self) -> f64 {
        self.average
    }

    #[must_use]
    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total_weight == 0.0
    }
}

/// Named meters a trainer updates during its train steps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainMetrics {
    meters: BTreeMap<String, RunningAverage>,
}

impl TrainMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-registers meters so they show up before their first update.
    #[must_use]
    pub fn with_meters<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            meters: names.into_iter().map(|n| (n.into(), RunningAverage::new())).collect(),
        }
    }

    pub fn update(&mut self, name: &str, value: f64, weight: f64) -> TrainingResult<()> {
        self.meters.entry(name.to_string()).or_default().update(value, weight)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<f64> {
        self.meters.get(name).filter(|m| !m.is_empty()).map(RunningAverage::get)
    }

    /// Current averages of every meter that has seen at least one value.
    #[must_use]
    pub fn averages(&self) -> BTreeMap<String, f64> {
        self.meters
            .iter()
            .filter(|(_, m)| !m.is_empty())
            .map(|(name, m)| (name.clone(), m.get()))
            .collect()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.meters.keys().map(String::as_str)
    }

    pub fn reset(&mut self) {
        for meter in self.meters.values_mut() {
            *meter = RunningAverage::new();
        }
    }
}
