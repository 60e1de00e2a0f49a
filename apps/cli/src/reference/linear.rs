//! `linear` architecture: `y = w · x + b` over a fixed number of features.

use tessera_abstraction::{Device, EngineError, EngineResult, Parameter, Part, SyntheticInput};
use tessera_training::{Config, PartSpec, TrainingResult};

pub const ARCHITECTURE: &str = "linear";

#[derive(Debug, Clone)]
pub struct Linear {
    weight: Parameter,
    bias: Parameter,
}

impl Linear {
    pub fn new(features: usize) -> Self {
        Self { weight: Parameter::zeros(vec![features]), bias: Parameter::zeros(vec![1]) }
    }

    /// Reads `features` from the part, falling back to `data.features`.
    pub fn from_spec(spec: &PartSpec, config: &Config) -> TrainingResult<Self> {
        let fallback = config.lookup("data.features").and_then(serde_yaml::Value::as_u64).unwrap_or(1);
        Ok(Self::new(spec.usize_or("features", fallback as usize)?))
    }

    pub fn features(&self) -> usize {
        self.weight.numel()
    }
}

impl Part for Linear {
    fn named_parameters(&self) -> Vec<(String, Parameter)> {
        vec![("weight".to_string(), self.weight.clone()), ("bias".to_string(), self.bias.clone())]
    }

    fn to_device(&mut self, device: &Device) -> EngineResult<()> {
        if device.is_cpu() { Ok(()) } else { Err(EngineError::UnsupportedDevice(device.to_string())) }
    }

    /// Checks the traced input width; the traced part shares this part's storage.
    fn trace(&self, inputs: &[SyntheticInput]) -> EngineResult<Box<dyn Part>> {
        let width = inputs.first().and_then(|input| input.shape.last().copied());
        if width != Some(self.features()) {
            return Err(EngineError::ShapeMismatch {
                name: "input".to_string(),
                expected: vec![self.features()],
                actual: inputs.first().map(|input| input.shape.clone()).unwrap_or_default(),
            });
        }
        Ok(Box::new(self.clone()))
    }
}
