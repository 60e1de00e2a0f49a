//! Model parts, losses and batches.

use crate::device::Device;
use crate::tensor::{Parameter, StateDict, SyntheticInput};
use crate::{EngineError, EngineResult};
use std::collections::BTreeSet;

/// A named, independently loadable unit of trainable state.
///
/// Implementors only have to enumerate their parameters and support device
/// placement; state save/load and gradient toggling are derived from
/// [`Part::named_parameters`].
pub trait Part: Send {
    /// Parameters keyed by a name that is stable across runs.
    fn named_parameters(&self) -> Vec<(String, Parameter)>;

    /// Moves the part's storage onto `device`.
    fn to_device(&mut self, device: &Device) -> EngineResult<()>;

    fn parameters(&self) -> Vec<Parameter> {
        self.named_parameters().into_iter().map(|(_, p)| p).collect()
    }

    fn state_dict(&self) -> StateDict {
        self.named_parameters()
            .into_iter()
            .map(|(name, p)| (name, p.to_state()))
            .collect()
    }

    /// Strict load: every parameter needs an entry and every entry a parameter.
    fn load_state_dict(&mut self, state: &StateDict) -> EngineResult<()> {
        let named = self.named_parameters();
        let known: BTreeSet<&str> = named.iter().map(|(name, _)| name.as_str()).collect();
        if let Some(extra) = state.keys().find(|k| !known.contains(k.as_str())) {
            return Err(EngineError::UnexpectedState(extra.clone()));
        }
        for (name, param) in &named {
            let entry = state.get(name).ok_or_else(|| EngineError::MissingState(name.clone()))?;
            param.load_state(name, entry)?;
        }
        Ok(())
    }

    /// Toggles gradient tracking for every parameter of the part.
    fn set_grad_enabled(&mut self, enabled: bool) {
        for param in self.parameters() {
            param.set_requires_grad(enabled);
        }
    }

    /// Returns an ahead-of-time traced form of this part bound to `inputs`.
    fn trace(&self, inputs: &[SyntheticInput]) -> EngineResult<Box<dyn Part>> {
        let _ = inputs;
        Err(EngineError::Unsupported("tracing".to_string()))
    }
}

/// Scalar training loss produced by a train step.
pub trait Loss {
    fn value(&self) -> f64;

    /// Accumulates gradients of `scale * loss` into the parameters.
    fn backward(&mut self, scale: f32) -> EngineResult<()>;
}

/// Anything a data loader yields that can be moved between devices.
pub trait ToDevice: Sized {
    fn to_device(self, device: &Device) -> EngineResult<Self>;
}

/// One batch from a data loader: a single tensor or a list of them.
#[derive(Debug, Clone, PartialEq)]
pub enum Batch<T> {
    Single(T),
    Many(Vec<T>),
}

impl<T: ToDevice> Batch<T> {
    /// Moves the batch onto `device`, element-wise for lists.
    pub fn to_device(self, device: &Device) -> EngineResult<Self> {
        match self {
            Self::Single(item) => Ok(Self::Single(item.to_device(device)?)),
            Self::Many(items) => items
                .into_iter()
                .map(|item| item.to_device(device))
                .collect::<EngineResult<Vec<_>>>()
                .map(Self::Many),
        }
    }
}

impl<T> Batch<T> {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Many(items) => items.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flattens into a list regardless of shape.
    #[must_use]
    pub fn into_vec(self) -> Vec<T> {
        match self {
            Self::Single(item) => vec![item],
            Self::Many(items) => items,
        }
    }
}
