//! Parameter handles and serializable tensor state.

use crate::device::{DType, Device};
use crate::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Serializable snapshot of one tensor: its shape and flat row-major values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorState {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl TensorState {
    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Named tensor states making up a part's weights.
pub type StateDict = BTreeMap<String, TensorState>;

/// Storage behind a [`Parameter`].
#[derive(Debug, Clone, PartialEq)]
pub struct ParamData {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
    /// Accumulated gradient; `None` after `zero_grad`.
    pub grad: Option<Vec<f32>>,
    pub requires_grad: bool,
}

/// Shared handle to a trainable tensor.
///
/// Parts and optimizers hold clones of the same handle, so an optimizer step
/// is visible to the part that owns the parameter.
#[derive(Debug, Clone)]
pub struct Parameter {
    inner: Arc<RwLock<ParamData>>,
}

impl Parameter {
    #[must_use]
    pub fn new(shape: Vec<usize>, values: Vec<f32>) -> Self {
        debug_assert_eq!(shape.iter().product::<usize>(), values.len());
        Self {
            inner: Arc::new(RwLock::new(ParamData {
                shape,
                values,
                grad: None,
                requires_grad: true,
            })),
        }
    }

    #[must_use]
    pub fn zeros(shape: Vec<usize>) -> Self {
        let numel = shape.iter().product();
        Self::new(shape, vec![0.0; numel])
    }

    pub fn read(&self) -> RwLockReadGuard<'_, ParamData> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, ParamData> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.read().values.len()
    }

    #[must_use]
    pub fn shape(&self) -> Vec<usize> {
        self.read().shape.clone()
    }

    #[must_use]
    pub fn values(&self) -> Vec<f32> {
        self.read().values.clone()
    }

    #[must_use]
    pub fn grad(&self) -> Option<Vec<f32>> {
        self.read().grad.clone()
    }

    #[must_use]
    pub fn requires_grad(&self) -> bool {
        self.read().requires_grad
    }

    pub fn set_requires_grad(&self, requires_grad: bool) {
        self.write().requires_grad = requires_grad;
    }

    /// Adds `delta` into the gradient buffer, allocating it on first use.
    pub fn accumulate_grad(&self, delta: &[f32]) -> EngineResult<()> {
        let mut data = self.write();
        if !data.requires_grad {
            return Ok(());
        }
        if delta.len() != data.values.len() {
            return Err(EngineError::ShapeMismatch {
                name: "grad".to_string(),
                expected: vec![data.values.len()],
                actual: vec![delta.len()],
            });
        }
        let numel = data.values.len();
        let grad = data.grad.get_or_insert_with(|| vec![0.0; numel]);
        for (g, d) in grad.iter_mut().zip(delta) {
            *g += d;
        }
        Ok(())
    }

    pub fn zero_grad(&self) {
        self.write().grad = None;
    }

    /// True when both handles point at the same storage.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    #[must_use]
    pub fn to_state(&self) -> TensorState {
        let data = self.read();
        TensorState { shape: data.shape.clone(), values: data.values.clone() }
    }

    pub fn load_state(&self, name: &str, state: &TensorState) -> EngineResult<()> {
        let mut data = self.write();
        if data.shape != state.shape || state.values.len() != state.numel() {
            return Err(EngineError::ShapeMismatch {
                name: name.to_string(),
                expected: data.shape.clone(),
                actual: state.shape.clone(),
            });
        }
        data.values.clone_from(&state.values);
        Ok(())
    }
}

/// Zero-filled input used to trace a part ahead of time.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticInput {
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub device: Device,
    pub values: Vec<f32>,
}

impl SyntheticInput {
    #[must_use]
    pub fn zeros(shape: Vec<usize>, dtype: DType, device: Device) -> Self {
        let numel = shape.iter().product();
        Self { shape, dtype, device, values: vec![0.0; numel] }
    }
}
