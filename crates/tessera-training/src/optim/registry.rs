use super::adam::{Adam, AdamConfig};
use super::sgd::{Sgd, SgdConfig};
use crate::config::OptimizerSpec;
use crate::error::{TrainingError, TrainingResult};
use std::collections::HashMap;
use std::fmt;
use tessera_abstraction::{Optimizer, Parameter};

/// Builds an optimizer over `params` from its config section.
pub type OptimizerConstructor =
    dyn Fn(Vec<Parameter>, &OptimizerSpec) -> TrainingResult<Box<dyn Optimizer>> + Send + Sync;

/// Which algorithm an optimizer section asks for.
#[derive(Debug, Clone, PartialEq)]
pub enum OptimizerKind {
    Adam(AdamConfig),
    Sgd(SgdConfig),
    /// Looked up in the [`OptimizerRegistry`] by name.
    Custom(String),
}

impl OptimizerKind {
    pub fn from_spec(spec: &OptimizerSpec) -> TrainingResult<Self> {
        match spec.name.to_ascii_lowercase().as_str() {
            "adam" => Ok(Self::Adam(AdamConfig::from_spec(spec)?)),
            "sgd" => Ok(Self::Sgd(SgdConfig::from_spec(spec)?)),
            _ => Ok(Self::Custom(spec.name.clone())),
        }
    }
}

/// Optimizer constructors beyond the built-in Adam and SGD.
#[derive(Default)]
pub struct OptimizerRegistry {
    custom: HashMap<String, Box<OptimizerConstructor>>,
}

impl fmt::Debug for OptimizerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.custom.keys().collect();
        names.sort();
        f.debug_struct("OptimizerRegistry").field("custom", &names).finish()
    }
}

impl OptimizerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a constructor under `name`, replacing any earlier one.
    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(Vec<Parameter>, &OptimizerSpec) -> TrainingResult<Box<dyn Optimizer>> + Send + Sync + 'static,
    {
        self.custom.insert(name.into(), Box::new(constructor));
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.custom.contains_key(name)
    }

    /// Fails like [`OptimizerRegistry::build`] would on a bad section,
    /// without building anything.
    pub fn check(&self, spec: &OptimizerSpec) -> TrainingResult<()> {
        match OptimizerKind::from_spec(spec)? {
            OptimizerKind::Custom(name) if !self.contains(&name) => Err(TrainingError::UnsupportedOptimizer(name)),
            _ => Ok(()),
        }
    }

    pub fn build(&self, spec: &OptimizerSpec, params: Vec<Parameter>) -> TrainingResult<Box<dyn Optimizer>> {
        match OptimizerKind::from_spec(spec)? {
            OptimizerKind::Adam(config) => Ok(Box::new(Adam::new(params, config))),
            OptimizerKind::Sgd(config) => Ok(Box::new(Sgd::new(params, config))),
            OptimizerKind::Custom(name) => {
                let constructor = self
                    .custom
                    .get(&name)
                    .ok_or_else(|| TrainingError::UnsupportedOptimizer(name.clone()))?;
                constructor(params, spec)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_yaml::Mapping;

    fn spec(yaml: &str) -> OptimizerSpec {
        let params: Mapping = serde_yaml::from_str(yaml).unwrap();
        let name = params.get("name").and_then(|v| v.as_str()).unwrap().to_string();
        OptimizerSpec { name, params }
    }

    #[test]
    fn test_kind_defaults() {
        assert_eq!(OptimizerKind::from_spec(&spec("name: adam")).unwrap(), OptimizerKind::Adam(AdamConfig::default()));
        assert_eq!(OptimizerKind::from_spec(&spec("name: SGD")).unwrap(), OptimizerKind::Sgd(SgdConfig::default()));
        assert_eq!(
            OptimizerKind::from_spec(&spec("name: lamb")).unwrap(),
            OptimizerKind::Custom("lamb".to_string())
        );
    }

    #[test]
    fn test_kind_reads_hyperparameters() {
        let kind = OptimizerKind::from_spec(&spec("name: adam\nlr: 0.01\nbetas: [0.5, 0.9]\namsgrad: true")).unwrap();
        let OptimizerKind::Adam(config) = kind else {
            panic!("expected adam, got {kind:?}");
        };
        assert!((config.lr - 0.01).abs() < f64::EPSILON);
        assert_eq!(config.betas, (0.5, 0.9));
        assert!(config.amsgrad);

        assert!(OptimizerKind::from_spec(&spec("name: adam\nbetas: [0.5]")).is_err());
        assert!(OptimizerKind::from_spec(&spec("name: sgd\nnesterov: true")).is_err());
    }

    #[test]
    fn test_unknown_optimizer_is_unsupported() {
        let registry = OptimizerRegistry::new();
        let err = registry.build(&spec("name: lamb"), vec![]).err().unwrap();
        assert!(matches!(err, TrainingError::UnsupportedOptimizer(name) if name == "lamb"));
    }

    #[test]
    fn test_registered_constructor_is_used() {
        let mut registry = OptimizerRegistry::new();
        registry.register("frozen_sgd", |params, _spec| {
            Ok(Box::new(Sgd::new(params, SgdConfig { lr: 0.0, ..SgdConfig::default() })) as Box<dyn Optimizer>)
        });
        assert!(registry.contains("frozen_sgd"));

        let p = Parameter::zeros(vec![2]);
        let opt = registry.build(&spec("name: frozen_sgd"), vec![p.clone()]).unwrap();
        assert_eq!(opt.name(), "sgd");
        assert!(opt.parameters()[0].same_as(&p));
    }
}
