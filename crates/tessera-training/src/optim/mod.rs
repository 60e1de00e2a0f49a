//! Optimizer construction and assignment of parameters to optimizers.

mod adam;
mod registry;
mod sgd;

pub use adam::{Adam, AdamConfig};
pub use registry::{OptimizerConstructor, OptimizerKind, OptimizerRegistry};
pub use sgd::{Sgd, SgdConfig};

use crate::assembler::Parts;
use crate::config::Config;
use crate::error::{TrainingError, TrainingResult};
use std::collections::BTreeMap;
use tessera_abstraction::{Optimizer, Parameter};
use tracing::debug;

/// Key of the optimizer shared by every part without its own.
pub const GLOBAL_OPTIMIZER_KEY: &str = "__global";

/// Optimizers keyed by part name or [`GLOBAL_OPTIMIZER_KEY`].
pub type Optimizers = BTreeMap<String, Box<dyn Optimizer>>;

/// Splits the trainable parameters of `parts` across optimizers.
///
/// Frozen parts get nothing. A part with its own `optimizer` section gets a
/// dedicated optimizer keyed by its name. All remaining parts share one
/// optimizer built from the top-level `optimizer` section.
pub fn assign(config: &Config, parts: &Parts, registry: &OptimizerRegistry) -> TrainingResult<Optimizers> {
    let mut optimizers = Optimizers::new();
    let mut pooled: Vec<Parameter> = Vec::new();
    let mut pooled_parts: Vec<String> = Vec::new();

    for spec in config.parts()? {
        if spec.frozen {
            continue;
        }
        let part = parts
            .get(&spec.name)
            .ok_or_else(|| TrainingError::InvalidConfig(format!("part '{}' was not assembled", spec.name)))?;

        match &spec.optimizer {
            Some(own) => {
                debug!(part = %spec.name, optimizer = %own.name, "dedicated optimizer");
                let optimizer = registry.build(own, part.parameters())?;
                optimizers.insert(spec.name.clone(), optimizer);
            }
            None => {
                pooled.extend(part.parameters());
                pooled_parts.push(spec.name.clone());
            }
        }
    }

    if !pooled_parts.is_empty() {
        let global = config.optimizer()?.ok_or_else(|| {
            TrainingError::InvalidConfig(format!(
                "parts {} need the top-level `optimizer` section",
                pooled_parts.join(", ")
            ))
        })?;
        debug!(parts = ?pooled_parts, optimizer = %global.name, "global optimizer");
        optimizers.insert(GLOBAL_OPTIMIZER_KEY.to_string(), registry.build(&global, pooled)?);
    }

    Ok(optimizers)
}

/// Checks every optimizer section `assign` would build from, before any
/// part exists.
pub fn check_assignment(config: &Config, registry: &OptimizerRegistry) -> TrainingResult<()> {
    let mut pooled = false;
    for spec in config.parts()? {
        if spec.frozen {
            continue;
        }
        match &spec.optimizer {
            Some(own) => registry.check(own)?,
            None => pooled = true,
        }
    }
    if pooled {
        let global = config
            .optimizer()?
            .ok_or_else(|| TrainingError::InvalidConfig("the top-level `optimizer` section is missing".to_string()))?;
        registry.check(&global)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Toy;
    use tessera_abstraction::Part;

    fn parts(names: &[&str]) -> Parts {
        let mut parts = Parts::new();
        for name in names {
            parts.insert(*name, Box::new(Toy::new(2)));
        }
        parts
    }

    fn owns(optimizer: &dyn Optimizer, part: &dyn Part) -> bool {
        part.parameters().iter().all(|p| optimizer.parameters().iter().any(|q| q.same_as(p)))
    }

    #[test]
    fn test_frozen_dedicated_and_global() {
        let config = Config::from_yaml_str(
            "optimizer: {name: adam}\nparts:\n  A: {arch: toy, frozen: true}\n  B: {arch: toy, optimizer: {name: sgd, lr: 0.1}}\n  C: {arch: toy}\n  D: {arch: toy}\n",
        )
        .unwrap();
        let parts = parts(&["A", "B", "C", "D"]);
        let optimizers = assign(&config, &parts, &OptimizerRegistry::new()).unwrap();

        let keys: Vec<_> = optimizers.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["B", GLOBAL_OPTIMIZER_KEY]);

        let b = optimizers["B"].as_ref();
        assert_eq!(b.name(), "sgd");
        assert!(owns(b, parts.get("B").unwrap()));
        assert_eq!(b.parameters().len(), parts.get("B").unwrap().parameters().len());

        let global = optimizers[GLOBAL_OPTIMIZER_KEY].as_ref();
        assert_eq!(global.name(), "adam");
        assert!(owns(global, parts.get("C").unwrap()));
        assert!(owns(global, parts.get("D").unwrap()));
        assert_eq!(global.parameters().len(), 4);

        for opt in optimizers.values() {
            assert!(!owns(opt.as_ref(), parts.get("A").unwrap()));
        }
    }

    #[test]
    fn test_no_pool_means_no_global() {
        let config = Config::from_yaml_str(
            "parts:\n  A: {arch: toy, frozen: true}\n  B: {arch: toy, optimizer: {name: adam}}\n",
        )
        .unwrap();
        let optimizers = assign(&config, &parts(&["A", "B"]), &OptimizerRegistry::new()).unwrap();
        assert_eq!(optimizers.keys().collect::<Vec<_>>(), vec!["B"]);
    }

    #[test]
    fn test_pool_without_global_spec_fails() {
        let config = Config::from_yaml_str("parts:\n  C: {arch: toy}\n").unwrap();
        let err = assign(&config, &parts(&["C"]), &OptimizerRegistry::new()).err().unwrap();
        assert!(matches!(err, TrainingError::InvalidConfig(_)));
    }

    #[test]
    fn test_unknown_optimizer_name() {
        let config = Config::from_yaml_str("optimizer: {name: lamb}\nparts:\n  C: {arch: toy}\n").unwrap();
        let err = assign(&config, &parts(&["C"]), &OptimizerRegistry::new()).err().unwrap();
        assert!(matches!(err, TrainingError::UnsupportedOptimizer(_)));
    }

    #[test]
    fn test_check_assignment_matches_assign() {
        let registry = OptimizerRegistry::new();
        let ok = Config::from_yaml_str(
            "optimizer: {name: sgd}\nparts:\n  A: {arch: toy, frozen: true, optimizer: {name: lamb}}\n  B: {arch: toy}\n",
        )
        .unwrap();
        check_assignment(&ok, &registry).unwrap();

        let unknown = Config::from_yaml_str("optimizer: {name: lamb}\nparts:\n  C: {arch: toy}\n").unwrap();
        assert!(matches!(check_assignment(&unknown, &registry), Err(TrainingError::UnsupportedOptimizer(_))));

        let dedicated = Config::from_yaml_str("parts:\n  C: {arch: toy, optimizer: {name: lion}}\n").unwrap();
        assert!(matches!(check_assignment(&dedicated, &registry), Err(TrainingError::UnsupportedOptimizer(_))));

        let missing = Config::from_yaml_str("parts:\n  C: {arch: toy}\n").unwrap();
        assert!(matches!(check_assignment(&missing, &registry), Err(TrainingError::InvalidConfig(_))));
    }
}
