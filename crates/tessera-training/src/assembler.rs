//! Builds the named parts of a model from a resolved config.

use crate::checkpoint::Snapshot;
use crate::config::{Config, PartSpec};
use crate::error::{TrainingError, TrainingResult};
use crate::registry::{ModelRegistry, WeightsRef};
use regex::Regex;
use serde_yaml::Value;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use tessera_abstraction::{DType, Device, Part, SyntheticInput};
use tracing::{debug, info, warn};

/// Creates an untrained part for an architecture name.
pub trait PartConstructor: Send + Sync {
    fn construct(&self, architecture: &str, spec: &PartSpec, config: &Config) -> TrainingResult<Box<dyn Part>>;

    /// Rejects architectures `construct` cannot build, without building
    /// anything. Runs in the launching process before workers start.
    fn check(&self, _architecture: &str, _spec: &PartSpec) -> TrainingResult<()> {
        Ok(())
    }
}

type ArchitectureFn = dyn Fn(&PartSpec, &Config) -> TrainingResult<Box<dyn Part>> + Send + Sync;

/// A [`PartConstructor`] backed by a table of named builders.
#[derive(Default)]
pub struct ArchitectureRegistry {
    builders: HashMap<String, Box<ArchitectureFn>>,
}

impl fmt::Debug for ArchitectureRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchitectureRegistry").field("architectures", &self.names()).finish()
    }
}

impl ArchitectureRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, architecture: impl Into<String>, builder: F)
    where
        F: Fn(&PartSpec, &Config) -> TrainingResult<Box<dyn Part>> + Send + Sync + 'static,
    {
        self.builders.insert(architecture.into(), Box::new(builder));
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.builders.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl ArchitectureRegistry {
    fn builder(&self, architecture: &str, spec: &PartSpec) -> TrainingResult<&ArchitectureFn> {
        self.builders.get(architecture).map(|b| &**b).ok_or_else(|| {
            TrainingError::InvalidConfig(format!(
                "part '{}': unknown architecture '{architecture}' (known: {})",
                spec.name,
                self.names().join(", ")
            ))
        })
    }
}

impl PartConstructor for ArchitectureRegistry {
    fn construct(&self, architecture: &str, spec: &PartSpec, config: &Config) -> TrainingResult<Box<dyn Part>> {
        (self.builder(architecture, spec)?)(spec, config)
    }

    fn check(&self, architecture: &str, spec: &PartSpec) -> TrainingResult<()> {
        self.builder(architecture, spec).map(|_| ())
    }
}

/// Named parts in config declaration order.
#[derive(Default)]
pub struct Parts {
    entries: Vec<(String, Box<dyn Part>)>,
}

impl fmt::Debug for Parts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl Parts {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_entries(entries: Vec<(String, Box<dyn Part>)>) -> Self {
        Self { entries }
    }

    /// Appends a part, or replaces an existing one in place.
    pub fn insert(&mut self, name: impl Into<String>, part: Box<dyn Part>) {
        let name = name.into();
        if let Some(slot) = self.entries.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = part;
        } else {
            self.entries.push((name, part));
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&dyn Part> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, p)| p.as_ref())
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut dyn Part> {
        for (n, p) in &mut self.entries {
            if n == name {
                return Some(p.as_mut());
            }
        }
        None
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &dyn Part)> {
        self.entries.iter().map(|(n, p)| (n.as_str(), p.as_ref()))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut Box<dyn Part>)> {
        self.entries.iter_mut().map(|(n, p)| (n.as_str(), p))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn into_entries(self) -> Vec<(String, Box<dyn Part>)> {
        self.entries
    }
}

/// Constructs, places, loads and optionally traces every configured part.
pub struct PartAssembler<'a> {
    constructor: &'a dyn PartConstructor,
    registry: ModelRegistry,
}

impl<'a> PartAssembler<'a> {
    #[must_use]
    pub fn new(constructor: &'a dyn PartConstructor, registry: ModelRegistry) -> Self {
        Self { constructor, registry }
    }

    /// Checks every part without constructing it: an architecture the
    /// constructor knows, and a well-formed `weights` reference whose
    /// snapshot exists.
    pub fn check(&self, config: &Config) -> TrainingResult<()> {
        for spec in config.parts()? {
            let architecture = spec
                .architecture
                .as_deref()
                .ok_or_else(|| TrainingError::MissingArchitecture(spec.name.clone()))?;
            self.constructor.check(architecture, &spec)?;

            if let Some(weights) = &spec.weights {
                let reference = WeightsRef::parse(weights)?;
                let path = self.registry.snapshot_path(&reference.checkpoint());
                if !path.is_file() {
                    return Err(TrainingError::CheckpointNotFound(path));
                }
            }
        }
        Ok(())
    }

    pub fn assemble(
        &self,
        config: &Config,
        device: &Device,
        apply_jit: bool,
        load_weights: bool,
    ) -> TrainingResult<Parts> {
        let mut parts = Parts::new();
        let mut snapshots: HashMap<PathBuf, Snapshot> = HashMap::new();

        for spec in config.parts()? {
            let architecture = spec
                .architecture
                .as_deref()
                .ok_or_else(|| TrainingError::MissingArchitecture(spec.name.clone()))?;
            debug!(part = %spec.name, architecture, "constructing part");
            let mut part = self.constructor.construct(architecture, &spec, config)?;
            part.to_device(device)?;

            if load_weights && let Some(weights) = &spec.weights {
                let reference = WeightsRef::parse(weights)?;
                let path = self.registry.snapshot_path(&reference.checkpoint());
                if !snapshots.contains_key(&path) {
                    snapshots.insert(path.clone(), Snapshot::load(&path)?);
                }
                let state = snapshots
                    .get(&path)
                    .and_then(|s| s.parts.get(&reference.part))
                    .ok_or_else(|| TrainingError::PartNotInCheckpoint {
                        part: reference.part.clone(),
                        checkpoint: path.clone(),
                    })?;
                part.load_state_dict(state)?;
                info!(part = %spec.name, weights = %reference, "loaded pretrained weights");
            }

            if apply_jit && let Some(shape_spec) = &spec.jit {
                match parse_jit_shapes(shape_spec, config, device) {
                    Ok(inputs) => {
                        part = part.trace(&inputs)?;
                        debug!(part = %spec.name, inputs = inputs.len(), "traced part");
                    }
                    Err(e) => warn!(part = %spec.name, error = %e, "skipping jit trace"),
                }
            }

            if spec.frozen {
                part.set_grad_enabled(false);
            }
            parts.insert(spec.name, part);
        }
        Ok(parts)
    }
}

/// Loads every part the snapshot has weights for; other parts are untouched.
pub fn load_states(parts: &mut Parts, snapshot: &Snapshot) -> TrainingResult<()> {
    for (name, state) in &snapshot.parts {
        match parts.get_mut(name) {
            Some(part) => part.load_state_dict(state)?,
            None => warn!(part = %name, "checkpoint holds a part the model does not have"),
        }
    }
    Ok(())
}

/// Parses a shape spec like `[batch_size, 3]@half, [16]` into zero-filled
/// inputs. Symbolic dimensions are config keys (dotted paths allowed).
pub fn parse_jit_shapes(spec: &str, config: &Config, device: &Device) -> TrainingResult<Vec<SyntheticInput>> {
    let shape_error = |reason: String| TrainingError::ShapeParse { spec: spec.to_string(), reason };
    let pattern = Regex::new(r"\[([^\]]+)\]@?([^,\[]+)?").map_err(|e| shape_error(e.to_string()))?;

    let mut inputs = Vec::new();
    for captures in pattern.captures_iter(spec) {
        let dims = captures.get(1).map_or("", |m| m.as_str());
        let shape = dims
            .split(',')
            .map(|dim| resolve_dim(dim, config).map_err(&shape_error))
            .collect::<TrainingResult<Vec<usize>>>()?;
        let dtype = captures.get(2).map_or(DType::F32, |m| DType::from_name(m.as_str()));
        inputs.push(SyntheticInput::zeros(shape, dtype, *device));
    }

    if inputs.is_empty() {
        return Err(shape_error("no `[dims]` groups found".to_string()));
    }
    Ok(inputs)
}

fn resolve_dim(raw: &str, config: &Config) -> Result<usize, String> {
    let dim = raw.trim().trim_matches(|c| c == '\'' || c == '"');
    if dim.is_empty() {
        return Err("empty dimension".to_string());
    }
    if let Ok(n) = dim.parse::<usize>() {
        return Ok(n);
    }
    match config.lookup(dim) {
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| format!("`{dim}` is not a non-negative integer")),
        Some(_) => Err(format!("`{dim}` is not a non-negative integer")),
        None => Err(format!("unknown dimension `{dim}`")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::Snapshot;
    use crate::layout::ModelLayout;
    use crate::testing::{ToyConstructor, toy_state};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn config(yaml: &str) -> Config {
        Config::from_yaml_str(yaml).unwrap()
    }

    fn assembler<'a>(constructor: &'a ToyConstructor, temp: &TempDir) -> PartAssembler<'a> {
        PartAssembler::new(constructor, ModelRegistry::new(ModelLayout::new(temp.path())))
    }

    fn write_snapshot(temp: &TempDir, model: &str, tag: &str, parts: &[(&str, f32)]) {
        let snapshot = Snapshot {
            epoch: 0,
            batch: 0,
            parts: parts.iter().map(|(n, v)| ((*n).to_string(), toy_state(2, *v))).collect(),
            optimizers: BTreeMap::new(),
            mixed_precision: None,
            metrics: BTreeMap::new(),
        };
        snapshot.write(&ModelLayout::new(temp.path()).snapshot_path(model, tag)).unwrap();
    }

    #[test]
    fn test_parts_keep_declaration_order() {
        let temp = TempDir::new().unwrap();
        let constructor = ToyConstructor::default();
        let cfg = config("parts:\n  z: {arch: toy}\n  a: {arch: toy, size: 3}\n");
        let parts = assembler(&constructor, &temp).assemble(&cfg, &Device::Cpu, false, false).unwrap();
        assert_eq!(parts.names(), vec!["z", "a"]);
        assert_eq!(parts.get("a").unwrap().parameters()[0].numel(), 3);
    }

    #[test]
    fn test_missing_architecture() {
        let temp = TempDir::new().unwrap();
        let constructor = ToyConstructor::default();
        let cfg = config("parts:\n  a: {frozen: true}\n");
        let err = assembler(&constructor, &temp).assemble(&cfg, &Device::Cpu, false, false).unwrap_err();
        assert!(matches!(err, TrainingError::MissingArchitecture(name) if name == "a"));
    }

    #[test]
    fn test_loads_weights_from_snapshot() {
        let temp = TempDir::new().unwrap();
        write_snapshot(&temp, "5", "0000.000002", &[("encoder", 7.0)]);
        let constructor = ToyConstructor::default();
        let cfg = config("parts:\n  enc: {arch: toy, weights: 5.encoder@0000.000002}\n  fresh: {arch: toy}\n");

        let parts = assembler(&constructor, &temp).assemble(&cfg, &Device::Cpu, false, true).unwrap();
        assert_eq!(parts.get("enc").unwrap().parameters()[0].values(), vec![7.0, 7.0]);
        assert_eq!(parts.get("fresh").unwrap().parameters()[0].values(), vec![0.0, 0.0]);

        let untouched = assembler(&constructor, &temp).assemble(&cfg, &Device::Cpu, false, false).unwrap();
        assert_eq!(untouched.get("enc").unwrap().parameters()[0].values(), vec![0.0, 0.0]);
    }

    #[test]
    fn test_weights_errors() {
        let temp = TempDir::new().unwrap();
        write_snapshot(&temp, "5", "latest", &[("encoder", 1.0)]);
        let constructor = ToyConstructor::default();

        let cfg = config("parts:\n  enc: {arch: toy, weights: 5.decoder}\n");
        let err = assembler(&constructor, &temp).assemble(&cfg, &Device::Cpu, false, true).unwrap_err();
        assert!(matches!(err, TrainingError::PartNotInCheckpoint { part, .. } if part == "decoder"));

        let cfg = config("parts:\n  enc: {arch: toy, weights: 6.encoder}\n");
        let err = assembler(&constructor, &temp).assemble(&cfg, &Device::Cpu, false, true).unwrap_err();
        assert!(matches!(err, TrainingError::CheckpointNotFound(_)));
    }

    #[test]
    fn test_frozen_parts_do_not_track_grads() {
        let temp = TempDir::new().unwrap();
        let constructor = ToyConstructor::default();
        let cfg = config("parts:\n  a: {arch: toy, frozen: true}\n  b: {arch: toy}\n");
        let parts = assembler(&constructor, &temp).assemble(&cfg, &Device::Cpu, false, false).unwrap();
        assert!(parts.get("a").unwrap().parameters().iter().all(|p| !p.requires_grad()));
        assert!(parts.get("b").unwrap().parameters().iter().all(|p| p.requires_grad()));
    }

    #[test]
    fn test_jit_parse_failure_skips_only_that_part() {
        let temp = TempDir::new().unwrap();
        let constructor = ToyConstructor::default();
        let cfg = config(
            "batch_size: 4\nmodel: {width: 8}\nparts:\n  good: {arch: toy, jit: \"[batch_size, 'model.width']@half\"}\n  bad: {arch: toy, jit: \"[nope, 3]\"}\n",
        );
        let parts = assembler(&constructor, &temp).assemble(&cfg, &Device::Cpu, true, false).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(constructor.traced(), vec![vec![vec![4, 8]]]);

        let untraced = ToyConstructor::default();
        assembler(&untraced, &temp).assemble(&cfg, &Device::Cpu, false, false).unwrap();
        assert!(untraced.traced().is_empty());
    }

    #[test]
    fn test_parse_jit_shapes() {
        let cfg = config("batch_size: 2\nseq: 5\nname: abc\n");
        let inputs = parse_jit_shapes("[batch_size, 3]@int64, [\"seq\"]@half, [1]", &cfg, &Device::Cuda(1)).unwrap();
        assert_eq!(inputs.len(), 3);
        assert_eq!(inputs[0].shape, vec![2, 3]);
        assert_eq!(inputs[0].dtype, DType::I64);
        assert_eq!(inputs[0].device, Device::Cuda(1));
        assert_eq!(inputs[1].shape, vec![5]);
        assert_eq!(inputs[1].dtype, DType::F16);
        assert_eq!(inputs[2].dtype, DType::F32);

        for bad in ["", "3, 4", "[missing]", "[name]", "[2, ]"] {
            assert!(
                matches!(parse_jit_shapes(bad, &cfg, &Device::Cpu), Err(TrainingError::ShapeParse { .. })),
                "{bad} should fail"
            );
        }
    }

    #[test]
    fn test_load_states_skips_unknown_parts() {
        let constructor = ToyConstructor::default();
        let cfg = config("parts:\n  a: {arch: toy}\n");
        let temp = TempDir::new().unwrap();
        let mut parts = assembler(&constructor, &temp).assemble(&cfg, &Device::Cpu, false, false).unwrap();

        let snapshot = Snapshot {
            epoch: 0,
            batch: 0,
            parts: [("a".to_string(), toy_state(2, 3.0)), ("gone".to_string(), toy_state(2, 1.0))]
                .into_iter()
                .collect(),
            optimizers: BTreeMap::new(),
            mixed_precision: None,
            metrics: BTreeMap::new(),
        };
        load_states(&mut parts, &snapshot).unwrap();
        assert_eq!(parts.get("a").unwrap().parameters()[0].values(), vec![3.0, 3.0]);
    }
}
