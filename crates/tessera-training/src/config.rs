//! Layered training configuration.
//!
//! A configuration is a YAML mapping. [`ConfigResolver`] turns a named config
//! into a fully resolved [`Config`]:
//!
//! 1. load `<config_folder>/<name>.yaml`
//! 2. merge dotted `key=value` overrides on top
//! 3. merge the configs listed under `load` underneath it
//! 4. inherit part specs (and weights) from previously trained models
//! 5. fill defaults
//!
//! Mappings merge key by key; any other value is replaced by the overlay.

use crate::error::{TrainingError, TrainingResult};
use crate::layout::ModelLayout;
use crate::optim::GLOBAL_OPTIMIZER_KEY;
use crate::registry::{ModelRegistry, WeightsRef};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_BATCH_SIZE: u64 = 16;
pub const DEFAULT_EPOCHS: u64 = 10;
pub const DEFAULT_SEED: u64 = 42;
pub const DEFAULT_LOGGER_MIN_WAIT: f64 = 5.0;
pub const DEFAULT_RENDEZVOUS_TIMEOUT_SECS: u64 = 300;

const LOAD_KEY: &str = "load";
const PARTS_KEY: &str = "parts";
const WEIGHTS_KEY: &str = "weights";

/// A resolved configuration tree.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Config {
    tree: Mapping,
}

/// Optimizer section: an algorithm name plus free-form hyperparameters.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerSpec {
    pub name: String,
    pub params: Mapping,
}

/// One entry of the `parts` section.
#[derive(Debug, Clone, PartialEq)]
pub struct PartSpec {
    pub name: String,
    pub architecture: Option<String>,
    pub frozen: bool,
    pub optimizer: Option<OptimizerSpec>,
    pub weights: Option<String>,
    pub jit: Option<String>,
    /// The full part mapping, including keys only the part constructor reads.
    pub raw: Mapping,
}

impl Config {
    #[must_use]
    pub fn from_mapping(tree: Mapping) -> Self {
        Self { tree }
    }

    pub fn from_yaml_str(content: &str) -> TrainingResult<Self> {
        match serde_yaml::from_str::<Value>(content)? {
            Value::Null => Ok(Self::default()),
            Value::Mapping(tree) => Ok(Self { tree }),
            other => Err(TrainingError::InvalidConfig(format!(
                "top level must be a mapping, found {}",
                kind(&other)
            ))),
        }
    }

    pub fn load(path: &Path) -> TrainingResult<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TrainingError::ConfigNotFound(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };
        Self::from_yaml_str(&content)
    }

    pub fn save(&self, path: &Path) -> TrainingResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_yaml_string()?)?;
        Ok(())
    }

    pub fn to_yaml_string(&self) -> TrainingResult<String> {
        Ok(serde_yaml::to_string(&self.tree)?)
    }

    #[must_use]
    pub fn tree(&self) -> &Mapping {
        &self.tree
    }

    #[must_use]
    pub fn into_tree(self) -> Mapping {
        self.tree
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.tree.get(key).filter(|v| !v.is_null())
    }

    /// Looks up a dotted path such as `model.hidden`.
    #[must_use]
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let mut current = self.get(segments.next()?)?;
        for segment in segments {
            current = current.as_mapping()?.get(segment)?;
        }
        Some(current).filter(|v| !v.is_null())
    }

    pub fn batch_size(&self) -> TrainingResult<usize> {
        self.required_count("batch_size")
    }

    pub fn validation_batch_size(&self) -> TrainingResult<usize> {
        self.required_count("validation_batch_size")
    }

    pub fn epochs(&self) -> TrainingResult<usize> {
        self.required_count("epochs")
    }

    #[must_use]
    pub fn seed(&self) -> u64 {
        self.get("seed").and_then(Value::as_u64).unwrap_or(DEFAULT_SEED)
    }

    /// The global optimizer section, if any.
    pub fn optimizer(&self) -> TrainingResult<Option<OptimizerSpec>> {
        self.get("optimizer").map(|v| OptimizerSpec::from_value("optimizer", v)).transpose()
    }

    /// Part specs in declaration order.
    pub fn parts(&self) -> TrainingResult<Vec<PartSpec>> {
        let parts = self
            .get(PARTS_KEY)
            .ok_or_else(|| TrainingError::InvalidConfig("config has no `parts` section".to_string()))?;
        let parts = parts
            .as_mapping()
            .ok_or_else(|| TrainingError::InvalidConfig("`parts` must be a mapping".to_string()))?;
        parts
            .iter()
            .map(|(name, spec)| {
                let name = name
                    .as_str()
                    .ok_or_else(|| TrainingError::InvalidConfig("part names must be strings".to_string()))?;
                if name == GLOBAL_OPTIMIZER_KEY {
                    return Err(TrainingError::InvalidConfig(format!(
                        "`{GLOBAL_OPTIMIZER_KEY}` is reserved and cannot name a part"
                    )));
                }
                PartSpec::from_value(name, spec)
            })
            .collect()
    }

    /// Opt level for mixed precision; `apex` is accepted as a legacy alias.
    #[must_use]
    pub fn mixed_precision(&self) -> Option<String> {
        let value = self.get("mixed_precision").or_else(|| self.get("apex"))?;
        match value {
            Value::Bool(true) => Some("O1".to_string()),
            Value::String(level) if !level.is_empty() => Some(level.clone()),
            _ => None,
        }
    }

    #[must_use]
    pub fn load_checkpoint(&self) -> Option<String> {
        self.get("load_checkpoint").filter(|v| !v.is_null()).map(scalar_to_string)
    }

    #[must_use]
    pub fn load_optimizers(&self) -> bool {
        self.get("load_optimizers").and_then(Value::as_bool).unwrap_or(true)
    }

    /// `None` when unset; `Some(None)` when explicitly disabled (`-1` or `0`).
    #[must_use]
    pub fn validate_every(&self) -> Option<Option<usize>> {
        let every = self.get("validate_every")?.as_i64()?;
        Some(usize::try_from(every).ok().filter(|n| *n > 0))
    }

    /// Minimum seconds between progress lines.
    #[must_use]
    pub fn logger_min_wait(&self) -> f64 {
        self.get("logger_min_wait").and_then(Value::as_f64).unwrap_or(DEFAULT_LOGGER_MIN_WAIT)
    }

    #[must_use]
    pub fn rendezvous_timeout(&self) -> Duration {
        Duration::from_secs(
            self.get("rendezvous_timeout")
                .and_then(Value::as_u64)
                .unwrap_or(DEFAULT_RENDEZVOUS_TIMEOUT_SECS),
        )
    }

    fn required_count(&self, key: &str) -> TrainingResult<usize> {
        self.get(key)
            .and_then(Value::as_u64)
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| TrainingError::InvalidConfig(format!("`{key}` must be a non-negative integer")))
    }
}

impl OptimizerSpec {
    fn from_value(owner: &str, value: &Value) -> TrainingResult<Self> {
        let params = value
            .as_mapping()
            .ok_or_else(|| TrainingError::InvalidConfig(format!("{owner}: optimizer must be a mapping")))?;
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| TrainingError::InvalidConfig(format!("{owner}: optimizer needs a `name`")))?;
        Ok(Self { name: name.to_string(), params: params.clone() })
    }

    pub fn f64_or(&self, key: &str, default: f64) -> TrainingResult<f64> {
        match self.params.get(key) {
            None | Some(Value::Null) => Ok(default),
            Some(v) => v.as_f64().ok_or_else(|| self.invalid(key, "a number")),
        }
    }

    pub fn bool_or(&self, key: &str, default: bool) -> TrainingResult<bool> {
        match self.params.get(key) {
            None | Some(Value::Null) => Ok(default),
            Some(v) => v.as_bool().ok_or_else(|| self.invalid(key, "a boolean")),
        }
    }

    pub fn pair_or(&self, key: &str, default: (f64, f64)) -> TrainingResult<(f64, f64)> {
        match self.params.get(key) {
            None | Some(Value::Null) => Ok(default),
            Some(v) => match v.as_sequence().map(Vec::as_slice) {
                Some([a, b]) => match (a.as_f64(), b.as_f64()) {
                    (Some(a), Some(b)) => Ok((a, b)),
                    _ => Err(self.invalid(key, "a pair of numbers")),
                },
                _ => Err(self.invalid(key, "a pair of numbers")),
            },
        }
    }

    fn invalid(&self, key: &str, expected: &str) -> TrainingError {
        TrainingError::InvalidConfig(format!("optimizer '{}': `{key}` must be {expected}", self.name))
    }
}

impl PartSpec {
    fn from_value(name: &str, value: &Value) -> TrainingResult<Self> {
        let raw = match value {
            Value::Null => Mapping::new(),
            Value::Mapping(m) => m.clone(),
            other => {
                return Err(TrainingError::InvalidConfig(format!(
                    "part '{name}' must be a mapping, found {}",
                    kind(other)
                )));
            }
        };

        let architecture = raw
            .get("arch")
            .or_else(|| raw.get("architecture"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let frozen = raw.get("frozen").and_then(Value::as_bool).unwrap_or(false);
        let optimizer = raw
            .get("optimizer")
            .filter(|v| !v.is_null())
            .map(|v| OptimizerSpec::from_value(name, v))
            .transpose()?;
        let weights = raw.get(WEIGHTS_KEY).filter(|v| !v.is_null()).map(scalar_to_string);
        let jit = match raw.get("jit") {
            None | Some(Value::Null | Value::Bool(false)) => None,
            Some(Value::String(s)) if s.trim().is_empty() => None,
            Some(other) => Some(scalar_to_string(other)),
        };

        Ok(Self { name: name.to_string(), architecture, frozen, optimizer, weights, jit, raw })
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.raw.get(key)
    }

    pub fn usize_or(&self, key: &str, default: usize) -> TrainingResult<usize> {
        match self.raw.get(key) {
            None | Some(Value::Null) => Ok(default),
            Some(v) => v
                .as_u64()
                .and_then(|n| usize::try_from(n).ok())
                .ok_or_else(|| {
                    TrainingError::InvalidConfig(format!("part '{}': `{key}` must be a non-negative integer", self.name))
                }),
        }
    }
}

/// Resolves named configurations against a config folder and a model folder.
#[derive(Debug, Clone)]
pub struct ConfigResolver {
    config_folder: PathBuf,
    registry: ModelRegistry,
}

impl ConfigResolver {
    #[must_use]
    pub fn new(config_folder: impl Into<PathBuf>, layout: ModelLayout) -> Self {
        Self { config_folder: config_folder.into(), registry: ModelRegistry::new(layout) }
    }

    #[must_use]
    pub fn config_path(&self, name: &str) -> PathBuf {
        let name = name.strip_suffix(".yaml").unwrap_or(name);
        self.config_folder.join(format!("{name}.yaml"))
    }

    pub fn resolve(&self, name: &str, overrides: &[String]) -> TrainingResult<Config> {
        let base = Config::load(&self.config_path(name))?;
        self.resolve_tree(base.into_tree(), overrides)
    }

    /// Runs every resolution step after loading on an in-memory tree.
    pub fn resolve_tree(&self, mut tree: Mapping, overrides: &[String]) -> TrainingResult<Config> {
        merge(&mut tree, parse_overrides(overrides)?);
        let mut tree = self.merge_loaded(tree)?;
        self.inherit_parts(&mut tree)?;
        fill_defaults(&mut tree)?;
        Ok(Config::from_mapping(tree))
    }

    fn merge_loaded(&self, mut tree: Mapping) -> TrainingResult<Mapping> {
        let Some(load) = tree.shift_remove(LOAD_KEY) else {
            return Ok(tree);
        };
        let names: Vec<String> = match load {
            Value::Null => Vec::new(),
            Value::String(name) => vec![name],
            Value::Sequence(items) => items.iter().map(scalar_to_string).collect(),
            other => {
                return Err(TrainingError::InvalidConfig(format!(
                    "`load` must be a config name or a list of names, found {}",
                    kind(&other)
                )));
            }
        };

        let mut merged = Mapping::new();
        for name in &names {
            debug!(config = %name, "merging loaded config");
            merge(&mut merged, Config::load(&self.config_path(name))?.into_tree());
        }
        merge(&mut merged, tree);
        merged.shift_remove(LOAD_KEY);
        Ok(merged)
    }

    fn inherit_parts(&self, tree: &mut Mapping) -> TrainingResult<()> {
        let Some(Value::Mapping(parts)) = tree.get_mut(PARTS_KEY) else {
            return Ok(());
        };

        for (name, spec) in parts.iter_mut() {
            let Value::Mapping(spec) = spec else {
                continue;
            };
            let Some(load) = spec.shift_remove(LOAD_KEY) else {
                continue;
            };
            let reference = WeightsRef::parse(&scalar_to_string(&load))?;
            let part_name = name.as_str().unwrap_or_default();
            debug!(part = part_name, source = %reference, "inheriting part spec");

            let source = self.registry.read_model_config(&reference.model_id)?;
            let mut inherited = match source.lookup(&format!("{PARTS_KEY}.{}", reference.part)) {
                Some(Value::Mapping(m)) => m.clone(),
                _ => {
                    return Err(TrainingError::PartNotInModel {
                        model_id: reference.model_id.clone(),
                        part: reference.part.clone(),
                    });
                }
            };
            merge(&mut inherited, std::mem::take(spec));
            if inherited.get(WEIGHTS_KEY).is_none_or(Value::is_null) {
                inherited.insert(WEIGHTS_KEY.into(), reference.to_string().into());
            }
            *spec = inherited;
        }
        Ok(())
    }
}

/// Deep-merges `overlay` into `base`; the overlay wins on conflicts.
pub fn merge(base: &mut Mapping, overlay: Mapping) {
    for (key, value) in overlay {
        if let Value::Mapping(incoming) = value {
            if let Some(Value::Mapping(existing)) = base.get_mut(&key) {
                merge(existing, incoming);
                continue;
            }
            base.insert(key, Value::Mapping(incoming));
        } else {
            base.insert(key, value);
        }
    }
}

/// Turns `a.b.c=value` overrides into a nested mapping.
///
/// Values are read as YAML, so `3` is a number, `true` a boolean and
/// `[1, 2]` a list; anything unparsable is kept as a string.
pub fn parse_overrides(overrides: &[String]) -> TrainingResult<Mapping> {
    let mut out = Mapping::new();
    for item in overrides {
        let (path, raw) = item
            .split_once('=')
            .ok_or_else(|| TrainingError::InvalidOverride(item.clone()))?;
        let segments: Vec<&str> = path.trim().split('.').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(TrainingError::InvalidOverride(item.clone()));
        }

        let value = serde_yaml::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        let nested = segments
            .iter()
            .rev()
            .fold(value, |acc, segment| {
                let mut m = Mapping::new();
                m.insert((*segment).into(), acc);
                Value::Mapping(m)
            });
        if let Value::Mapping(m) = nested {
            merge(&mut out, m);
        }
    }
    Ok(out)
}

fn fill_defaults(tree: &mut Mapping) -> TrainingResult<()> {
    fill(tree, "batch_size", DEFAULT_BATCH_SIZE.into());
    fill(tree, "epochs", DEFAULT_EPOCHS.into());
    fill(tree, "seed", DEFAULT_SEED.into());

    let batch_size = tree
        .get("batch_size")
        .and_then(Value::as_u64)
        .ok_or_else(|| TrainingError::InvalidConfig("`batch_size` must be a non-negative integer".to_string()))?;
    fill(tree, "validation_batch_size", (batch_size * 2).into());
    Ok(())
}

fn fill(tree: &mut Mapping, key: &str, value: Value) {
    if tree.get(key).is_none_or(Value::is_null) {
        tree.insert(key.into(), value);
    }
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => serde_yaml::to_string(other).map(|s| s.trim().to_string()).unwrap_or_default(),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a list",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}
