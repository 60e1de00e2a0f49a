use crate::config::Config;
use crate::error::{TrainingError, TrainingResult};
use crate::layout::{LATEST_TAG, ModelLayout};
use std::fmt;
use std::path::{Path, PathBuf};

/// Reference to one snapshot of a trained model: `modelID[@tag]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRef {
    pub model_id: String,
    pub tag: String,
}

impl CheckpointRef {
    pub fn parse(reference: &str) -> TrainingResult<Self> {
        let malformed = || TrainingError::MalformedReference {
            reference: reference.to_string(),
            expected: "model[@tag]",
        };
        let (model_id, tag) = split_tag(reference).ok_or_else(malformed)?;
        if model_id.is_empty() || model_id.contains('.') {
            return Err(malformed());
        }
        Ok(Self { model_id: model_id.to_string(), tag: tag.to_string() })
    }
}

impl fmt::Display for CheckpointRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.model_id, self.tag)
    }
}

/// Reference to one part's weights inside a snapshot: `modelID.partName[@tag]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightsRef {
    pub model_id: String,
    pub part: String,
    pub tag: String,
}

impl WeightsRef {
    pub fn parse(reference: &str) -> TrainingResult<Self> {
        let malformed = || TrainingError::MalformedReference {
            reference: reference.to_string(),
            expected: "model.part[@tag]",
        };
        // Split the tag off first: tags such as `0002.000010` contain dots.
        let (model_part, tag) = split_tag(reference).ok_or_else(malformed)?;
        let mut pieces = model_part.split('.');
        let (Some(model_id), Some(part), None) = (pieces.next(), pieces.next(), pieces.next()) else {
            return Err(malformed());
        };
        if model_id.is_empty() || part.is_empty() {
            return Err(malformed());
        }
        Ok(Self { model_id: model_id.to_string(), part: part.to_string(), tag: tag.to_string() })
    }

    #[must_use]
    pub fn checkpoint(&self) -> CheckpointRef {
        CheckpointRef { model_id: self.model_id.clone(), tag: self.tag.clone() }
    }
}

impl fmt::Display for WeightsRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}@{}", self.model_id, self.part, self.tag)
    }
}

fn split_tag(reference: &str) -> Option<(&str, &str)> {
    let reference = reference.trim();
    match reference.split_once('@') {
        Some((_, tag)) if tag.is_empty() || tag.contains('@') => None,
        Some((head, tag)) => Some((head, tag)),
        None => Some((reference, LATEST_TAG)),
    }
}

/// Trained models stored in a model folder.
///
/// Model IDs are allocated as one more than the largest ID that has both a
/// config file and a non-empty checkpoint folder. Two launches allocating
/// against the same folder at the same time can pick the same ID; nothing
/// here guards against that.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    layout: ModelLayout,
}

impl ModelRegistry {
    #[must_use]
    pub fn new(layout: ModelLayout) -> Self {
        Self { layout }
    }

    #[must_use]
    pub fn layout(&self) -> &ModelLayout {
        &self.layout
    }

    /// True when the model has a config and at least one checkpoint file.
    #[must_use]
    pub fn model_exists(&self, model_id: &str) -> bool {
        let folder = self.layout.checkpoints_dir(model_id);
        self.layout.config_path(model_id).is_file()
            && std::fs::read_dir(&folder).is_ok_and(|mut entries| entries.next().is_some())
    }

    /// IDs of every completed model, ascending.
    pub fn list_models(&self) -> TrainingResult<Vec<u64>> {
        let dir = match std::fs::read_dir(self.layout.root()) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        for entry in dir {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()).and_then(|s| s.parse::<u64>().ok()) else {
                continue;
            };
            if self.model_exists(&id.to_string()) {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    pub fn next_id(&self) -> TrainingResult<String> {
        Ok(self.list_models()?.last().map_or(0, |last| last + 1).to_string())
    }

    pub fn read_model_config(&self, model_id: &str) -> TrainingResult<Config> {
        Config::load(&self.layout.config_path(model_id))
    }

    #[must_use]
    pub fn snapshot_path(&self, reference: &CheckpointRef) -> PathBuf {
        self.layout.snapshot_path(&reference.model_id, &reference.tag)
    }

    /// Removes leftovers of an aborted run that was allocated `model_id`.
    pub fn clear_stale(&self, model_id: &str) -> TrainingResult<()> {
        for path in [self.layout.config_path(model_id), self.layout.log_path(model_id)] {
            remove_if_exists(&path)?;
        }
        Ok(())
    }
}

fn remove_if_exists(path: &Path) -> TrainingResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
