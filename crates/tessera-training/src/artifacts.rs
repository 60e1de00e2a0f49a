use crate::error::TrainingResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// One written snapshot as recorded in a model's manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub tag: String,
    pub epoch: usize,
    pub batch: usize,
    pub path: PathBuf,
    pub sha256: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
}

/// Every snapshot written for one model, oldest first.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub model_id: String,
    #[serde(default)]
    pub checkpoints: Vec<CheckpointEntry>,
}

impl CheckpointManifest {
    #[must_use]
    pub fn new(model_id: impl Into<String>) -> Self {
        Self { model_id: model_id.into(), checkpoints: Vec::new() }
    }

    /// Reads a manifest, or starts an empty one if none was written yet.
    pub fn load_or_new(path: &Path, model_id: &str) -> TrainingResult<Self> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new(model_id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Adds an entry, replacing any earlier entry with the same tag.
    pub fn record(&mut self, entry: CheckpointEntry) {
        self.checkpoints.retain(|existing| existing.tag != entry.tag);
        self.checkpoints.push(entry);
    }

    #[must_use]
    pub fn latest(&self) -> Option<&CheckpointEntry> {
        self.checkpoints.last()
    }

    pub fn save(&self, path: &Path) -> TrainingResult<()> {
        write_atomic(path, &serde_json::to_vec_pretty(self)?)
    }
}

pub fn sha256_file(path: &Path) -> TrainingResult<String> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// Writes `bytes` next to `path` and renames over it, so readers never see a
/// half-written file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> TrainingResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
