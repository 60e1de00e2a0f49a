use crate::error::TrainingResult;
use std::path::{Path, PathBuf};

/// Tag of the snapshot alias that always points at the most recent save.
pub const LATEST_TAG: &str = "latest";

/// File extension of checkpoint snapshots.
pub const SNAPSHOT_EXTENSION: &str = "json";

/// Filesystem layout of trained models inside a model folder.
///
/// ```text
/// <root>/<id>.yaml              resolved config
/// <root>/<id>.log               progress log
/// <root>/<id>/<tag>.json        snapshots, plus latest.json
/// <root>/<id>/manifest.json     checkpoint manifest
/// ```
#[derive(Debug, Clone)]
pub struct ModelLayout {
    root: PathBuf,
}

impl ModelLayout {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Prefix shared by a model's config, log and checkpoint folder.
    #[must_use]
    pub fn model_path(&self, model_id: &str) -> PathBuf {
        self.root.join(model_id)
    }

    #[must_use]
    pub fn config_path(&self, model_id: &str) -> PathBuf {
        self.root.join(format!("{model_id}.yaml"))
    }

    #[must_use]
    pub fn log_path(&self, model_id: &str) -> PathBuf {
        self.root.join(format!("{model_id}.log"))
    }

    #[must_use]
    pub fn checkpoints_dir(&self, model_id: &str) -> PathBuf {
        self.model_path(model_id)
    }

    #[must_use]
    pub fn snapshot_path(&self, model_id: &str, tag: &str) -> PathBuf {
        self.checkpoints_dir(model_id).join(format!("{tag}.{SNAPSHOT_EXTENSION}"))
    }

    #[must_use]
    pub fn manifest_path(&self, model_id: &str) -> PathBuf {
        self.checkpoints_dir(model_id).join("manifest.json")
    }

    pub fn ensure_root(&self) -> TrainingResult<()> {
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }
}
