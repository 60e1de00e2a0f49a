//! Checkpoint snapshots and the rank-0 saver.

use crate::artifacts::{CheckpointEntry, CheckpointManifest, sha256_file, write_atomic};
use crate::assembler::Parts;
use crate::error::{TrainingError, TrainingResult};
use crate::layout::{LATEST_TAG, ModelLayout};
use crate::optim::Optimizers;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tessera_abstraction::{OptimizerState, StateDict};
use tracing::info;

/// Tag of the snapshot written after `batch` of `epoch`.
///
/// Zero padding keeps the tags of one run in lexicographic = chronological order.
#[must_use]
pub fn checkpoint_tag(epoch: usize, batch: usize) -> String {
    format!("{epoch:04}.{batch:06}")
}

/// Everything needed to restore or resume a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub epoch: usize,
    pub batch: usize,
    pub parts: BTreeMap<String, StateDict>,
    #[serde(default)]
    pub optimizers: BTreeMap<String, OptimizerState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mixed_precision: Option<serde_json::Value>,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
}

impl Snapshot {
    pub fn capture(
        parts: &Parts,
        optimizers: &Optimizers,
        mixed_precision: Option<serde_json::Value>,
        epoch: usize,
        batch: usize,
        metrics: BTreeMap<String, f64>,
    ) -> TrainingResult<Self> {
        let parts = parts.iter().map(|(name, part)| (name.to_string(), part.state_dict())).collect();
        let optimizers = optimizers
            .iter()
            .map(|(key, opt)| -> TrainingResult<(String, OptimizerState)> { Ok((key.clone(), opt.state()?)) })
            .collect::<TrainingResult<_>>()?;
        Ok(Self { epoch, batch, parts, optimizers, mixed_precision, metrics })
    }

    pub fn load(path: &Path) -> TrainingResult<Self> {
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TrainingError::CheckpointNotFound(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn write(&self, path: &Path) -> TrainingResult<()> {
        write_atomic(path, &serde_json::to_vec(self)?)
    }

    #[must_use]
    pub fn tag(&self) -> String {
        checkpoint_tag(self.epoch, self.batch)
    }
}

/// Writes snapshots for one model. Only rank 0 ever holds one.
#[derive(Debug, Clone)]
pub struct CheckpointSaver {
    layout: ModelLayout,
    model_id: String,
}

impl CheckpointSaver {
    #[must_use]
    pub fn new(layout: ModelLayout, model_id: impl Into<String>) -> Self {
        Self { layout, model_id: model_id.into() }
    }

    /// A saver for rank 0; `None` for every other rank.
    #[must_use]
    pub fn for_rank(rank: usize, layout: ModelLayout, model_id: impl Into<String>) -> Option<Self> {
        (rank == 0).then(|| Self::new(layout, model_id))
    }

    #[must_use]
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Writes `<tag>.json` and `latest.json`, then records the tag in the
    /// manifest. Returns the path of the tagged snapshot.
    pub fn save(
        &self,
        parts: &Parts,
        optimizers: &Optimizers,
        mixed_precision: Option<serde_json::Value>,
        epoch: usize,
        batch: usize,
        metrics: BTreeMap<String, f64>,
    ) -> TrainingResult<PathBuf> {
        let snapshot = Snapshot::capture(parts, optimizers, mixed_precision, epoch, batch, metrics)?;
        let tag = snapshot.tag();
        let bytes = serde_json::to_vec(&snapshot)?;

        let path = self.layout.snapshot_path(&self.model_id, &tag);
        write_atomic(&path, &bytes)?;
        write_atomic(&self.layout.snapshot_path(&self.model_id, LATEST_TAG), &bytes)?;

        let manifest_path = self.layout.manifest_path(&self.model_id);
        let mut manifest = CheckpointManifest::load_or_new(&manifest_path, &self.model_id)?;
        manifest.record(CheckpointEntry {
            tag: tag.clone(),
            epoch,
            batch,
            path: path.clone(),
            sha256: sha256_file(&path)?,
            created_at: Utc::now(),
            metrics: snapshot.metrics,
        });
        manifest.save(&manifest_path)?;

        info!(model = %self.model_id, %tag, "checkpoint saved");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optim::{GLOBAL_OPTIMIZER_KEY, Sgd, SgdConfig};
    use crate::testing::Toy;
    use tempfile::TempDir;
    use tessera_abstraction::{Optimizer, Part};

    fn fixture() -> (Parts, Optimizers) {
        let mut parts = Parts::new();
        let enc = Toy::new(2);
        let dec = Toy::new(3);
        enc.weight().write().values = vec![1.0, 2.0];
        let params: Vec<_> = enc.parameters().into_iter().chain(dec.parameters()).collect();
        parts.insert("enc", Box::new(enc));
        parts.insert("dec", Box::new(dec));

        let mut sgd = Sgd::new(params, SgdConfig { momentum: 0.9, ..SgdConfig::default() });
        for p in sgd.parameters() {
            p.accumulate_grad(&vec![0.5; p.numel()]).unwrap();
        }
        sgd.step().unwrap();

        let mut optimizers = Optimizers::new();
        optimizers.insert(GLOBAL_OPTIMIZER_KEY.to_string(), Box::new(sgd) as Box<dyn Optimizer>);
        (parts, optimizers)
    }

    #[test]
    fn test_tag_format_sorts_by_recency() {
        assert_eq!(checkpoint_tag(1, 20), "0001.000020");
        let mut tags = vec![checkpoint_tag(1, 2), checkpoint_tag(0, 900), checkpoint_tag(1, 10)];
        tags.sort();
        assert_eq!(tags, vec!["0000.000900", "0001.000002", "0001.000010"]);
    }

    #[test]
    fn test_save_load_round_trip() {
        let temp = TempDir::new().unwrap();
        let layout = ModelLayout::new(temp.path());
        let (parts, optimizers) = fixture();
        let metrics: BTreeMap<_, _> = [("loss".to_string(), 0.25)].into_iter().collect();

        let saver = CheckpointSaver::new(layout.clone(), "3");
        let path = saver.save(&parts, &optimizers, None, 1, 4, metrics.clone()).unwrap();
        assert_eq!(path, layout.snapshot_path("3", "0001.000004"));

        let loaded = Snapshot::load(&path).unwrap();
        let latest = Snapshot::load(&layout.snapshot_path("3", LATEST_TAG)).unwrap();
        assert_eq!(loaded, latest);
        assert_eq!((loaded.epoch, loaded.batch), (1, 4));
        assert_eq!(loaded.metrics, metrics);
        assert_eq!(loaded.parts["enc"], parts.get("enc").unwrap().state_dict());
        assert_eq!(loaded.parts["dec"], parts.get("dec").unwrap().state_dict());
        assert_eq!(loaded.optimizers[GLOBAL_OPTIMIZER_KEY], optimizers[GLOBAL_OPTIMIZER_KEY].state().unwrap());
    }

    #[test]
    fn test_latest_is_overwritten_and_manifest_grows() {
        let temp = TempDir::new().unwrap();
        let layout = ModelLayout::new(temp.path());
        let (parts, optimizers) = fixture();
        let saver = CheckpointSaver::new(layout.clone(), "0");

        saver.save(&parts, &optimizers, None, 0, 1, BTreeMap::new()).unwrap();
        saver
            .save(&parts, &optimizers, Some(serde_json::json!({"scale": 128.0})), 0, 3, BTreeMap::new())
            .unwrap();

        let latest = Snapshot::load(&layout.snapshot_path("0", LATEST_TAG)).unwrap();
        assert_eq!(latest.batch, 3);
        assert_eq!(latest.mixed_precision, Some(serde_json::json!({"scale": 128.0})));

        let manifest = CheckpointManifest::load_or_new(&layout.manifest_path("0"), "0").unwrap();
        let tags: Vec<_> = manifest.checkpoints.iter().map(|c| c.tag.as_str()).collect();
        assert_eq!(tags, vec!["0000.000001", "0000.000003"]);
        assert_eq!(manifest.checkpoints[1].sha256, sha256_file(&layout.snapshot_path("0", "0000.000003")).unwrap());
    }

    #[test]
    fn test_only_rank_zero_gets_a_saver() {
        let temp = TempDir::new().unwrap();
        let layout = ModelLayout::new(temp.path());
        assert!(CheckpointSaver::for_rank(0, layout.clone(), "1").is_some());
        assert!(CheckpointSaver::for_rank(1, layout, "1").is_none());
    }

    #[test]
    fn test_missing_snapshot() {
        let temp = TempDir::new().unwrap();
        let err = Snapshot::load(&temp.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, TrainingError::CheckpointNotFound(_)));
    }
}
