use crate::error::TrainingResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// One line of a model's progress log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started { batches_per_epoch: usize, epochs: usize, epoch: usize, batch: usize, at: DateTime<Utc> },
    Batch { epoch: usize, batch: usize, metrics: BTreeMap<String, f64>, at: DateTime<Utc> },
    Epoch { epoch: usize, at: DateTime<Utc> },
    Validation { epoch: usize, batch: usize, metrics: BTreeMap<String, f64>, at: DateTime<Utc> },
    Finished { batches_run: usize, at: DateTime<Utc> },
}

/// Observer of training progress. Never influences the run.
pub trait ProgressLogger: Send {
    /// `epoch`/`batch` is where the run starts, which is non-zero on resume.
    fn start(&mut self, batches_per_epoch: usize, epoch: usize, batch: usize);

    /// Advances the batch counter.
    fn batch(&mut self, metrics: &BTreeMap<String, f64>);

    /// Advances the epoch counter and resets the batch counter.
    fn epoch(&mut self);

    fn validation(&mut self, batch: usize, metrics: &BTreeMap<String, f64>);

    fn finish(&mut self, batches_run: usize) {
        let _ = batches_run;
    }

    /// Minimum time between two batch progress lines.
    fn set_min_wait(&mut self, min_wait: Duration);

    fn add_meter(&mut self, name: &str);
}

/// Appends JSON-lines events to `<id>.log` and mirrors throttled progress to
/// `tracing`.
#[derive(Debug)]
pub struct TrainLogger {
    path: PathBuf,
    out: Option<BufWriter<File>>,
    epochs: usize,
    batches_per_epoch: usize,
    epoch: usize,
    batch: usize,
    meters: BTreeSet<String>,
    min_wait: Duration,
    last_line: Option<Instant>,
}

impl TrainLogger {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, epochs: usize) -> Self {
        Self {
            path: path.into(),
            out: None,
            epochs,
            batches_per_epoch: 0,
            epoch: 0,
            batch: 0,
            meters: BTreeSet::new(),
            min_wait: Duration::from_secs(5),
            last_line: None,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every event of a progress log.
    pub fn read_events(path: &Path) -> TrainingResult<Vec<ProgressEvent>> {
        std::fs::read_to_string(path)?
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| -> TrainingResult<ProgressEvent> { Ok(serde_json::from_str(line)?) })
            .collect()
    }

    fn emit(&mut self, event: &ProgressEvent) {
        if self.out.is_none() {
            match OpenOptions::new().create(true).append(true).open(&self.path) {
                Ok(file) => self.out = Some(BufWriter::new(file)),
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "cannot open progress log");
                    return;
                }
            }
        }
        let Some(out) = self.out.as_mut() else {
            return;
        };
        let written = serde_json::to_writer(&mut *out, event)
            .map_err(std::io::Error::from)
            .and_then(|()| out.write_all(b"\n"))
            .and_then(|()| out.flush());
        if let Err(e) = written {
            warn!(path = %self.path.display(), error = %e, "cannot write progress log");
        }
    }

    fn due(&mut self) -> bool {
        let now = Instant::now();
        let due = self.last_line.is_none_or(|last| now.duration_since(last) >= self.min_wait);
        if due {
            self.last_line = Some(now);
        }
        due
    }
}

fn format_metrics(metrics: &BTreeMap<String, f64>) -> String {
    metrics.iter().map(|(k, v)| format!("{k}={v:.4}")).collect::<Vec<_>>().join(" ")
}

impl ProgressLogger for TrainLogger {
    fn start(&mut self, batches_per_epoch: usize, epoch: usize, batch: usize) {
        self.batches_per_epoch = batches_per_epoch;
        self.epoch = epoch;
        self.batch = batch;
        info!(epochs = self.epochs, batches_per_epoch, epoch, batch, "training started");
        self.emit(&ProgressEvent::Started { batches_per_epoch, epochs: self.epochs, epoch, batch, at: Utc::now() });
    }

    fn batch(&mut self, metrics: &BTreeMap<String, f64>) {
        self.batch += 1;
        let shown: BTreeMap<String, f64> = metrics
            .iter()
            .filter(|(k, _)| self.meters.is_empty() || self.meters.contains(*k))
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        if self.due() || self.batch == self.batches_per_epoch {
            info!(
                "epoch {}/{} batch {}/{} {}",
                self.epoch + 1,
                self.epochs,
                self.batch,
                self.batches_per_epoch,
                format_metrics(&shown)
            );
        }
        let event = ProgressEvent::Batch { epoch: self.epoch, batch: self.batch, metrics: shown, at: Utc::now() };
        self.emit(&event);
    }

    fn epoch(&mut self) {
        let event = ProgressEvent::Epoch { epoch: self.epoch, at: Utc::now() };
        self.emit(&event);
        self.epoch += 1;
        self.batch = 0;
    }

    fn validation(&mut self, batch: usize, metrics: &BTreeMap<String, f64>) {
        // Validation after the epoch's last batch runs once `epoch()` already advanced.
        let epoch = if self.batch == 0 { self.epoch.saturating_sub(1) } else { self.epoch };
        info!(epoch, batch, "validation {}", format_metrics(metrics));
        self.emit(&ProgressEvent::Validation { epoch, batch, metrics: metrics.clone(), at: Utc::now() });
    }

    fn finish(&mut self, batches_run: usize) {
        info!(batches_run, "training finished");
        self.emit(&ProgressEvent::Finished { batches_run, at: Utc::now() });
    }

    fn set_min_wait(&mut self, min_wait: Duration) {
        self.min_wait = min_wait;
    }

    fn add_meter(&mut self, name: &str) {
        self.meters.insert(name.to_string());
    }
}
