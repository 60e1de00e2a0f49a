use crate::config::Config;
use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;
use tessera_abstraction::Device;

/// Per-launch settings that are not part of the model config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOptions {
    pub devices: Vec<Device>,
    /// Validate every N batches; `-1` or `0` disables. `None` defers to the config.
    #[serde(default)]
    pub validate_every: Option<i64>,
    /// Seconds between progress lines. `None` defers to the config.
    #[serde(default)]
    pub logger_min_wait: Option<f64>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self { devices: vec![Device::Cpu], validate_every: None, logger_min_wait: None }
    }
}

impl RunOptions {
    /// Validation interval after applying the config fallback.
    #[must_use]
    pub fn validate_every(&self, config: &Config) -> Option<usize> {
        match self.validate_every {
            Some(n) => usize::try_from(n).ok().filter(|n| *n > 0),
            None => config.validate_every().flatten(),
        }
    }

    #[must_use]
    pub fn logger_min_wait(&self, config: &Config) -> Duration {
        let seconds = self.logger_min_wait.unwrap_or_else(|| config.logger_min_wait());
        Duration::try_from_secs_f64(seconds).unwrap_or_default()
    }
}

/// Everything one worker process needs, passed explicitly on its stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerArgs {
    pub rank: usize,
    pub world_size: usize,
    pub devices: Vec<Device>,
    pub config: Config,
    pub model_id: String,
    pub model_folder: PathBuf,
    pub rendezvous_path: PathBuf,
    pub options: RunOptions,
}

impl WorkerArgs {
    pub fn validate(&self) -> TrainingResult<()> {
        if self.devices.is_empty() {
            return Err(TrainingError::InvalidConfig("at least one device is required".to_string()));
        }
        if self.world_size != self.devices.len() {
            return Err(TrainingError::InvalidConfig(format!(
                "world size {} does not match {} devices",
                self.world_size,
                self.devices.len()
            )));
        }
        if self.rank >= self.world_size {
            return Err(TrainingError::InvalidConfig(format!(
                "rank {} is outside a world of {}",
                self.rank, self.world_size
            )));
        }
        if self.model_id.trim().is_empty() {
            return Err(TrainingError::InvalidConfig("model id is required".to_string()));
        }
        Ok(())
    }

    /// The device this rank trains on.
    #[must_use]
    pub fn device(&self) -> Device {
        self.devices.get(self.rank).copied().unwrap_or(Device::Cpu)
    }

    /// Copy of these arguments for another rank.
    #[must_use]
    pub fn for_rank(&self, rank: usize) -> Self {
        Self { rank, ..self.clone() }
    }

    /// Reads and validates a bundle written by the launcher.
    pub fn read_from(mut reader: impl Read) -> TrainingResult<Self> {
        let mut raw = Vec::new();
        reader.read_to_end(&mut raw)?;
        let args: Self = serde_json::from_slice(&raw)?;
        args.validate()?;
        Ok(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> WorkerArgs {
        WorkerArgs {
            rank: 0,
            world_size: 2,
            devices: vec![Device::Cuda(0), Device::Cuda(3)],
            config: Config::from_yaml_str("epochs: 1\nparts: {a: {arch: toy}}\n").unwrap(),
            model_id: "4".to_string(),
            model_folder: PathBuf::from("models"),
            rendezvous_path: PathBuf::from("/tmp/rdv"),
            options: RunOptions::default(),
        }
    }

    #[test]
    fn test_bundle_round_trips_through_json() {
        let bundle = args().for_rank(1);
        let bytes = serde_json::to_vec(&bundle).unwrap();
        let back = WorkerArgs::read_from(bytes.as_slice()).unwrap();
        assert_eq!(back, bundle);
        assert_eq!(back.device(), Device::Cuda(3));
    }

    #[test]
    fn test_validate_rejects_inconsistent_bundles() {
        let mut bad = args();
        bad.rank = 2;
        assert!(bad.validate().is_err());

        let mut bad = args();
        bad.world_size = 1;
        assert!(bad.validate().is_err());

        let mut bad = args();
        bad.devices.clear();
        bad.world_size = 0;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_options_fall_back_to_config() {
        let config = Config::from_yaml_str("validate_every: 4\nlogger_min_wait: 2.5\n").unwrap();
        let defaults = RunOptions::default();
        assert_eq!(defaults.validate_every(&config), Some(4));
        assert_eq!(defaults.logger_min_wait(&config), Duration::from_millis(2500));

        let explicit = RunOptions { validate_every: Some(-1), logger_min_wait: Some(0.0), ..RunOptions::default() };
        assert_eq!(explicit.validate_every(&config), None);
        assert_eq!(explicit.logger_min_wait(&config), Duration::ZERO);
    }
}
