//! CLI settings loading and merging.
//!
//! Precedence, highest first:
//! 1. CLI flags
//! 2. Environment variables (`TESSERA_CONFIG_DIR`, `TESSERA_MODEL_DIR`, `TESSERA_RENDEZVOUS`)
//! 3. Local settings file (`./.tesserarc`)
//! 4. Global settings file (`~/.tessera/config.toml`)
//! 5. Defaults

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tessera_training::SessionPaths;

pub const CONFIG_DIR_ENV: &str = "TESSERA_CONFIG_DIR";
pub const MODEL_DIR_ENV: &str = "TESSERA_MODEL_DIR";
pub const RENDEZVOUS_ENV: &str = "TESSERA_RENDEZVOUS";

/// One settings file; every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsFile {
    #[serde(default)]
    pub config_folder: Option<PathBuf>,
    #[serde(default)]
    pub model_folder: Option<PathBuf>,
    #[serde(default)]
    pub rendezvous_path: Option<PathBuf>,
}

impl SettingsFile {
    /// Reads `path`; a missing file yields empty settings.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read settings: {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse settings: {}", path.display()))
    }

    /// Values from `other` win where they are set.
    pub fn merge(&mut self, other: Self) {
        if other.config_folder.is_some() {
            self.config_folder = other.config_folder;
        }
        if other.model_folder.is_some() {
            self.model_folder = other.model_folder;
        }
        if other.rendezvous_path.is_some() {
            self.rendezvous_path = other.rendezvous_path;
        }
    }

    fn from_env(var: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            config_folder: var(CONFIG_DIR_ENV).map(PathBuf::from),
            model_folder: var(MODEL_DIR_ENV).map(PathBuf::from),
            rendezvous_path: var(RENDEZVOUS_ENV).map(PathBuf::from),
        }
    }
}

/// Resolved folders the CLI works with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub config_folder: PathBuf,
    pub model_folder: PathBuf,
    pub rendezvous_path: PathBuf,
}

impl Settings {
    pub fn default_global_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".tessera").join("config.toml"))
    }

    pub fn default_local_path() -> PathBuf {
        PathBuf::from(".tesserarc")
    }

    /// Loads the settings files and the environment, then applies `flags`.
    pub fn discover(flags: SettingsFile) -> Result<Self> {
        let mut layers = Vec::new();
        if let Some(global) = Self::default_global_path() {
            layers.push(SettingsFile::load(&global)?);
        }
        layers.push(SettingsFile::load(&Self::default_local_path())?);
        layers.push(SettingsFile::from_env(|name| std::env::var(name).ok().filter(|v| !v.is_empty())));
        layers.push(flags);
        Ok(Self::from_layers(layers))
    }

    /// Later layers override earlier ones.
    pub fn from_layers(layers: impl IntoIterator<Item = SettingsFile>) -> Self {
        let mut merged = SettingsFile::default();
        for layer in layers {
            merged.merge(layer);
        }
        Self {
            config_folder: merged.config_folder.unwrap_or_else(|| PathBuf::from("configs")),
            model_folder: merged.model_folder.unwrap_or_else(|| PathBuf::from("models")),
            rendezvous_path: merged.rendezvous_path.unwrap_or_else(|| std::env::temp_dir().join("tessera_rendezvous")),
        }
    }

    pub fn session_paths(&self) -> SessionPaths {
        SessionPaths {
            config_folder: self.config_folder.clone(),
            model_folder: self.model_folder.clone(),
            rendezvous_path: self.rendezvous_path.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let settings = Settings::from_layers([]);
        assert_eq!(settings.config_folder, PathBuf::from("configs"));
        assert_eq!(settings.model_folder, PathBuf::from("models"));
        assert_eq!(settings.rendezvous_path, std::env::temp_dir().join("tessera_rendezvous"));
    }

    #[test]
    fn test_layers_override_in_order() {
        let temp = TempDir::new().unwrap();
        let global = temp.path().join("config.toml");
        let local = temp.path().join(".tesserarc");
        std::fs::write(&global, "config_folder = \"/g/configs\"\nmodel_folder = \"/g/models\"\n").unwrap();
        std::fs::write(&local, "model_folder = \"/l/models\"\n").unwrap();

        let env = SettingsFile::from_env(|name| (name == RENDEZVOUS_ENV).then(|| "/e/rdv".to_string()));
        let flags = SettingsFile { config_folder: Some(PathBuf::from("/f/configs")), ..SettingsFile::default() };
        let settings = Settings::from_layers([
            SettingsFile::load(&global).unwrap(),
            SettingsFile::load(&local).unwrap(),
            env,
            flags,
        ]);

        assert_eq!(settings.config_folder, PathBuf::from("/f/configs"));
        assert_eq!(settings.model_folder, PathBuf::from("/l/models"));
        assert_eq!(settings.rendezvous_path, PathBuf::from("/e/rdv"));
    }

    #[test]
    fn test_missing_file_is_empty_and_bad_file_fails() {
        let temp = TempDir::new().unwrap();
        assert_eq!(SettingsFile::load(&temp.path().join("absent.toml")).unwrap(), SettingsFile::default());

        let bad = temp.path().join("bad.toml");
        std::fs::write(&bad, "model_folder = [").unwrap();
        assert!(SettingsFile::load(&bad).is_err());
    }
}
