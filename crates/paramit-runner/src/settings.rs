//! User settings, read from `paramit.yaml`. Every field is optional.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const SETTINGS_FILE: &str = "paramit.yaml";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse settings {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid setting `{field}`: {detail}")]
    Invalid { field: &'static str, detail: String },
}

fn default_reports_dir() -> PathBuf {
    PathBuf::from("reports")
}

fn default_python() -> String {
    "python3".to_string()
}

fn default_workers() -> usize {
    1
}

fn default_confirm_threshold() -> usize {
    100
}

fn default_lock_timeout_secs() -> u64 {
    3600
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default = "default_reports_dir")]
    pub reports_dir: PathBuf,
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default = "default_python")]
    pub python: String,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_confirm_threshold")]
    pub confirm_threshold: usize,
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            reports_dir: default_reports_dir(),
            cache_dir: None,
            python: default_python(),
            workers: default_workers(),
            confirm_threshold: default_confirm_threshold(),
            lock_timeout_secs: default_lock_timeout_secs(),
        }
    }
}

impl Settings {
    /// Load `path`, or `./paramit.yaml` when `path` is `None`. A missing
    /// default file yields the defaults; a missing explicit file is an
    /// error.
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(SETTINGS_FILE), false),
        };
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default())
            }
            Err(source) => return Err(SettingsError::Read { path, source }),
        };
        Self::parse(&raw, &path)
    }

    pub fn parse(raw: &str, path: &Path) -> Result<Self, SettingsError> {
        let settings: Settings = if raw.trim().is_empty() {
            Settings::default()
        } else {
            serde_yaml::from_str(raw).map_err(|source| SettingsError::Parse {
                path: path.to_path_buf(),
                source,
            })?
        };
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), SettingsError> {
        if self.workers == 0 {
            return Err(SettingsError::Invalid {
                field: "workers",
                detail: "must be at least 1".to_string(),
            });
        }
        if self.python.trim().is_empty() {
            return Err(SettingsError::Invalid {
                field: "python",
                detail: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// `cache_dir`, else `$XDG_CACHE_HOME/paramit`, else
    /// `$HOME/.cache/paramit`, else a directory under the system temp dir.
    pub fn cache_root(&self) -> PathBuf {
        if let Some(dir) = &self.cache_dir {
            return dir.clone();
        }
        let non_empty = |key: &str| std::env::var_os(key).filter(|v| !v.is_empty());
        if let Some(xdg) = non_empty("XDG_CACHE_HOME") {
            return PathBuf::from(xdg).join("paramit");
        }
        if let Some(home) = non_empty("HOME") {
            return PathBuf::from(home).join(".cache").join("paramit");
        }
        std::env::temp_dir().join("paramit")
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}
