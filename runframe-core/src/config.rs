//! YAML configuration at `~/.runframe/config.yaml`.
//!
//! # API pattern
//!
//! Every function has two forms:
//! - `fn_at(home: &Path, …)` — explicit home; used in tests with `TempDir`
//! - `fn(…)` — derives home from `dirs::home_dir()`, delegates to `_at`
//!
//! A missing config file is not an error: [`Config::default`] is returned.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{io_err, ConfigError};

pub const DEFAULT_SERVER_URL: &str = "http://localhost:3020";
pub const DEFAULT_MANUAL_EDITS_PATH: &str = "manual-edits.json";

/// How the worker process is launched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WorkerConfig {
    /// argv of the worker process; the first element is the program.
    pub command: Vec<String>,
    /// Execution engine version passed to the worker. Changing it forces a
    /// fresh worker.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine_version: Option<String>,
}

/// Runtime configuration for the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server_url: String,
    pub poll_interval_ms: u64,
    /// Window after a local write of the manual-edits file during which a
    /// polled remote copy of it is discarded.
    pub self_write_window_ms: u64,
    pub event_log_capacity: usize,
    pub edit_flush_delay_ms: u64,
    pub manual_edits_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<String>,
    /// Re-run on explicit `run` requests even when nothing changed.
    pub manual_run: bool,
    pub worker: WorkerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            poll_interval_ms: 1_000,
            self_write_window_ms: 1_000,
            event_log_capacity: 100,
            edit_flush_delay_ms: 100,
            manual_edits_path: DEFAULT_MANUAL_EDITS_PATH.to_string(),
            entrypoint: None,
            manual_run: false,
            worker: WorkerConfig::default(),
        }
    }
}

impl Config {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn self_write_window(&self) -> Duration {
        Duration::from_millis(self.self_write_window_ms)
    }

    pub fn edit_flush_delay(&self) -> Duration {
        Duration::from_millis(self.edit_flush_delay_ms)
    }

    /// Reject values that would make the runtime spin or drop everything.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_url.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "server_url",
                reason: "must not be empty".to_string(),
            });
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "poll_interval_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.event_log_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "event_log_capacity",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// `<home>/.runframe/`
pub fn runframe_root(home: &Path) -> PathBuf {
    home.join(".runframe")
}

/// `<home>/.runframe/config.yaml` — pure, no I/O.
pub fn config_path_at(home: &Path) -> PathBuf {
    runframe_root(home).join("config.yaml")
}

// ---------------------------------------------------------------------------
// Load / save
// ---------------------------------------------------------------------------

/// Load and validate the config under `home`, or defaults if absent.
pub fn load_at(home: &Path) -> Result<Config, ConfigError> {
    let path = config_path_at(home);
    if !path.exists() {
        return Ok(Config::default());
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
    let config: Config = if contents.trim().is_empty() {
        Config::default()
    } else {
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse { path, source: e })?
    };
    config.validate()?;
    Ok(config)
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<Config, ConfigError> {
    load_at(&home()?)
}

/// Atomically save `config` under `home` (`.yaml.tmp` sibling then rename).
pub fn save_at(home: &Path, config: &Config) -> Result<(), ConfigError> {
    let path = config_path_at(home);
    let dir = runframe_root(home);
    std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;

    let yaml = serde_yaml::to_string(config)?;
    let tmp = path.with_extension("yaml.tmp");
    std::fs::write(&tmp, yaml).map_err(|e| io_err(&tmp, e))?;
    std::fs::rename(&tmp, &path).map_err(|e| io_err(&path, e))?;
    Ok(())
}

/// `save_at` convenience wrapper.
pub fn save(config: &Config) -> Result<(), ConfigError> {
    save_at(&home()?, config)
}

fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}
