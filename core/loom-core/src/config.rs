//! Runtime configuration loaded from `~/.loom/config.toml`.
//!
//! Every section is optional; a missing file yields defaults.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, SessionError};

pub const DEFAULT_CONFIG_RELATIVE_PATH: &str = ".loom/config.toml";
pub const STRICT_REDUCER_ENV: &str = "LOOM_STRICT_REDUCER";

pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 16;
pub const DEFAULT_OVERFLOW_THRESHOLD: usize = 500;
pub const DEFAULT_SPAWN_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_RESPONSE_TIMEOUT_SECS: u64 = 20;

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct LoomConfig {
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub snapshots: SnapshotConfig,
    #[serde(default)]
    pub reducer: ReducerConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RouterConfig {
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_overflow_threshold")]
    pub overflow_threshold: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            overflow_threshold: DEFAULT_OVERFLOW_THRESHOLD,
        }
    }
}

impl RouterConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TimeoutConfig {
    #[serde(default = "default_spawn_timeout_secs")]
    pub spawn_timeout_secs: u64,
    #[serde(default = "default_response_timeout_secs")]
    pub response_timeout_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            spawn_timeout_secs: DEFAULT_SPAWN_TIMEOUT_SECS,
            response_timeout_secs: DEFAULT_RESPONSE_TIMEOUT_SECS,
        }
    }
}

impl TimeoutConfig {
    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_secs(self.spawn_timeout_secs)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SnapshotConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Defaults to `~/.loom/snapshots`.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
        }
    }
}

impl SnapshotConfig {
    pub fn resolved_dir(&self) -> Result<PathBuf> {
        match self.dir.as_ref() {
            Some(dir) => Ok(dir.clone()),
            None => {
                let home = dirs::home_dir()
                    .ok_or_else(|| SessionError::Config("Home directory not found".to_string()))?;
                Ok(home.join(".loom").join("snapshots"))
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct ReducerConfig {
    #[serde(default)]
    pub strict: bool,
}

impl LoomConfig {
    /// Strict mode is on if the file asks for it or the environment forces it.
    pub fn strict_reducer(&self) -> bool {
        self.reducer.strict || env_flag(STRICT_REDUCER_ENV)
    }
}

fn default_flush_interval_ms() -> u64 {
    DEFAULT_FLUSH_INTERVAL_MS
}

fn default_overflow_threshold() -> usize {
    DEFAULT_OVERFLOW_THRESHOLD
}

fn default_spawn_timeout_secs() -> u64 {
    DEFAULT_SPAWN_TIMEOUT_SECS
}

fn default_response_timeout_secs() -> u64 {
    DEFAULT_RESPONSE_TIMEOUT_SECS
}

fn default_true() -> bool {
    true
}

pub fn env_flag(name: &str) -> bool {
    env::var(name)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false)
}

pub fn default_config_path() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| SessionError::Config("Home directory not found".to_string()))?;
    Ok(home.join(DEFAULT_CONFIG_RELATIVE_PATH))
}

pub fn load_config(path: Option<PathBuf>) -> Result<LoomConfig> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(LoomConfig::default());
    }

    let content = fs_err::read_to_string(&config_path).map_err(|err| {
        SessionError::Config(format!(
            "Failed to read config {}: {}",
            config_path.display(),
            err
        ))
    })?;
    toml::from_str::<LoomConfig>(&content).map_err(|err| {
        SessionError::Config(format!(
            "Failed to parse config {}: {}",
            config_path.display(),
            err
        ))
    })
}
