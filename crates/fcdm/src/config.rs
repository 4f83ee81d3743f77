//! Configuration shared by the plugin and the worker.
//!
//! Sources, lowest priority first: built-in defaults, the TOML file at
//! `$FCDM_CONFIG` (or `$XDG_CONFIG_HOME/fcdm/config.toml`), then the
//! `FCDM_WORKER_PATH`, `FCDM_CDM_SO_PATH` and `FCDM_MAX_SESSIONS` environment
//! variables.

use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Size of each instance's shared arena. Both ends must agree on it.
pub const ARENA_SIZE: u32 = 32 * 1024 * 1024;

/// Stack size of each worker fiber thread.
pub const FIBER_STACK_SIZE: usize = 1024 * 1024;

pub const CONFIG_ENV: &str = "FCDM_CONFIG";
pub const WORKER_PATH_ENV: &str = "FCDM_WORKER_PATH";
pub const CDM_PATH_ENV: &str = "FCDM_CDM_SO_PATH";
pub const MAX_SESSIONS_ENV: &str = "FCDM_MAX_SESSIONS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Worker executable spawned for each instance (plugin side).
    pub worker_path: Option<PathBuf>,
    /// Vendor CDM shared object (worker side).
    pub cdm_path: Option<PathBuf>,
    /// Instances one worker will host at the same time.
    pub max_sessions: usize,
    #[serde(skip)]
    pub arena_size: u32,
    #[serde(skip)]
    pub fiber_stack_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_path: None,
            cdm_path: None,
            max_sessions: 1,
            arena_size: ARENA_SIZE,
            fiber_stack_size: FIBER_STACK_SIZE,
        }
    }
}

impl Config {
    /// Loads the configuration from all sources.
    ///
    /// An unreadable or malformed config file is logged and skipped; a
    /// malformed environment override is an error.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match Self::default_config_path() {
            Some(path) if path.exists() => Self::from_file(&path).unwrap_or_else(|e| {
                warn!("{e}, using defaults");
                Self::default()
            }),
            Some(path) => {
                debug!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.worker_path = config.worker_path.as_deref().map(expand_path);
        config.cdm_path = config.cdm_path.as_deref().map(expand_path);
        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Applies environment overrides, looked up through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(WORKER_PATH_ENV).filter(|v| !v.is_empty()) {
            self.worker_path = Some(expand_path(Path::new(&path)));
        }
        if let Some(path) = lookup(CDM_PATH_ENV).filter(|v| !v.is_empty()) {
            self.cdm_path = Some(expand_path(Path::new(&path)));
        }
        if let Some(value) = lookup(MAX_SESSIONS_ENV) {
            self.max_sessions = value
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or(ConfigError::Invalid {
                    key: MAX_SESSIONS_ENV,
                    value,
                })?;
        }
        Ok(())
    }

    fn default_config_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Some(expand_path(Path::new(&path)));
        }
        dirs::config_dir().map(|dir| dir.join("fcdm").join("config.toml"))
    }
}

fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(&raw).into_owned())
}
