//! # strata-config
//!
//! Configuration management for Strata.
//!
//! Loads configuration from:
//! 1. `~/.strata/config.toml` (global)
//! 2. `.strata/config.toml` (project-local, overrides global)
//! 3. Environment variables (highest priority)

pub mod logging;
pub mod path;
pub mod testing;

pub use logging::{init_logging, Component, LogLevel};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use strata_store::{BlockConfig, Compression};
use tracing::debug;

/// Environment variable overriding the store root
pub const ENV_ROOT: &str = "STRATA_ROOT";
pub const ENV_BLOCK_SIZE: &str = "STRATA_BLOCK_SIZE";
pub const ENV_OVERWRITE: &str = "STRATA_OVERWRITE";
pub const ENV_COMPRESSION: &str = "STRATA_COMPRESSION";
pub const ENV_THREADS: &str = "STRATA_THREADS";
pub const ENV_LOG: &str = "STRATA_LOG";

/// Project-local config path, relative to the working directory
pub const PROJECT_CONFIG: &str = ".strata/config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("TOML parse error in {}: {source}", .path.display())]
    Toml {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to apply config: {0}")]
    Invalid(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Invalid value for {var}: {value:?}")]
    InvalidEnv { var: &'static str, value: String },
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let global = Self::global_config_path();
        let mut config = Self::load_from(global.as_deref(), Some(Path::new(PROJECT_CONFIG)))?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Load and layer the given files, skipping any that don't exist.
    ///
    /// Tables are merged key by key, so a project file only needs the
    /// settings it changes.
    pub fn load_from(global: Option<&Path>, project: Option<&Path>) -> Result<Self, ConfigError> {
        let mut merged = toml::Table::new();
        for path in [global, project].into_iter().flatten() {
            if let Some(table) = read_table(path)? {
                merge_tables(&mut merged, table);
            }
        }
        Ok(toml::Value::Table(merged).try_into()?)
    }

    /// Global config path: ~/.strata/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".strata/config.toml"))
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|var| std::env::var(var).ok())
    }

    /// Apply overrides from an arbitrary variable source.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(root) = lookup(ENV_ROOT) {
            self.storage.root = PathBuf::from(root);
        }
        if let Some(value) = lookup(ENV_BLOCK_SIZE) {
            self.storage.block.block_size = parse_env(ENV_BLOCK_SIZE, value)?;
        }
        if let Some(value) = lookup(ENV_OVERWRITE) {
            self.storage.block.overwrite = parse_bool(ENV_OVERWRITE, value)?;
        }
        if let Some(value) = lookup(ENV_COMPRESSION) {
            self.storage.block.compression = parse_env::<Compression>(ENV_COMPRESSION, value)?;
        }
        if let Some(value) = lookup(ENV_THREADS) {
            self.storage.block.write_threads = Some(parse_env(ENV_THREADS, value)?);
        }
        if let Some(value) = lookup(ENV_LOG) {
            self.logging.level = parse_env(ENV_LOG, value)?;
        }
        Ok(())
    }

    /// Store root with `~` expanded
    pub fn store_root(&self) -> PathBuf {
        path::expand_home(&self.storage.root)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Generate default config TOML string
    pub fn default_toml() -> Result<String, ConfigError> {
        Config::default().to_toml()
    }
}

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Store root directory
    pub root: PathBuf,
    /// Engine settings
    pub block: BlockConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("~/.strata/store"),
            block: BlockConfig::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
}

fn read_table(path: &Path) -> Result<Option<toml::Table>, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    debug!("Loading config from {:?}", path);
    contents
        .parse::<toml::Table>()
        .map(Some)
        .map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })
}

/// Recursively overlay `overlay` onto `base`.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match value {
            toml::Value::Table(incoming) => match base.get_mut(&key) {
                Some(toml::Value::Table(existing)) => merge_tables(existing, incoming),
                _ => {
                    base.insert(key, toml::Value::Table(incoming));
                }
            },
            value => {
                base.insert(key, value);
            }
        }
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { var, value })
}

fn parse_bool(var: &'static str, value: String) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv { var, value }),
    }
}
