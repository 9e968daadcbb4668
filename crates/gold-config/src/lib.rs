use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const GOLD_DIR_NAME: &str = ".gold";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8000";
pub const DEFAULT_SQLITE_FILE: &str = "expectations.sqlite";
pub const DEFAULT_CACHE_TTL_SECS: u64 = 60;
pub const DEFAULT_CACHE_CAPACITY: usize = 64;
pub const DEFAULT_REFRESH_TIMEOUT_MS: u64 = 2_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GoldConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub ignores: IgnoresConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_addr(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Relative paths resolve against the `.gold` directory. Empty keeps
    /// expectations in memory only.
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tile_path: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
            tile_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    #[serde(default = "default_refresh_timeout_ms")]
    pub refresh_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl_secs(),
            capacity: default_cache_capacity(),
            refresh_timeout_ms: default_refresh_timeout_ms(),
        }
    }
}

/// Traces left out of every summary and blame computation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct IgnoresConfig {
    /// Structured trace ids, e.g. `,device=x86,name=circle,source_type=gm,`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trace_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("failed to serialize config TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

pub fn gold_dir(workspace_root: impl AsRef<Path>) -> PathBuf {
    workspace_root.as_ref().join(GOLD_DIR_NAME)
}

pub fn config_path(workspace_root: impl AsRef<Path>) -> PathBuf {
    gold_dir(workspace_root).join(CONFIG_FILE_NAME)
}

pub fn load_workspace_config(workspace_root: impl AsRef<Path>) -> Result<GoldConfig, ConfigError> {
    let path = config_path(workspace_root);
    if !path.exists() {
        return Ok(GoldConfig::default());
    }

    let raw = fs::read_to_string(path)?;
    let parsed: GoldConfig = toml::from_str(&raw)?;
    Ok(normalize_config(parsed))
}

pub fn ensure_workspace_config(
    workspace_root: impl AsRef<Path>,
) -> Result<GoldConfig, ConfigError> {
    let workspace_root = workspace_root.as_ref();
    fs::create_dir_all(gold_dir(workspace_root))?;

    let path = config_path(workspace_root);
    if path.exists() {
        return load_workspace_config(workspace_root);
    }

    let config = GoldConfig::default();
    let content = toml::to_string_pretty(&config)?;
    fs::write(path, content)?;

    Ok(config)
}

/// Resolves a configured path: absolute paths are kept, relative ones are
/// placed under the workspace `.gold` directory.
pub fn resolve_path(workspace_root: impl AsRef<Path>, configured: &str) -> PathBuf {
    let configured = Path::new(configured);
    if configured.is_absolute() {
        configured.to_path_buf()
    } else {
        gold_dir(workspace_root).join(configured)
    }
}

pub fn validate_config(config: &GoldConfig) -> Vec<ConfigWarning> {
    let mut warnings = Vec::new();

    if config.server.bind.parse::<std::net::SocketAddr>().is_err() {
        warnings.push(ConfigWarning {
            code: "server.bind",
            message: format!(
                "'{}' is not an ip:port socket address (default is {DEFAULT_BIND_ADDR})",
                config.server.bind
            ),
        });
    }
    if config.storage.sqlite_path.is_empty() {
        warnings.push(ConfigWarning {
            code: "storage.sqlite_path",
            message: "no sqlite path configured, triage changes will not survive a restart"
                .to_owned(),
        });
    }
    if config.storage.tile_path.is_none() {
        warnings.push(ConfigWarning {
            code: "storage.tile_path",
            message: "no tile configured, serving an empty tile".to_owned(),
        });
    }
    if config.cache.capacity == 0 {
        warnings.push(ConfigWarning {
            code: "cache.capacity",
            message: "cache capacity 0 disables caching of blame results".to_owned(),
        });
    }
    if config.cache.refresh_timeout_ms == 0 {
        warnings.push(ConfigWarning {
            code: "cache.refresh_timeout_ms",
            message: "refresh timeout 0 serves stale results whenever one exists".to_owned(),
        });
    }

    if let Some(malformed) = config
        .ignores
        .trace_ids
        .iter()
        .find(|id| !(id.len() > 1 && id.starts_with(',') && id.ends_with(',')))
    {
        warnings.push(ConfigWarning {
            code: "ignores.trace_ids",
            message: format!(
                "'{malformed}' is not a ,key=value, trace id and will match nothing"
            ),
        });
    }

    warnings
}

fn default_bind_addr() -> String {
    DEFAULT_BIND_ADDR.to_owned()
}

fn default_sqlite_path() -> String {
    DEFAULT_SQLITE_FILE.to_owned()
}

fn default_cache_ttl_secs() -> u64 {
    DEFAULT_CACHE_TTL_SECS
}

fn default_cache_capacity() -> usize {
    DEFAULT_CACHE_CAPACITY
}

fn default_refresh_timeout_ms() -> u64 {
    DEFAULT_REFRESH_TIMEOUT_MS
}

fn normalize_optional(input: Option<String>) -> Option<String> {
    input
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn normalize_config(mut config: GoldConfig) -> GoldConfig {
    let bind = config.server.bind.trim();
    if bind.is_empty() {
        config.server.bind = default_bind_addr();
    } else {
        config.server.bind = bind.to_owned();
    }

    config.storage.sqlite_path = config.storage.sqlite_path.trim().to_owned();
    config.storage.tile_path = normalize_optional(config.storage.tile_path.take());
    config.ignores.trace_ids = config
        .ignores
        .trace_ids
        .into_iter()
        .filter_map(|id| normalize_optional(Some(id)))
        .collect();

    config
}
