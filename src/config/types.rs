use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Lifecycle manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Framework identifier of the running host, compared against the
    /// framework folders of a package
    pub runtime_framework: String,

    /// Directory inside an extracted package holding the framework folders
    pub binaries_root: String,

    /// Parent directory of per-load scratch directories
    pub scratch_root: PathBuf,

    /// Refuse to fall back to an incompatible framework folder
    pub strict_framework: bool,

    /// Capacity of the lifecycle and cleanup event channels
    pub event_capacity: usize,

    /// Arguments handed to every plugin constructor
    pub plugin_args: serde_json::Value,

    /// Scratch directory cleanup policy
    pub cleanup: CleanupConfig,

    /// Local package feed
    pub source: SourceConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            runtime_framework: format!("abi{}", crate::plugins::PLUGIN_API_VERSION),
            binaries_root: "lib".to_string(),
            scratch_root: std::env::temp_dir().join("nugget-rs").join("scratch"),
            strict_framework: false,
            event_capacity: 256,
            plugin_args: serde_json::Value::Null,
            cleanup: CleanupConfig::default(),
            source: SourceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Bounded retry policy of the cleanup scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Maximum number of deletion attempts
    pub max_attempts: u32,

    /// Pause before each attempt in milliseconds
    pub pause_ms: u64,

    /// Extra wait after a locking failure in milliseconds
    pub lock_backoff_ms: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            pause_ms: 100,
            lock_backoff_ms: 1000,
        }
    }
}

/// Local package feed configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Directory holding `*.nupkg` archives
    pub feed_dir: PathBuf,

    /// Directory downloaded archives are copied into
    pub cache_dir: PathBuf,

    /// Authors allowed to be installed; empty allows everyone
    pub trusted_authors: Vec<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            feed_dir: PathBuf::from("packages"),
            cache_dir: std::env::temp_dir().join("nugget-rs").join("cache"),
            trusted_authors: Vec::new(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or filter directive (e.g. `info`, `nugget_rs=debug`)
    pub level: String,

    /// Log file directory
    pub dir: Option<PathBuf>,

    /// Enable console output
    pub console: bool,

    /// Enable file output
    pub file: bool,

    /// File rotation: `daily`, `hourly` or `never`
    pub rotation: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
            console: true,
            file: false,
            rotation: "daily".to_string(),
        }
    }
}
