//! # Conductor Config
//!
//! Single-file configuration for the conductor session engine.
//! One `conductor.yaml` configures the session spawner and observability.

mod loader;

pub use loader::{load_config, validate_config, ConfigError};

use serde::Deserialize;

/// Execution mode names accepted by `runtime.execution_mode`
pub const EXECUTION_MODES: [&str; 3] = ["single", "concurrent", "sequential"];

/// Top-level configuration schema.
#[derive(Debug, Clone, Deserialize)]
pub struct ConductorConfig {
    /// Config schema version.
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

fn default_version() -> u32 {
    1
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            app: AppConfig::default(),
            runtime: RuntimeConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_app_name")]
    pub name: String,
    #[serde(default = "default_env")]
    pub environment: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            environment: default_env(),
        }
    }
}

fn default_app_name() -> String {
    "conductor".to_string()
}

fn default_env() -> String {
    "development".to_string()
}

/// Session spawner settings
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    /// `single`, `concurrent` or `sequential`
    #[serde(default = "default_execution_mode")]
    pub execution_mode: String,
    /// Operations whose messages start a new session. Empty means any
    /// message no live session takes does.
    #[serde(default)]
    pub start_operations: Vec<String>,
    /// Admission bound for concurrent mode; unbounded when absent.
    #[serde(default)]
    pub max_concurrent_sessions: Option<usize>,
    /// How long shutdown waits before killing the remaining sessions.
    #[serde(default)]
    pub shutdown_grace_ms: Option<u64>,
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            execution_mode: default_execution_mode(),
            start_operations: Vec::new(),
            max_concurrent_sessions: None,
            shutdown_grace_ms: None,
            event_bus_capacity: default_event_bus_capacity(),
        }
    }
}

fn default_execution_mode() -> String {
    "concurrent".to_string()
}

fn default_event_bus_capacity() -> usize {
    1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub traces_enabled: bool,
    #[serde(default)]
    pub log_file: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            traces_enabled: false,
            log_file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
