//! Configuration loading and validation.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::{ConductorConfig, EXECUTION_MODES};

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Load the full configuration from a YAML file.
pub fn load_config(path: &Path) -> Result<ConductorConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config: ConductorConfig = serde_yaml::from_str(&content)?;
    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(config: &ConductorConfig) -> Result<(), ConfigError> {
    if config.version == 0 {
        return Err(ConfigError::Invalid(
            "version must be greater than 0".to_string(),
        ));
    }

    if config.app.name.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "app.name must not be empty".to_string(),
        ));
    }

    let runtime = &config.runtime;
    let mode = runtime.execution_mode.trim().to_ascii_lowercase();
    if !EXECUTION_MODES.contains(&mode.as_str()) {
        return Err(ConfigError::Invalid(format!(
            "runtime.execution_mode '{}' is not one of {}",
            runtime.execution_mode,
            EXECUTION_MODES.join(", ")
        )));
    }

    if let Some(limit) = runtime.max_concurrent_sessions {
        if limit == 0 {
            return Err(ConfigError::Invalid(
                "runtime.max_concurrent_sessions must be > 0".to_string(),
            ));
        }
        if mode != "concurrent" {
            return Err(ConfigError::Invalid(format!(
                "runtime.max_concurrent_sessions only applies to concurrent mode, not '{}'",
                mode
            )));
        }
    }

    if runtime.event_bus_capacity == 0 {
        return Err(ConfigError::Invalid(
            "runtime.event_bus_capacity must be > 0".to_string(),
        ));
    }

    if runtime
        .start_operations
        .iter()
        .any(|operation| operation.trim().is_empty())
    {
        return Err(ConfigError::Invalid(
            "runtime.start_operations must not contain blank names".to_string(),
        ));
    }

    Ok(())
}
