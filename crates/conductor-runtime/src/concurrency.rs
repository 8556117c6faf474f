//! Execution Mode
//!
//! Defines how many sessions of the correlated activity may run, and in what
//! order relative to inbound start messages.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Session admission policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One session, started at startup; inbound messages go to it
    Single,
    /// Every accepted start message spawns a session immediately
    #[default]
    Concurrent,
    /// One session in flight at a time, in arrival order
    Sequential,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Single => "single",
            ExecutionMode::Concurrent => "concurrent",
            ExecutionMode::Sequential => "sequential",
        }
    }

    /// Whether unhandled session faults surface at process level
    pub fn surfaces_unhandled_faults(&self) -> bool {
        matches!(self, ExecutionMode::Single)
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for unknown execution mode names
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported execution mode: {0}")]
pub struct UnknownExecutionMode(pub String);

impl FromStr for ExecutionMode {
    type Err = UnknownExecutionMode;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "single" => Ok(ExecutionMode::Single),
            "concurrent" => Ok(ExecutionMode::Concurrent),
            "sequential" => Ok(ExecutionMode::Sequential),
            _ => Err(UnknownExecutionMode(value.to_string())),
        }
    }
}

/// Admission state of the spawner, as seen by callers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningState {
    pub mode: ExecutionMode,
    /// Admitted sessions not yet completed, including ones waiting for their turn
    pub active_count: usize,
    /// Whether new start messages are still admitted
    pub accepting: bool,
}

impl RunningState {
    pub fn is_idle(&self) -> bool {
        self.active_count == 0
    }
}
