//! Fault type definition
//!
//! A Fault is a named, payload-carrying recoverable error. It is immutable
//! once thrown and is consumed at most once, either by the handler that
//! catches it or by the unhandled-fault reporter.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Handler name that catches any fault without a handler of its own name.
pub const DEFAULT_HANDLER_NAME: &str = "default";

/// Fault raised when an inbound message matches no session and no start operation.
pub const CORRELATION_ERROR: &str = "CorrelationError";

/// Fault raised when the message substrate fails underneath a session.
pub const IO_EXCEPTION: &str = "IOException";

/// Killer fault used when the runtime terminates sessions during shutdown.
pub const EXITING: &str = "Exiting";

/// A named application-level fault
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fault {
    name: String,
    #[serde(default)]
    payload: Value,
}

impl Fault {
    /// Create a fault with a payload
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }

    /// Create a fault without payload
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, Value::Null)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Same fault under a different name
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self::new(name, self.payload.clone())
    }

    /// Same fault with a different payload
    pub fn with_payload(&self, payload: Value) -> Self {
        Self::new(self.name.clone(), payload)
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.payload.is_null() {
            write!(f, "fault '{}'", self.name)
        } else {
            write!(f, "fault '{}': {}", self.name, self.payload)
        }
    }
}
