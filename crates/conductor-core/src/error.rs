//! Interrupt and engine error types
//!
//! Three kinds of abrupt completion travel up an activity tree:
//! - `Fault`: application-level, recoverable through scope handlers
//! - `Killed`: cooperative termination, recoverable only by a compensation
//! - `Fatal`: an engine invariant was violated; never caught by handlers

use thiserror::Error;

use crate::types::Fault;

/// Engine invariant violations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("choice armed with no branches")]
    EmptyChoice,

    #[error("rethrow called outside a fault handler")]
    NoActiveFault,

    #[error("active session count would become negative")]
    NegativeSessionCount,
}

/// Abrupt completion of an activity
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Interrupt {
    #[error("{0}")]
    Fault(Fault),

    #[error("execution killed")]
    Killed,

    #[error("fatal engine error: {0}")]
    Fatal(#[from] EngineError),
}

impl Interrupt {
    pub fn is_fault(&self) -> bool {
        matches!(self, Interrupt::Fault(_))
    }

    pub fn is_killed(&self) -> bool {
        matches!(self, Interrupt::Killed)
    }

    /// The fault carried by this interrupt, if any
    pub fn fault(&self) -> Option<&Fault> {
        match self {
            Interrupt::Fault(fault) => Some(fault),
            _ => None,
        }
    }
}

impl From<Fault> for Interrupt {
    fn from(fault: Fault) -> Self {
        Interrupt::Fault(fault)
    }
}

/// Result type returned by every activity
pub type ActivityResult<T = ()> = Result<T, Interrupt>;
