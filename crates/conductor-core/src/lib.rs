//! # Conductor Core
//!
//! Execution semantics of the conductor session engine.
//!
//! This crate contains:
//! - Fault / Message / Interrupt definitions
//! - The Activity abstraction and its built-in nodes
//! - Scope stack with fault handlers and compensations
//! - Input race engine (non-deterministic choice) and per-session mailbox
//! - Parallel / kill coordination
//!
//! This crate does NOT care about:
//! - How many sessions run at once
//! - How messages reach a session
//! - How payloads are encoded on the wire

pub mod activity;
pub mod choice;
pub mod context;
pub mod error;
pub mod kill;
pub mod mailbox;
pub mod parallel;
pub mod scope;
pub mod substrate;
pub mod types;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::activity::{
        Activity, ActivityRef, Compensate, CurrentHandler, HandlerKind, Install, Noop, Rethrow,
        Scope, Sequence, Throw,
    };
    pub use crate::choice::{
        Choice, ChoiceId, ChoiceInstance, ChoiceState, Continuation, InputSource, RunActivity,
        Selection,
    };
    pub use crate::context::{ExecutionContext, SessionLink, ROOT_SCOPE_ID};
    pub use crate::error::{ActivityResult, EngineError, Interrupt};
    pub use crate::kill::KillSwitch;
    pub use crate::mailbox::Mailbox;
    pub use crate::parallel::Parallel;
    pub use crate::scope::{ScopeFrame, ScopeStack};
    pub use crate::substrate::{
        DiscardOutbound, MessageSubstrate, Outbound, SessionPort, SubstrateError,
    };
    pub use crate::types::{
        CorrelationId, Fault, Message, SessionId, CORRELATION_ERROR, DEFAULT_HANDLER_NAME,
        EXITING, IO_EXCEPTION,
    };
}

// Re-export key types at crate root
pub use activity::{Activity, ActivityRef};
pub use choice::{Choice, Selection};
pub use context::{ExecutionContext, SessionLink};
pub use error::{ActivityResult, EngineError, Interrupt};
pub use mailbox::Mailbox;
pub use parallel::Parallel;
pub use types::{Fault, Message, SessionId};
