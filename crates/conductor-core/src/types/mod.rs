//! Core type definitions
//!
//! - Fault: named recoverable error with payload
//! - Message: envelope exchanged with the message substrate
//! - SessionId / CorrelationId: identifiers

mod fault;
mod ids;
mod message;

pub use fault::{Fault, CORRELATION_ERROR, DEFAULT_HANDLER_NAME, EXITING, IO_EXCEPTION};
pub use ids::{CorrelationId, SessionId};
pub use message::Message;
