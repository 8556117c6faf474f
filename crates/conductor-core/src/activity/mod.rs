//! Activity abstraction module
//!
//! This module defines the Activity trait and the built-in nodes that
//! drive the scope engine:
//! - Activity: one step of a session body
//! - Sequence / Scope / Install: structure and recovery wiring
//! - Throw / Rethrow / Compensate / CurrentHandler: recovery primitives

mod builtin;

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::ExecutionContext;
use crate::error::ActivityResult;

pub use builtin::{
    Compensate, CurrentHandler, HandlerKind, Install, Noop, Rethrow, Scope, Sequence, Throw,
};

/// Activity trait - one executable node of a session body
///
/// Activities are cooperative. A long-running activity should call
/// [`ExecutionContext::checkpoint`] between steps, and every suspension it
/// performs through the context observes the session's kill switch.
#[async_trait]
pub trait Activity: Send + Sync {
    /// Run the activity
    async fn run(&self, ctx: &ExecutionContext) -> ActivityResult;

    /// Whether a kill may stop this activity mid-flight
    fn is_killable(&self) -> bool {
        true
    }
}

/// Shared activity handle
pub type ActivityRef = Arc<dyn Activity>;
