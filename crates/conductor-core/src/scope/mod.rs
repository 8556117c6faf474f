//! Scope Stack (fault & compensation engine)
//!
//! Running a scoped block pushes a frame, runs the body and resolves the
//! exit in one of three ways:
//! - normal completion: pop and hand the frame's compensations outward
//! - fault: run the current frame's handler for it as the new body, or pop
//!   and keep propagating
//! - kill: run the compensation installed under the same frame id instead
//!   of propagating, or pop without merging and keep propagating

mod engine;
mod frame;

pub use frame::{ScopeFrame, ScopeStack};
