//! # Conductor Runtime
//!
//! Session spawner for correlated activities.
//!
//! This crate provides:
//! - `SpawnerHandle` for admission, correlation routing and shutdown
//! - `ExecutionMode` (single, concurrent, sequential)
//! - `Session` lifecycle with a per-session mailbox
//! - `Dispatcher` draining an inbound message stream
//! - `EventBus` and `SessionListener` for lifecycle observation
//! - In-memory transport for embedding and tests

mod bootstrap;
mod concurrency;
mod dispatcher;
mod event_bus;
mod listener;
mod session;
mod spawner;
mod substrate;

pub use bootstrap::{BootstrapError, RuntimeApp};
pub use concurrency::{ExecutionMode, RunningState, UnknownExecutionMode};
pub use dispatcher::{DispatchStats, Dispatcher};
pub use event_bus::{BroadcastEventBus, EventBus, RuntimeEvent, RuntimeEventKind};
pub use listener::{ListenerRegistry, SessionListener, SessionReport};
pub use session::{Session, SessionState, TerminationCause};
pub use spawner::{start_activity, Routing, RuntimeError, SpawnerBuilder, SpawnerHandle};
pub use substrate::{memory_transport, ChannelOutbound, TransportClient, TransportServer};

// Re-export core types for convenience
pub use conductor_core::prelude::*;
