//! SessionSpawner - correlation manager and session lifecycle
//!
//! The spawner decides how many sessions of the correlated activity run and
//! in what order, routes inbound messages to live sessions by correlation id,
//! and keeps `active_session_count`:
//! - incremented when a start message is admitted
//! - decremented when the admitted session completes
//!
//! Sequential mode serializes sessions through a single-permit FIFO
//! semaphore. The permit is released only after the completed session was
//! reported, so the next spawn is always ordered after the previous
//! completion.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use thiserror::Error;
use tokio::sync::{broadcast, watch, OwnedSemaphorePermit, Semaphore, TryAcquireError};

use conductor_config::RuntimeConfig;
use conductor_core::activity::ActivityRef;
use conductor_core::error::{ActivityResult, EngineError};
use conductor_core::substrate::{DiscardOutbound, Outbound, SubstrateError};
use conductor_core::types::{CorrelationId, Fault, Message, SessionId, CORRELATION_ERROR, EXITING};

use crate::concurrency::{ExecutionMode, RunningState};
use crate::event_bus::{BroadcastEventBus, EventBus, RuntimeEvent};
use crate::listener::{ListenerRegistry, SessionListener, SessionReport};
use crate::session::{Session, TerminationCause};

/// Runtime errors
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("spawner is shutting down")]
    ShuttingDown,

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("no session correlates with message for operation '{operation}'")]
    Uncorrelated {
        operation: String,
        correlation_id: Option<CorrelationId>,
    },

    #[error("session ended with unhandled fault: {0}")]
    UnhandledFault(Fault),

    #[error("invalid runtime config: {0}")]
    InvalidConfig(String),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("substrate error: {0}")]
    Substrate(#[from] SubstrateError),
}

/// Where an inbound message went
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routing {
    /// Delivered to the mailbox of a live session
    Delivered(SessionId),
    /// Started a new session
    Started(SessionId),
}

#[derive(Default)]
struct SessionTable {
    sessions: HashMap<SessionId, Arc<Session>>,
    by_correlation: HashMap<CorrelationId, SessionId>,
}

/// Shared spawner state behind every [`SpawnerHandle`]
pub struct SessionSpawner {
    mode: ExecutionMode,
    body: ActivityRef,
    start_operations: Vec<String>,
    outbound: Arc<dyn Outbound>,
    event_bus: Arc<dyn EventBus>,
    listeners: ListenerRegistry,
    /// One permit in sequential mode, the configured bound in concurrent mode
    admission: Option<Arc<Semaphore>>,
    active: watch::Sender<usize>,
    accepting: AtomicBool,
    /// Set once the shutdown grace period elapsed
    exiting: AtomicBool,
    table: Mutex<SessionTable>,
    single_session: Mutex<Option<Arc<Session>>>,
    single_fault: Mutex<Option<Fault>>,
    shutdown_grace: Option<Duration>,
}

/// Builder for a spawner
pub struct SpawnerBuilder {
    mode: ExecutionMode,
    start_operations: Vec<String>,
    max_concurrent_sessions: Option<usize>,
    shutdown_grace: Option<Duration>,
    outbound: Option<Arc<dyn Outbound>>,
    event_bus: Option<Arc<dyn EventBus>>,
    event_bus_capacity: usize,
    listeners: Vec<Arc<dyn SessionListener>>,
}

impl SpawnerBuilder {
    pub fn new(mode: ExecutionMode) -> Self {
        Self {
            mode,
            start_operations: Vec::new(),
            max_concurrent_sessions: None,
            shutdown_grace: None,
            outbound: None,
            event_bus: None,
            event_bus_capacity: 1024,
            listeners: Vec::new(),
        }
    }

    /// Builder preloaded from the `runtime` config section
    pub fn from_config(config: &RuntimeConfig) -> Result<Self, RuntimeError> {
        let mode: ExecutionMode = config
            .execution_mode
            .parse()
            .map_err(|err: crate::concurrency::UnknownExecutionMode| {
                RuntimeError::InvalidConfig(err.to_string())
            })?;
        let mut builder = Self::new(mode).with_start_operations(config.start_operations.clone());
        builder.event_bus_capacity = config.event_bus_capacity;
        if let Some(limit) = config.max_concurrent_sessions {
            builder = builder.max_concurrent_sessions(limit);
        }
        if let Some(grace_ms) = config.shutdown_grace_ms {
            builder = builder.shutdown_grace(Duration::from_millis(grace_ms));
        }
        Ok(builder)
    }

    pub fn with_start_operation(mut self, operation_id: impl Into<String>) -> Self {
        self.start_operations.push(operation_id.into());
        self
    }

    pub fn with_start_operations(mut self, operations: Vec<String>) -> Self {
        self.start_operations.extend(operations);
        self
    }

    /// Bound concurrent mode; ignored by the other modes
    pub fn max_concurrent_sessions(mut self, limit: usize) -> Self {
        self.max_concurrent_sessions = Some(limit.max(1));
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = Some(grace);
        self
    }

    pub fn outbound(mut self, outbound: Arc<dyn Outbound>) -> Self {
        self.outbound = Some(outbound);
        self
    }

    pub fn event_bus(mut self, event_bus: Arc<dyn EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn SessionListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Start the spawner for `body`. Must be called inside a tokio runtime;
    /// in single mode the one session is spawned right away.
    pub fn start(self, body: ActivityRef) -> SpawnerHandle {
        let admission = match self.mode {
            ExecutionMode::Sequential => Some(Arc::new(Semaphore::new(1))),
            ExecutionMode::Concurrent => self
                .max_concurrent_sessions
                .map(|limit| Arc::new(Semaphore::new(limit))),
            ExecutionMode::Single => None,
        };
        let (active, _) = watch::channel(0usize);
        let handle = SpawnerHandle {
            spawner: Arc::new(SessionSpawner {
                mode: self.mode,
                body,
                start_operations: self.start_operations,
                outbound: self.outbound.unwrap_or_else(|| Arc::new(DiscardOutbound)),
                event_bus: self
                    .event_bus
                    .unwrap_or_else(|| Arc::new(BroadcastEventBus::new(self.event_bus_capacity))),
                listeners: ListenerRegistry::from_listeners(self.listeners),
                admission,
                active,
                accepting: AtomicBool::new(true),
                exiting: AtomicBool::new(false),
                table: Mutex::new(SessionTable::default()),
                single_session: Mutex::new(None),
                single_fault: Mutex::new(None),
                shutdown_grace: self.shutdown_grace,
            }),
        };

        tracing::info!(mode = %handle.mode(), "session spawner started");
        if handle.mode() == ExecutionMode::Single && handle.admit().is_ok() {
            handle.launch(None, None);
        }
        handle
    }
}

/// Start a spawner for `body` in `mode` with default settings
pub fn start_activity(mode: ExecutionMode, body: ActivityRef) -> SpawnerHandle {
    SpawnerBuilder::new(mode).start(body)
}

/// Cloneable handle to a running spawner
#[derive(Clone)]
pub struct SpawnerHandle {
    spawner: Arc<SessionSpawner>,
}

impl SpawnerHandle {
    pub fn mode(&self) -> ExecutionMode {
        self.spawner.mode
    }

    /// Admitted sessions that have not completed yet
    pub fn active_session_count(&self) -> usize {
        *self.spawner.active.borrow()
    }

    pub fn is_accepting(&self) -> bool {
        self.spawner.accepting.load(Ordering::SeqCst)
    }

    pub fn running_state(&self) -> RunningState {
        RunningState {
            mode: self.mode(),
            active_count: self.active_session_count(),
            accepting: self.is_accepting(),
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.spawner.event_bus.subscribe()
    }

    pub fn session(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.spawner.table.lock().sessions.get(id).cloned()
    }

    /// Live sessions
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.spawner.table.lock().sessions.values().cloned().collect()
    }

    /// Whether messages for `operation_id` may start a session
    pub fn is_start_operation(&self, operation_id: &str) -> bool {
        self.spawner.start_operations.is_empty()
            || self
                .spawner
                .start_operations
                .iter()
                .any(|operation| operation == operation_id)
    }

    /// Admit `message` as a start message and spawn its session.
    ///
    /// Blocks cooperatively while the mode's admission is saturated (the
    /// previous session in sequential mode). In single mode the message goes
    /// to the one session.
    pub async fn on_inbound_start(&self, message: Message) -> Result<SessionId, RuntimeError> {
        if self.mode() == ExecutionMode::Single {
            return match self.try_deliver(message).await {
                Ok(session_id) => Ok(session_id),
                Err(_) => Err(RuntimeError::SessionNotFound("single session".to_string())),
            };
        }
        self.admit()?;
        self.spawn_admitted(message).await
    }

    /// Route an inbound message: to the session it correlates with, to the
    /// single session, as a new start, or back to the sender as a
    /// `CorrelationError` fault.
    pub async fn on_message(&self, message: Message) -> Result<Routing, RuntimeError> {
        let message = match self.try_deliver(message).await {
            Ok(session_id) => return Ok(Routing::Delivered(session_id)),
            Err(message) => message,
        };
        if self.mode() != ExecutionMode::Single && self.is_start_operation(&message.operation_id)
        {
            return self.on_inbound_start(message).await.map(Routing::Started);
        }
        Err(self.reject(message).await)
    }

    /// Stop admitting sessions and wait until every admitted session completed.
    ///
    /// With a grace period, sessions still running when it elapses are killed
    /// with an `Exiting` fault and the wait continues. In single mode an
    /// unhandled fault of the session is returned as an error.
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        if self.spawner.accepting.swap(false, Ordering::SeqCst) {
            tracing::info!(
                mode = %self.mode(),
                active = self.active_session_count(),
                "session spawner shutting down"
            );
        }

        let mut active = self.spawner.active.subscribe();
        match self.spawner.shutdown_grace {
            Some(grace) => {
                if tokio::time::timeout(grace, wait_idle(&mut active))
                    .await
                    .is_err()
                {
                    self.spawner.exiting.store(true, Ordering::SeqCst);
                    let live = self.sessions();
                    tracing::warn!(
                        remaining = live.len(),
                        grace_ms = grace.as_millis() as u64,
                        "shutdown grace elapsed, killing sessions"
                    );
                    for session in live {
                        session.kill(Some(Fault::named(EXITING)));
                    }
                    wait_idle(&mut active).await;
                }
            }
            None => wait_idle(&mut active).await,
        }
        tracing::info!(mode = %self.mode(), "session spawner drained");

        if self.mode().surfaces_unhandled_faults() {
            if let Some(fault) = self.spawner.single_fault.lock().clone() {
                return Err(RuntimeError::UnhandledFault(fault));
            }
        }
        Ok(())
    }

    /// Count a start message as active before its session exists
    pub(crate) fn admit(&self) -> Result<(), RuntimeError> {
        if !self.is_accepting() {
            return Err(RuntimeError::ShuttingDown);
        }
        self.spawner.active.send_modify(|count| *count += 1);
        Ok(())
    }

    /// Undo an [`SpawnerHandle::admit`] whose session will never run
    pub(crate) fn release_admission(&self) {
        if let Err(err) = self.release() {
            tracing::error!(error = %err, "session accounting violated");
        }
    }

    /// Wait for an admission turn, then spawn the session for an admitted message
    pub(crate) async fn spawn_admitted(&self, message: Message) -> Result<SessionId, RuntimeError> {
        let permit = match &self.spawner.admission {
            Some(admission) => match admission.clone().acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => {
                    self.release_admission();
                    return Err(RuntimeError::ShuttingDown);
                }
            },
            None => None,
        };
        Ok(self.launch(Some(message), permit))
    }

    /// Spawn an admitted message right away if its admission turn is free,
    /// handing it back otherwise
    pub(crate) fn try_spawn_admitted(&self, message: Message) -> Result<SessionId, Message> {
        let permit = match &self.spawner.admission {
            Some(admission) => match admission.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => {
                    return Err(message)
                }
            },
            None => None,
        };
        Ok(self.launch(Some(message), permit))
    }

    /// Deliver to the correlated (or single) live session, handing the
    /// message back when none takes it
    pub(crate) async fn try_deliver(&self, message: Message) -> Result<SessionId, Message> {
        let target = {
            let table = self.spawner.table.lock();
            message
                .correlation_id
                .and_then(|correlation| table.by_correlation.get(&correlation))
                .and_then(|session_id| table.sessions.get(session_id))
                .cloned()
        };
        let target = match target {
            Some(session) => Some(session),
            None if self.mode() == ExecutionMode::Single => self.spawner.single_session.lock().clone(),
            None => None,
        };
        let Some(session) = target else {
            return Err(message);
        };

        let operation = message.operation_id.clone();
        let correlation_id = message.correlation_id;
        session.deliver(message)?;
        tracing::debug!(
            session_id = %session.id(),
            operation = %operation,
            correlation_id = ?correlation_id,
            "message routed"
        );
        self.spawner
            .event_bus
            .publish(RuntimeEvent::message_routed(
                session.id().clone(),
                operation,
                correlation_id,
            ))
            .await;
        Ok(session.id().clone())
    }

    /// Answer an uncorrelated message with a `CorrelationError` fault
    pub(crate) async fn reject(&self, message: Message) -> RuntimeError {
        let operation = message.operation_id.clone();
        let correlation_id = message.correlation_id;
        tracing::warn!(
            operation = %operation,
            correlation_id = ?correlation_id,
            "no session correlates with inbound message"
        );

        let fault = Fault::new(
            CORRELATION_ERROR,
            json!({ "operation": operation, "correlation_id": correlation_id }),
        );
        if let Err(err) = self
            .spawner
            .outbound
            .send(Message::fault_response_to(&message, fault))
            .await
        {
            tracing::warn!(error = %err, operation = %operation, "failed to send correlation error");
        }
        self.spawner
            .event_bus
            .publish(RuntimeEvent::message_rejected(
                operation.clone(),
                correlation_id,
                "uncorrelated",
            ))
            .await;
        RuntimeError::Uncorrelated {
            operation,
            correlation_id,
        }
    }

    fn launch(&self, start: Option<Message>, permit: Option<OwnedSemaphorePermit>) -> SessionId {
        let session = Arc::new(Session::new(start, self.spawner.outbound.clone()));
        let session_id = session.id().clone();
        {
            let mut table = self.spawner.table.lock();
            table.sessions.insert(session_id.clone(), session.clone());
            if let Some(correlation_id) = session.correlation_id() {
                table.by_correlation.insert(correlation_id, session_id.clone());
            }
        }
        if self.mode() == ExecutionMode::Single {
            *self.spawner.single_session.lock() = Some(session.clone());
        }
        if self.spawner.exiting.load(Ordering::SeqCst) {
            session.kill(Some(Fault::named(EXITING)));
        }

        tracing::info!(
            session_id = %session_id,
            correlation_id = ?session.correlation_id(),
            mode = %self.mode(),
            "session spawned"
        );

        let handle = self.clone();
        tokio::spawn(async move {
            handle
                .spawner
                .event_bus
                .publish(RuntimeEvent::session_spawned(
                    session.id().clone(),
                    session.correlation_id(),
                ))
                .await;
            let outcome = session.context().run_root(handle.spawner.body.clone()).await;
            handle.on_session_completed(&session, outcome).await;
            drop(permit);
        });
        session_id
    }

    /// Report a finished session, then release its admission
    async fn on_session_completed(&self, session: &Session, outcome: ActivityResult) {
        let cause = TerminationCause::from_outcome(&outcome);
        match &cause {
            TerminationCause::Normal => {
                tracing::info!(session_id = %session.id(), "session completed");
            }
            TerminationCause::Fault { fault } if self.mode().surfaces_unhandled_faults() => {
                tracing::error!(
                    session_id = %session.id(),
                    fault = %fault,
                    "unhandled fault in single session"
                );
                *self.spawner.single_fault.lock() = Some(fault.clone());
            }
            TerminationCause::Fault { fault } => {
                tracing::warn!(
                    session_id = %session.id(),
                    fault = %fault,
                    "session terminated by unhandled fault"
                );
            }
            TerminationCause::Killed => {
                tracing::info!(session_id = %session.id(), "session killed");
            }
            TerminationCause::Fatal { error } => {
                tracing::error!(session_id = %session.id(), error = %error, "session failed");
            }
        }

        let undelivered = session.complete(cause.clone());
        if !undelivered.is_empty() {
            tracing::debug!(
                session_id = %session.id(),
                count = undelivered.len(),
                "dropping messages left in mailbox"
            );
        }
        {
            let mut table = self.spawner.table.lock();
            table.sessions.remove(session.id());
            if let Some(correlation_id) = session.correlation_id() {
                if table.by_correlation.get(&correlation_id) == Some(session.id()) {
                    table.by_correlation.remove(&correlation_id);
                }
            }
        }

        self.spawner
            .event_bus
            .publish(RuntimeEvent::session_completed(
                session.id().clone(),
                session.correlation_id(),
                cause.clone(),
            ))
            .await;
        let report = SessionReport {
            session_id: session.id().clone(),
            correlation_id: session.correlation_id(),
            mode: self.mode(),
            cause,
        };
        self.spawner.listeners.notify(&report).await;
        self.release_admission();
    }

    fn release(&self) -> Result<(), EngineError> {
        let mut result = Ok(());
        self.spawner.active.send_modify(|count| {
            if *count == 0 {
                result = Err(EngineError::NegativeSessionCount);
            } else {
                *count -= 1;
            }
        });
        result
    }
}

async fn wait_idle(active: &mut watch::Receiver<usize>) {
    // The sender lives as long as the spawner, so this only returns at zero.
    let _ = active.wait_for(|count| *count == 0).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use conductor_core::activity::{Activity, Throw};
    use conductor_core::context::ExecutionContext;
    use conductor_core::error::Interrupt;
    use crate::event_bus::RuntimeEventKind;
    use crate::substrate::ChannelOutbound;
    use tokio::sync::mpsc;

    /// Waits for one `data` message and echoes it back
    struct Echo;

    #[async_trait]
    impl Activity for Echo {
        async fn run(&self, ctx: &ExecutionContext) -> ActivityResult {
            let message = ctx.receive("data").await?;
            ctx.reply(&message, message.payload.clone()).await
        }
    }

    /// Runs until killed
    struct Forever;

    #[async_trait]
    impl Activity for Forever {
        async fn run(&self, ctx: &ExecutionContext) -> ActivityResult {
            ctx.killed().await;
            Err(Interrupt::Killed)
        }
    }

    #[tokio::test]
    async fn test_correlated_message_reaches_its_session() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = SpawnerBuilder::new(ExecutionMode::Concurrent)
            .with_start_operation("start")
            .outbound(Arc::new(ChannelOutbound::new(tx)))
            .start(Arc::new(Echo));

        let started = handle
            .on_message(Message::correlated("start", 1, json!(null)))
            .await
            .unwrap();
        let Routing::Started(session_id) = started else {
            panic!("expected a new session");
        };
        let routed = handle
            .on_message(Message::correlated("data", 1, json!("hello")))
            .await
            .unwrap();
        assert_eq!(routed, Routing::Delivered(session_id));

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.correlation_id, Some(1));
        assert_eq!(reply.payload, json!("hello"));
        handle.shutdown().await.unwrap();
        assert_eq!(handle.active_session_count(), 0);
    }

    #[tokio::test]
    async fn test_uncorrelated_message_gets_correlation_error() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = SpawnerBuilder::new(ExecutionMode::Concurrent)
            .with_start_operation("start")
            .outbound(Arc::new(ChannelOutbound::new(tx)))
            .start(Arc::new(Echo));
        let mut events = handle.subscribe_events();

        let err = handle
            .on_message(Message::correlated("data", 9, json!(null)))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Uncorrelated { correlation_id: Some(9), .. }));

        let response = rx.recv().await.unwrap();
        assert_eq!(response.fault.unwrap().name(), CORRELATION_ERROR);
        assert_eq!(response.correlation_id, Some(9));
        assert!(matches!(
            events.recv().await.unwrap().kind,
            RuntimeEventKind::MessageRejected { .. }
        ));
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_starts() {
        let handle = start_activity(ExecutionMode::Concurrent, Arc::new(Throw::named("x")));
        handle.shutdown().await.unwrap();
        let err = handle
            .on_inbound_start(Message::new("start", json!(null)))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::ShuttingDown));
        assert_eq!(handle.active_session_count(), 0);
    }

    #[tokio::test]
    async fn test_grace_period_kills_remaining_sessions() {
        let handle = SpawnerBuilder::new(ExecutionMode::Concurrent)
            .shutdown_grace(Duration::from_millis(10))
            .start(Arc::new(Forever));
        handle
            .on_inbound_start(Message::new("start", json!(null)))
            .await
            .unwrap();
        assert_eq!(handle.active_session_count(), 1);

        handle.shutdown().await.unwrap();
        assert_eq!(handle.active_session_count(), 0);
        assert!(handle.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_bounded_concurrent_mode_limits_running_sessions() {
        let handle = SpawnerBuilder::new(ExecutionMode::Concurrent)
            .max_concurrent_sessions(1)
            .shutdown_grace(Duration::from_millis(10))
            .start(Arc::new(Forever));
        handle
            .on_inbound_start(Message::new("start", json!(1)))
            .await
            .unwrap();

        let pending = {
            let handle = handle.clone();
            tokio::spawn(async move {
                handle
                    .on_inbound_start(Message::new("start", json!(2)))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(handle.active_session_count(), 2);
        assert_eq!(handle.sessions().len(), 1);

        handle.shutdown().await.unwrap();
        assert!(pending.await.unwrap().is_ok());
        assert_eq!(handle.active_session_count(), 0);
    }

    #[test]
    fn test_builder_from_config_rejects_unknown_mode() {
        let mut config = RuntimeConfig::default();
        config.execution_mode = "eventually".to_string();
        assert!(matches!(
            SpawnerBuilder::from_config(&config),
            Err(RuntimeError::InvalidConfig(_))
        ));

        config.execution_mode = "sequential".to_string();
        config.shutdown_grace_ms = Some(50);
        let builder = SpawnerBuilder::from_config(&config).unwrap();
        assert_eq!(builder.mode, ExecutionMode::Sequential);
        assert_eq!(builder.shutdown_grace, Some(Duration::from_millis(50)));
    }
}
