//! EventBus - realtime fan-out of spawner lifecycle events.
//!
//! Embedders and tests subscribe to observe the spawn/complete trace and
//! message routing decisions. Publishing never blocks a session.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use conductor_core::types::{CorrelationId, SessionId};

use crate::session::TerminationCause;

/// Lifecycle event kinds
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeEventKind {
    SessionSpawned {
        session_id: SessionId,
        correlation_id: Option<CorrelationId>,
    },
    SessionCompleted {
        session_id: SessionId,
        correlation_id: Option<CorrelationId>,
        cause: TerminationCause,
    },
    MessageRouted {
        session_id: SessionId,
        operation: String,
        correlation_id: Option<CorrelationId>,
    },
    MessageRejected {
        operation: String,
        correlation_id: Option<CorrelationId>,
        reason: String,
    },
}

/// Timestamped lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuntimeEvent {
    #[serde(flatten)]
    pub kind: RuntimeEventKind,
    pub timestamp: DateTime<Utc>,
}

impl RuntimeEvent {
    pub fn new(kind: RuntimeEventKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
        }
    }

    pub fn session_spawned(session_id: SessionId, correlation_id: Option<CorrelationId>) -> Self {
        Self::new(RuntimeEventKind::SessionSpawned {
            session_id,
            correlation_id,
        })
    }

    pub fn session_completed(
        session_id: SessionId,
        correlation_id: Option<CorrelationId>,
        cause: TerminationCause,
    ) -> Self {
        Self::new(RuntimeEventKind::SessionCompleted {
            session_id,
            correlation_id,
            cause,
        })
    }

    pub fn message_routed(
        session_id: SessionId,
        operation: impl Into<String>,
        correlation_id: Option<CorrelationId>,
    ) -> Self {
        Self::new(RuntimeEventKind::MessageRouted {
            session_id,
            operation: operation.into(),
            correlation_id,
        })
    }

    pub fn message_rejected(
        operation: impl Into<String>,
        correlation_id: Option<CorrelationId>,
        reason: impl Into<String>,
    ) -> Self {
        Self::new(RuntimeEventKind::MessageRejected {
            operation: operation.into(),
            correlation_id,
            reason: reason.into(),
        })
    }

    /// Session the event is about, if any
    pub fn session_id(&self) -> Option<&SessionId> {
        match &self.kind {
            RuntimeEventKind::SessionSpawned { session_id, .. }
            | RuntimeEventKind::SessionCompleted { session_id, .. }
            | RuntimeEventKind::MessageRouted { session_id, .. } => Some(session_id),
            RuntimeEventKind::MessageRejected { .. } => None,
        }
    }
}

/// EventBus trait - async interface for realtime event publish/subscribe.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event to all active subscribers.
    async fn publish(&self, event: RuntimeEvent);

    /// Subscribe to realtime events.
    fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent>;
}

/// In-process EventBus based on tokio broadcast channels.
pub struct BroadcastEventBus {
    tx: broadcast::Sender<RuntimeEvent>,
    capacity: usize,
}

impl BroadcastEventBus {
    /// Create a new broadcast bus with channel capacity.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Return the configured channel capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventBus for BroadcastEventBus {
    async fn publish(&self, event: RuntimeEvent) {
        // No subscriber is not an error.
        let _ = self.tx.send(event);
    }

    fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.tx.subscribe()
    }
}
