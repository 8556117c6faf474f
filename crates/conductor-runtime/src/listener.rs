//! Session listeners - extension point notified after every session ends.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use conductor_core::types::{CorrelationId, SessionId};

use crate::concurrency::ExecutionMode;
use crate::session::TerminationCause;

/// What a listener learns about a finished session.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session_id: SessionId,
    pub correlation_id: Option<CorrelationId>,
    pub mode: ExecutionMode,
    pub cause: TerminationCause,
}

/// Session listener extension point.
#[async_trait]
pub trait SessionListener: Send + Sync {
    /// Called after a session ended normally
    async fn on_session_executed(&self, _report: &SessionReport) -> Result<(), String> {
        Ok(())
    }

    /// Called after a session ended with a fault, a kill or a fatal error
    async fn on_session_error(&self, _report: &SessionReport) -> Result<(), String> {
        Ok(())
    }
}

/// Registry for session listeners.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<Vec<Arc<dyn SessionListener>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn from_listeners(listeners: Vec<Arc<dyn SessionListener>>) -> Self {
        Self {
            listeners: RwLock::new(listeners),
        }
    }

    pub async fn register(&self, listener: Arc<dyn SessionListener>) {
        self.listeners.write().await.push(listener);
    }

    async fn snapshot(&self) -> Vec<Arc<dyn SessionListener>> {
        self.listeners.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.listeners.read().await.len()
    }

    /// Notify every listener; a failing listener is logged and skipped.
    pub async fn notify(&self, report: &SessionReport) {
        for listener in self.snapshot().await {
            let result = if report.cause.is_normal() {
                listener.on_session_executed(report).await
            } else {
                listener.on_session_error(report).await
            };
            if let Err(err) = result {
                tracing::warn!(
                    error = %err,
                    session_id = %report.session_id,
                    "session listener failed"
                );
            }
        }
    }
}
