//! Session - one running instance of the correlated activity
//!
//! A session owns its mailbox and root execution context. It is created by
//! the spawner for an accepted start message (or once at startup in single
//! mode) and dropped after its body returned and listeners were notified.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use conductor_core::context::{ExecutionContext, SessionLink};
use conductor_core::error::{ActivityResult, Interrupt};
use conductor_core::mailbox::Mailbox;
use conductor_core::substrate::{Outbound, SessionPort};
use conductor_core::types::{CorrelationId, Fault, Message, SessionId};

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminationCause {
    Normal,
    /// A fault no handler consumed
    Fault { fault: Fault },
    /// Terminated by a kill, after any termination handlers ran
    Killed,
    /// An engine invariant was violated
    Fatal { error: String },
}

impl TerminationCause {
    pub fn from_outcome(outcome: &ActivityResult) -> Self {
        match outcome {
            Ok(()) => TerminationCause::Normal,
            Err(Interrupt::Fault(fault)) => TerminationCause::Fault {
                fault: fault.clone(),
            },
            Err(Interrupt::Killed) => TerminationCause::Killed,
            Err(Interrupt::Fatal(error)) => TerminationCause::Fatal {
                error: error.to_string(),
            },
        }
    }

    pub fn is_normal(&self) -> bool {
        matches!(self, TerminationCause::Normal)
    }

    pub fn unhandled_fault(&self) -> Option<&Fault> {
        match self {
            TerminationCause::Fault { fault } => Some(fault),
            _ => None,
        }
    }
}

/// Session lifecycle state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Running,
    Completed(TerminationCause),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed(_))
    }
}

/// One execution instance of the session body
pub struct Session {
    id: SessionId,
    correlation_id: Option<CorrelationId>,
    mailbox: Arc<Mailbox>,
    context: ExecutionContext,
    state: Mutex<SessionState>,
    started_at: DateTime<Utc>,
}

impl Session {
    /// Create a session bound to `start_message`, sending through `outbound`
    pub fn new(start_message: Option<Message>, outbound: Arc<dyn Outbound>) -> Self {
        Self::with_id(SessionId::generate(), start_message, outbound)
    }

    pub fn with_id(
        id: impl Into<SessionId>,
        start_message: Option<Message>,
        outbound: Arc<dyn Outbound>,
    ) -> Self {
        let id = id.into();
        let mailbox = Arc::new(Mailbox::new());
        let correlation_id = start_message.as_ref().and_then(|m| m.correlation_id);
        let port = SessionPort::new(mailbox.clone(), outbound);
        let context = ExecutionContext::new(SessionLink::new(id.clone(), start_message, port));
        Self {
            id,
            correlation_id,
            mailbox,
            context,
            state: Mutex::new(SessionState::Running),
            started_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.correlation_id
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    pub fn mailbox(&self) -> &Arc<Mailbox> {
        &self.mailbox
    }

    pub fn state(&self) -> SessionState {
        self.state.lock().clone()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Route an inbound message into the session's mailbox. The message is
    /// handed back once the session has completed.
    pub fn deliver(&self, message: Message) -> Result<(), Message> {
        self.mailbox.try_push(message)
    }

    /// Cooperatively kill the session
    pub fn kill(&self, killer: Option<Fault>) {
        self.context.kill(killer);
    }

    /// Record the outcome and close the mailbox; returns undelivered messages
    pub(crate) fn complete(&self, cause: TerminationCause) -> Vec<Message> {
        *self.state.lock() = SessionState::Completed(cause);
        self.mailbox.close()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("correlation_id", &self.correlation_id)
            .field("state", &self.state())
            .field("started_at", &self.started_at)
            .finish()
    }
}
