//! Input Race Engine (non-deterministic choice)
//!
//! A [`Choice`] waits on several inbound operations at once and proceeds
//! with exactly one of them:
//! - the instance signs up with the session's [`InputSource`] for every
//!   operation
//! - the first delivery wins; every other registration is withdrawn
//! - a kill while armed cancels the instance without running any branch

mod instance;

pub use instance::{ChoiceId, ChoiceInstance, ChoiceState};

use std::sync::Arc;

use async_trait::async_trait;

use crate::activity::{Activity, ActivityRef};
use crate::context::ExecutionContext;
use crate::error::{ActivityResult, EngineError};
use crate::kill::KillSwitch;
use crate::types::Message;

/// A source of inbound messages that choices can sign up with
pub trait InputSource: Send + Sync {
    /// Register `waiter` for `operation_id`. An already queued message may be
    /// delivered to it immediately.
    fn sign(&self, operation_id: &str, waiter: Arc<ChoiceInstance>);

    /// Withdraw a registration made by [`InputSource::sign`].
    fn cancel_waiting(&self, operation_id: &str, waiter: ChoiceId);

    /// Put back a message that was delivered to a choice which could not use it.
    fn restore(&self, message: Message);
}

/// Branch body run with the message that won the race
#[async_trait]
pub trait Continuation: Send + Sync {
    async fn resume(&self, ctx: &ExecutionContext, message: Message) -> ActivityResult;
}

/// Continuation that ignores the message and runs an activity
pub struct RunActivity(pub ActivityRef);

#[async_trait]
impl Continuation for RunActivity {
    async fn resume(&self, ctx: &ExecutionContext, _message: Message) -> ActivityResult {
        self.0.run(ctx).await
    }
}

/// Result of arming a choice
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// The branch for `operation_id` ran to completion
    Won { operation_id: String },
    /// The session was killed (or the source closed) before any delivery
    Cancelled,
}

pub(crate) enum RaceOutcome {
    Won {
        operation_id: String,
        message: Message,
    },
    Killed,
    Closed,
}

/// Withdraws every registration of an instance when dropped, including on
/// early return or when the arming future itself is dropped.
struct Registration<'a> {
    source: &'a Arc<dyn InputSource>,
    instance: Arc<ChoiceInstance>,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.instance.cancel();
        for operation_id in self.instance.operations() {
            self.source.cancel_waiting(operation_id, self.instance.id());
        }
    }
}

/// Race `operations` on `source` until one delivers, `kill` fires, or the
/// source closes.
pub(crate) async fn race(
    source: &Arc<dyn InputSource>,
    operations: Vec<String>,
    kill: Option<&KillSwitch>,
) -> RaceOutcome {
    let (instance, mut rx) = ChoiceInstance::new(operations);
    instance.arm();
    let _registration = Registration {
        source,
        instance: instance.clone(),
    };

    for operation_id in instance.operations() {
        source.sign(operation_id, instance.clone());
        if !instance.is_armed() {
            break;
        }
    }

    let killed = async {
        match kill {
            Some(kill) => kill.killed().await,
            None => std::future::pending().await,
        }
    };

    let received = tokio::select! {
        biased;
        received = &mut rx => received.ok(),
        _ = killed => None,
    };

    match received {
        Some(message) => {
            let operation_id = message.operation_id.clone();
            RaceOutcome::Won {
                operation_id,
                message,
            }
        }
        None if kill.map(KillSwitch::is_killed).unwrap_or(false) => {
            if !instance.cancel() {
                // A delivery won the race against the kill; hand it back.
                if let Ok(message) = rx.try_recv() {
                    source.restore(message);
                }
            }
            RaceOutcome::Killed
        }
        None => RaceOutcome::Closed,
    }
}

struct Branch {
    operation_id: String,
    continuation: Arc<dyn Continuation>,
}

/// Non-deterministic choice among inbound operations
#[derive(Default)]
pub struct Choice {
    branches: Vec<Branch>,
}

impl Choice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a branch. A second branch for the same operation replaces the first.
    pub fn on(
        self,
        operation_id: impl Into<String>,
        continuation: impl Continuation + 'static,
    ) -> Self {
        self.on_arc(operation_id, Arc::new(continuation))
    }

    pub fn on_arc(
        mut self,
        operation_id: impl Into<String>,
        continuation: Arc<dyn Continuation>,
    ) -> Self {
        let operation_id = operation_id.into();
        self.branches.retain(|b| b.operation_id != operation_id);
        self.branches.push(Branch {
            operation_id,
            continuation,
        });
        self
    }

    pub fn operations(&self) -> impl Iterator<Item = &str> {
        self.branches.iter().map(|b| b.operation_id.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    /// Arm the choice on the session's input source and run the winning branch.
    pub async fn arm(&self, ctx: &ExecutionContext) -> ActivityResult<Selection> {
        if self.branches.is_empty() {
            return Err(EngineError::EmptyChoice.into());
        }
        if ctx.is_killed() {
            return Ok(Selection::Cancelled);
        }

        let operations = self.operations().map(str::to_string).collect();
        let (operation_id, message) =
            match race(ctx.input_source(), operations, Some(ctx.kill_switch())).await {
                RaceOutcome::Won {
                    operation_id,
                    message,
                } => (operation_id, message),
                RaceOutcome::Killed | RaceOutcome::Closed => {
                    tracing::debug!(session_id = %ctx.session_id(), "choice cancelled");
                    return Ok(Selection::Cancelled);
                }
            };

        tracing::debug!(
            session_id = %ctx.session_id(),
            operation = %operation_id,
            correlation_id = ?message.correlation_id,
            "choice resolved"
        );

        let Some(branch) = self
            .branches
            .iter()
            .find(|b| b.operation_id == operation_id)
        else {
            // The instance only accepts registered operations.
            return Ok(Selection::Cancelled);
        };
        branch.continuation.resume(ctx, message).await?;
        Ok(Selection::Won { operation_id })
    }
}

#[async_trait]
impl Activity for Choice {
    async fn run(&self, ctx: &ExecutionContext) -> ActivityResult {
        match self.arm(ctx).await? {
            Selection::Won { .. } => Ok(()),
            Selection::Cancelled => ctx.checkpoint(),
        }
    }
}
