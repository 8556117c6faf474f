//! Scope resolution on top of [`ExecutionContext`]

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::activity::{Activity, ActivityRef, HandlerKind, Noop};
use crate::context::ExecutionContext;
use crate::error::{ActivityResult, EngineError, Interrupt};
use crate::types::Fault;

struct ScopeExit {
    /// Whether the frame's compensations survive the pop
    merge: bool,
    result: ActivityResult,
}

impl ScopeExit {
    fn completed(result: ActivityResult) -> Self {
        Self {
            merge: true,
            result,
        }
    }

    fn discarded(result: ActivityResult) -> Self {
        Self {
            merge: false,
            result,
        }
    }
}

/// A compensation installed over an earlier one of the same frame
struct Chained {
    previous: ActivityRef,
    body: ActivityRef,
}

#[async_trait]
impl Activity for Chained {
    async fn run(&self, ctx: &ExecutionContext) -> ActivityResult {
        ctx.push_replaced_compensation(self.previous.clone());
        let result = self.body.run(ctx).await;
        ctx.pop_replaced_compensation();
        result
    }

    fn is_killable(&self) -> bool {
        self.body.is_killable()
    }
}

impl ExecutionContext {
    /// Register a fault handler or the compensation on the innermost frame
    pub fn install(&self, kind: HandlerKind, activity: ActivityRef) {
        match kind {
            HandlerKind::Fault(name) => self.install_fault_handler(name, activity),
            HandlerKind::Compensation => self.install_compensation(activity),
        }
    }

    pub fn install_fault_handler(&self, fault_name: impl Into<String>, handler: ActivityRef) {
        let fault_name = fault_name.into();
        self.with_frame(move |frame| frame.install_fault_handler(fault_name, handler));
    }

    /// Install the innermost frame's compensation. The one it replaces stays
    /// reachable from the new one through [`CurrentHandler`](crate::activity::CurrentHandler).
    pub fn install_compensation(&self, compensation: ActivityRef) {
        self.with_frame(move |frame| {
            let compensation = match frame.own_compensation() {
                Some(previous) => Arc::new(Chained {
                    previous,
                    body: compensation,
                }),
                None => compensation,
            };
            frame.install_compensation(compensation);
        });
    }

    /// Id of the innermost frame
    pub fn current_scope_id(&self) -> Option<String> {
        self.with_frame(|frame| frame.id().to_string())
    }

    /// Value bound by a caught fault: the fault name yields its payload,
    /// `default` yields the name of the last caught fault.
    pub fn scope_binding(&self, name: &str) -> Option<Value> {
        self.find_in_stacks(|stack| stack.binding(name).cloned())
    }

    /// Fault being handled by the innermost active handler
    pub fn handled_fault(&self) -> Option<Fault> {
        self.find_in_stacks(|stack| stack.handled_fault().cloned())
    }

    /// Re-raise the handled fault, optionally renamed and/or with a new payload.
    pub fn rethrow(&self, name: Option<&str>, payload: Option<Value>) -> ActivityResult {
        let mut fault = self
            .handled_fault()
            .ok_or(Interrupt::Fatal(EngineError::NoActiveFault))?;
        if let Some(name) = name {
            fault = fault.renamed(name);
        }
        if let Some(payload) = payload {
            fault = fault.with_payload(payload);
        }
        Err(Interrupt::Fault(fault))
    }

    /// Run `body` in a new frame `id` and resolve its exit.
    pub async fn run_scoped(&self, id: impl Into<String>, body: ActivityRef) -> ActivityResult {
        self.push_scope(id);
        let exit = self.run_in_frame(body).await;
        self.pop_scope(exit.merge);
        exit.result
    }

    /// Run a session body on the root frame; its handlers get one chance at
    /// any fault escaping the body.
    pub async fn run_root(&self, body: ActivityRef) -> ActivityResult {
        self.run_in_frame(body).await.result
    }

    /// Run and remove the compensation a completed scope left in the current frame
    pub async fn compensate(&self, scope_id: &str) -> ActivityResult {
        let compensation = self
            .with_frame(|frame| frame.take_compensation(scope_id))
            .flatten();
        match compensation {
            Some(compensation) => {
                tracing::debug!(
                    session_id = %self.session_id(),
                    scope_id = %scope_id,
                    "running compensation"
                );
                compensation.run(self).await
            }
            None => Ok(()),
        }
    }

    /// Inside a compensation, run the compensation it replaced. Elsewhere run
    /// the one installed for the innermost frame, leaving it installed.
    pub async fn current_compensation(&self) -> ActivityResult {
        if let Some((owner, previous)) = self.take_replaced_compensation() {
            let result = previous.run(self).await;
            owner.push_replaced_compensation(previous);
            return result;
        }
        match self.with_frame(|frame| frame.own_compensation()).flatten() {
            Some(compensation) => {
                // Nothing was replaced below the compensation itself.
                self.push_replaced_compensation(Arc::new(Noop));
                let result = compensation.run(self).await;
                self.pop_replaced_compensation();
                result
            }
            None => Ok(()),
        }
    }

    fn run_in_frame(&self, body: ActivityRef) -> BoxFuture<'_, ScopeExit> {
        Box::pin(async move {
            match body.run(self).await {
                Ok(()) if self.is_killed() => self.handle_termination().await,
                Ok(()) => ScopeExit::completed(Ok(())),
                Err(Interrupt::Killed) => self.handle_termination().await,
                Err(Interrupt::Fault(fault)) => self.handle_fault(fault).await,
                Err(fatal @ Interrupt::Fatal(_)) => ScopeExit::discarded(Err(fatal)),
            }
        })
    }

    async fn handle_fault(&self, fault: Fault) -> ScopeExit {
        let handler = self
            .with_frame(|frame| frame.take_fault_handler(fault.name()))
            .flatten();
        let Some(handler) = handler else {
            return ScopeExit::completed(Err(Interrupt::Fault(fault)));
        };

        let scope_id = self.current_scope_id().unwrap_or_default();
        let previous = self
            .with_frame(|frame| {
                frame.bind_fault(&fault);
                frame.set_active_fault(Some(fault.clone()))
            })
            .flatten();

        tracing::info!(
            session_id = %self.session_id(),
            scope_id = %scope_id,
            fault = %fault.name(),
            "fault handler started"
        );
        let exit = self.run_in_frame(handler).await;
        tracing::info!(
            session_id = %self.session_id(),
            scope_id = %scope_id,
            fault = %fault.name(),
            ok = exit.result.is_ok(),
            "fault handler finished"
        );

        self.with_frame(|frame| frame.set_active_fault(previous));
        exit
    }

    async fn handle_termination(&self) -> ScopeExit {
        let Some(scope_id) = self.current_scope_id() else {
            return ScopeExit::discarded(Err(Interrupt::Killed));
        };
        let compensation = self
            .with_frame(|frame| frame.take_compensation(&scope_id))
            .flatten();
        let Some(compensation) = compensation else {
            return ScopeExit::discarded(Err(Interrupt::Killed));
        };

        let killer = self.clear_kill();
        tracing::debug!(
            session_id = %self.session_id(),
            scope_id = %scope_id,
            killer = ?killer.as_ref().map(Fault::name),
            "termination handler started"
        );
        let exit = self.run_in_frame(compensation).await;
        match exit.result {
            Err(fatal @ Interrupt::Fatal(_)) => return ScopeExit::discarded(Err(fatal)),
            Err(Interrupt::Fault(fault)) => {
                tracing::warn!(
                    session_id = %self.session_id(),
                    scope_id = %scope_id,
                    fault = %fault.name(),
                    "fault escaped termination handler"
                );
            }
            Ok(()) | Err(Interrupt::Killed) => {}
        }
        tracing::debug!(
            session_id = %self.session_id(),
            scope_id = %scope_id,
            "termination handler finished"
        );
        // Termination keeps propagating to the enclosing frames.
        self.kill(killer);
        ScopeExit::discarded(Err(Interrupt::Killed))
    }
}
