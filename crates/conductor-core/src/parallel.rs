//! Parallel / Kill Coordinator
//!
//! Branches of a [`Parallel`] run concurrently inside the session's task,
//! each on a forked context with its own kill switch. The first fault kills
//! every still running killable sibling; the join waits for all of them to
//! stop before the fault is propagated.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{FuturesUnordered, StreamExt};

use crate::activity::{Activity, ActivityRef};
use crate::context::ExecutionContext;
use crate::error::{ActivityResult, EngineError, Interrupt};
use crate::types::Fault;

/// Fixed group of concurrently running branches
#[derive(Default, Clone)]
pub struct Parallel {
    branches: Vec<ActivityRef>,
}

impl Parallel {
    pub fn new(branches: Vec<ActivityRef>) -> Self {
        Self { branches }
    }

    pub fn branch(mut self, activity: impl Activity + 'static) -> Self {
        self.branches.push(Arc::new(activity));
        self
    }

    pub fn len(&self) -> usize {
        self.branches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    /// Run every branch and join.
    ///
    /// Outcome precedence at the join: a fatal engine error, then the first
    /// fault, then the parent's own kill state.
    pub async fn run_all(&self, ctx: &ExecutionContext) -> ActivityResult {
        if self.branches.is_empty() {
            return ctx.checkpoint();
        }

        let killable = self.is_killable();
        let children: Vec<ExecutionContext> = self.branches.iter().map(|_| ctx.fork()).collect();
        let mut running: FuturesUnordered<_> = self
            .branches
            .iter()
            .zip(children.iter())
            .enumerate()
            .map(|(index, (branch, child))| async move { (index, branch.run(child).await) })
            .collect();

        let mut finished = vec![false; self.branches.len()];
        let mut first_fault: Option<Fault> = None;
        let mut fatal: Option<EngineError> = None;
        let mut kill_forwarded = false;

        loop {
            tokio::select! {
                biased;
                next = running.next() => {
                    let Some((index, result)) = next else {
                        break;
                    };
                    finished[index] = true;
                    match result {
                        Ok(()) | Err(Interrupt::Killed) => {}
                        Err(Interrupt::Fault(fault)) => {
                            if first_fault.is_none() && fatal.is_none() {
                                tracing::debug!(
                                    session_id = %ctx.session_id(),
                                    fault = %fault.name(),
                                    branch = index,
                                    "parallel branch faulted, killing siblings"
                                );
                                self.kill_running(&children, &finished, Some(fault.clone()));
                                first_fault = Some(fault);
                            }
                        }
                        Err(Interrupt::Fatal(error)) => {
                            if fatal.is_none() {
                                self.kill_running(&children, &finished, None);
                                fatal = Some(error);
                            }
                        }
                    }
                }
                _ = ctx.killed(), if killable && !kill_forwarded => {
                    kill_forwarded = true;
                    let killer = ctx.killer_fault();
                    for (child, done) in children.iter().zip(finished.iter()) {
                        if !done {
                            child.kill(killer.clone());
                        }
                    }
                }
            }
        }

        if let Some(error) = fatal {
            return Err(Interrupt::Fatal(error));
        }
        if let Some(fault) = first_fault {
            return Err(Interrupt::Fault(fault));
        }
        ctx.checkpoint()
    }

    fn kill_running(&self, children: &[ExecutionContext], finished: &[bool], killer: Option<Fault>) {
        for ((child, branch), done) in children.iter().zip(&self.branches).zip(finished) {
            if !done && branch.is_killable() {
                child.kill(killer.clone());
            }
        }
    }
}

#[async_trait]
impl Activity for Parallel {
    async fn run(&self, ctx: &ExecutionContext) -> ActivityResult {
        self.run_all(ctx).await
    }

    fn is_killable(&self) -> bool {
        self.branches.iter().all(|branch| branch.is_killable())
    }
}
