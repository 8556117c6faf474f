//! Built-in activity nodes

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::{Activity, ActivityRef};
use crate::context::ExecutionContext;
use crate::error::{ActivityResult, Interrupt};
use crate::types::Fault;

/// Does nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct Noop;

#[async_trait]
impl Activity for Noop {
    async fn run(&self, _ctx: &ExecutionContext) -> ActivityResult {
        Ok(())
    }
}

/// Runs children in order, stopping before the next killable child once the
/// context is killed.
#[derive(Default, Clone)]
pub struct Sequence {
    children: Vec<ActivityRef>,
}

impl Sequence {
    pub fn new(children: Vec<ActivityRef>) -> Self {
        Self { children }
    }

    pub fn then(mut self, child: impl Activity + 'static) -> Self {
        self.children.push(Arc::new(child));
        self
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

#[async_trait]
impl Activity for Sequence {
    async fn run(&self, ctx: &ExecutionContext) -> ActivityResult {
        for child in &self.children {
            if ctx.is_killed() && child.is_killable() {
                return Err(Interrupt::Killed);
            }
            child.run(ctx).await?;
        }
        Ok(())
    }

    /// A sequence stops at the next killable child, so it can be killed as
    /// long as one of its children can.
    fn is_killable(&self) -> bool {
        self.children.iter().any(|child| child.is_killable())
    }
}

/// Runs `body` inside a new scope frame named `id`
#[derive(Clone)]
pub struct Scope {
    id: String,
    body: ActivityRef,
}

impl Scope {
    pub fn new(id: impl Into<String>, body: impl Activity + 'static) -> Self {
        Self::from_ref(id, Arc::new(body))
    }

    pub fn from_ref(id: impl Into<String>, body: ActivityRef) -> Self {
        Self {
            id: id.into(),
            body,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

#[async_trait]
impl Activity for Scope {
    async fn run(&self, ctx: &ExecutionContext) -> ActivityResult {
        ctx.run_scoped(self.id.clone(), self.body.clone()).await
    }

    fn is_killable(&self) -> bool {
        self.body.is_killable()
    }
}

/// What an [`Install`] entry registers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerKind {
    /// Fault handler keyed by fault name (`default` catches any name)
    Fault(String),
    /// Compensation of the current frame; replaces the previous one
    Compensation,
}

/// Installs fault handlers and/or a compensation on the current frame
#[derive(Default, Clone)]
pub struct Install {
    entries: Vec<(HandlerKind, ActivityRef)>,
}

impl Install {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fault(mut self, name: impl Into<String>, handler: impl Activity + 'static) -> Self {
        self.entries
            .push((HandlerKind::Fault(name.into()), Arc::new(handler)));
        self
    }

    pub fn compensation(mut self, compensation: impl Activity + 'static) -> Self {
        self.entries
            .push((HandlerKind::Compensation, Arc::new(compensation)));
        self
    }

    pub fn entry(mut self, kind: HandlerKind, activity: ActivityRef) -> Self {
        self.entries.push((kind, activity));
        self
    }
}

#[async_trait]
impl Activity for Install {
    async fn run(&self, ctx: &ExecutionContext) -> ActivityResult {
        for (kind, activity) in &self.entries {
            ctx.install(kind.clone(), activity.clone());
        }
        Ok(())
    }

    fn is_killable(&self) -> bool {
        false
    }
}

/// Raises a fault
#[derive(Debug, Clone)]
pub struct Throw(pub Fault);

impl Throw {
    pub fn named(name: impl Into<String>) -> Self {
        Self(Fault::named(name))
    }

    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self(Fault::new(name, payload))
    }
}

#[async_trait]
impl Activity for Throw {
    async fn run(&self, _ctx: &ExecutionContext) -> ActivityResult {
        Err(Interrupt::Fault(self.0.clone()))
    }
}

/// Re-raises the fault handled by the innermost active handler
#[derive(Debug, Default, Clone)]
pub struct Rethrow {
    pub name: Option<String>,
    pub payload: Option<Value>,
}

#[async_trait]
impl Activity for Rethrow {
    async fn run(&self, ctx: &ExecutionContext) -> ActivityResult {
        ctx.rethrow(self.name.as_deref(), self.payload.clone())
    }
}

/// Runs the compensation left behind by the completed scope `scope_id`
#[derive(Debug, Clone)]
pub struct Compensate(pub String);

impl Compensate {
    pub fn scope(scope_id: impl Into<String>) -> Self {
        Self(scope_id.into())
    }
}

#[async_trait]
impl Activity for Compensate {
    async fn run(&self, ctx: &ExecutionContext) -> ActivityResult {
        ctx.compensate(&self.0).await
    }

    fn is_killable(&self) -> bool {
        false
    }
}

/// Runs the compensation currently installed for the innermost frame
#[derive(Debug, Default, Clone, Copy)]
pub struct CurrentHandler;

#[async_trait]
impl Activity for CurrentHandler {
    async fn run(&self, ctx: &ExecutionContext) -> ActivityResult {
        ctx.current_compensation().await
    }

    fn is_killable(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Mark {
        label: &'static str,
        trace: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Activity for Mark {
        async fn run(&self, _ctx: &ExecutionContext) -> ActivityResult {
            self.trace.lock().push(self.label);
            Ok(())
        }
    }

    struct KillSelf;

    #[async_trait]
    impl Activity for KillSelf {
        async fn run(&self, ctx: &ExecutionContext) -> ActivityResult {
            ctx.kill(None);
            Ok(())
        }
    }

    fn mark(label: &'static str, trace: &Arc<Mutex<Vec<&'static str>>>) -> Mark {
        Mark {
            label,
            trace: trace.clone(),
        }
    }

    #[test]
    fn test_sequence_runs_in_order_and_stops_at_fault() {
        tokio_test::block_on(async {
            let ctx = ExecutionContext::detached();
            let trace = Arc::new(Mutex::new(Vec::new()));
            let body = Sequence::default()
                .then(mark("a", &trace))
                .then(Throw::named("boom"))
                .then(mark("b", &trace));

            let result = body.run(&ctx).await;
            assert_eq!(result.unwrap_err().fault().unwrap().name(), "boom");
            assert_eq!(*trace.lock(), vec!["a"]);
        });
    }

    #[test]
    fn test_sequence_skips_killable_children_after_kill() {
        tokio_test::block_on(async {
            let ctx = ExecutionContext::detached();
            let trace = Arc::new(Mutex::new(Vec::new()));
            let body = Sequence::default()
                .then(KillSelf)
                .then(Install::new().compensation(Noop))
                .then(mark("after", &trace));

            assert_eq!(body.run(&ctx).await, Err(Interrupt::Killed));
            assert!(trace.lock().is_empty());
        });
    }

    #[test]
    fn test_sequence_killable_when_any_child_is() {
        let killable = Sequence::default().then(Noop).then(Throw::named("x"));
        assert!(killable.is_killable());
        let saga = Scope::new(
            "s",
            Sequence::default()
                .then(Install::new().compensation(Noop))
                .then(Noop),
        );
        assert!(saga.is_killable());
        let guarded = Sequence::default()
            .then(Install::new())
            .then(CurrentHandler);
        assert!(!guarded.is_killable());
    }

    #[test]
    fn test_killed_sequence_still_runs_unkillable_children() {
        tokio_test::block_on(async {
            let ctx = ExecutionContext::detached();
            let trace = Arc::new(Mutex::new(Vec::new()));
            let body = Scope::new(
                "s",
                Sequence::default()
                    .then(KillSelf)
                    .then(Install::new().compensation(mark("compensated", &trace)))
                    .then(mark("after", &trace)),
            );

            assert_eq!(body.run(&ctx).await, Err(Interrupt::Killed));
            assert_eq!(*trace.lock(), vec!["compensated"]);
        });
    }
}
