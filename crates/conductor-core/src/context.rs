//! Execution context
//!
//! Each session body runs against an [`ExecutionContext`]. A context owns a
//! scope stack and a kill switch, and shares the session's link to the
//! message substrate. Parallel branches run on forked child contexts: a
//! child has its own stack and kill switch, and while its stack is empty
//! installs, compensation lookups and merges go to the parent.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::activity::ActivityRef;
use crate::choice::{race, InputSource, RaceOutcome};
use crate::error::{ActivityResult, Interrupt};
use crate::kill::KillSwitch;
use crate::scope::{ScopeFrame, ScopeStack};
use crate::substrate::{Outbound, SessionPort, SubstrateError};
use crate::types::{Fault, Message, SessionId};

/// Name of the frame every session body runs on
pub const ROOT_SCOPE_ID: &str = "main";

/// Session-wide state shared by a context and all of its forks
#[derive(Debug)]
pub struct SessionLink {
    session_id: SessionId,
    start_message: Option<Message>,
    port: SessionPort,
}

impl SessionLink {
    pub fn new(session_id: SessionId, start_message: Option<Message>, port: SessionPort) -> Self {
        Self {
            session_id,
            start_message,
            port,
        }
    }
}

struct ContextInner {
    session: Arc<SessionLink>,
    scopes: Mutex<ScopeStack>,
    parent: Option<ExecutionContext>,
    kill: KillSwitch,
    replaced: Mutex<Vec<ActivityRef>>,
}

/// Handle to one execution context; cloning shares the same context
#[derive(Clone)]
pub struct ExecutionContext {
    inner: Arc<ContextInner>,
}

impl ExecutionContext {
    /// Root context of a session, positioned on the `main` frame
    pub fn new(session: SessionLink) -> Self {
        let mut scopes = ScopeStack::new();
        scopes.push(ROOT_SCOPE_ID);
        Self {
            inner: Arc::new(ContextInner {
                session: Arc::new(session),
                scopes: Mutex::new(scopes),
                parent: None,
                kill: KillSwitch::new(),
                replaced: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Root context with a private mailbox and no outbound transport
    pub fn detached() -> Self {
        Self::new(SessionLink::new(
            SessionId::generate(),
            None,
            SessionPort::detached(),
        ))
    }

    /// Child context for a parallel branch
    pub(crate) fn fork(&self) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                session: self.inner.session.clone(),
                scopes: Mutex::new(ScopeStack::new()),
                parent: Some(self.clone()),
                kill: KillSwitch::new(),
                replaced: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.inner.session.session_id
    }

    /// The message that started this session, if any
    pub fn start_message(&self) -> Option<&Message> {
        self.inner.session.start_message.as_ref()
    }

    pub fn input_source(&self) -> &Arc<dyn InputSource> {
        self.inner.session.port.input()
    }

    pub fn outbound(&self) -> &Arc<dyn Outbound> {
        self.inner.session.port.outbound()
    }

    pub fn kill_switch(&self) -> &KillSwitch {
        &self.inner.kill
    }

    pub fn parent(&self) -> Option<&ExecutionContext> {
        self.inner.parent.as_ref()
    }

    // ---- kill ----

    /// Request cooperative termination of this context
    pub fn kill(&self, killer: Option<Fault>) {
        self.inner.kill.kill(killer);
    }

    pub fn is_killed(&self) -> bool {
        self.inner.kill.is_killed()
    }

    pub fn killer_fault(&self) -> Option<Fault> {
        self.inner.kill.killer_fault()
    }

    /// Resolves once this context is killed
    pub async fn killed(&self) {
        self.inner.kill.killed().await
    }

    pub fn clear_kill(&self) -> Option<Fault> {
        self.inner.kill.clear()
    }

    /// `Err(Killed)` once the context is killed
    pub fn checkpoint(&self) -> ActivityResult {
        if self.is_killed() {
            Err(Interrupt::Killed)
        } else {
            Ok(())
        }
    }

    // ---- messaging ----

    /// Wait for the next message addressed to `operation_id`.
    ///
    /// A kill while waiting returns `Err(Killed)`; a closed source raises an
    /// `IOException` fault.
    pub async fn receive(&self, operation_id: &str) -> ActivityResult<Message> {
        self.checkpoint()?;
        match race(
            self.input_source(),
            vec![operation_id.to_string()],
            Some(self.kill_switch()),
        )
        .await
        {
            RaceOutcome::Won { message, .. } => Ok(message),
            RaceOutcome::Killed => Err(Interrupt::Killed),
            RaceOutcome::Closed => Err(Fault::from(SubstrateError::Closed).into()),
        }
    }

    /// Send a message; transport failures surface as `IOException` faults
    pub async fn send(&self, message: Message) -> ActivityResult {
        self.outbound()
            .send(message)
            .await
            .map_err(|error| Interrupt::Fault(error.into()))
    }

    /// Send a response carrying the operation and correlation id of `request`
    pub async fn reply(&self, request: &Message, payload: serde_json::Value) -> ActivityResult {
        self.send(Message::response_to(request, payload)).await
    }

    // ---- scope stack primitives ----

    pub(crate) fn push_scope(&self, id: impl Into<String>) {
        self.inner.scopes.lock().push(id);
    }

    /// Pop the innermost own frame, merging its compensations outward
    pub(crate) fn pop_scope(&self, merge: bool) {
        let popped = {
            let mut scopes = self.inner.scopes.lock();
            let popped = scopes.pop();
            match popped {
                Some(frame) if merge => match scopes.current_mut() {
                    Some(outer) => {
                        outer.merge_compensations(frame);
                        None
                    }
                    None => Some(frame),
                },
                _ => None,
            }
        };
        // Own stack drained: the enclosing frame lives in the parent.
        if let (Some(frame), Some(parent)) = (popped, self.parent()) {
            parent.with_frame(|outer| outer.merge_compensations(frame));
        }
    }

    /// Run `f` on the innermost frame, delegating to the parent while the
    /// own stack is empty.
    pub(crate) fn with_frame<R>(&self, f: impl FnOnce(&mut ScopeFrame) -> R) -> Option<R> {
        {
            let mut scopes = self.inner.scopes.lock();
            if let Some(frame) = scopes.current_mut() {
                return Some(f(frame));
            }
        }
        self.parent().and_then(|parent| parent.with_frame(f))
    }

    /// First result of `f` over this context's stack and then its ancestors'
    pub(crate) fn find_in_stacks<R>(&self, f: impl Fn(&ScopeStack) -> Option<R>) -> Option<R> {
        let mut current = Some(self);
        while let Some(ctx) = current {
            if let Some(found) = f(&ctx.inner.scopes.lock()) {
                return Some(found);
            }
            current = ctx.parent();
        }
        None
    }

    pub(crate) fn push_replaced_compensation(&self, previous: ActivityRef) {
        self.inner.replaced.lock().push(previous);
    }

    pub(crate) fn pop_replaced_compensation(&self) {
        self.inner.replaced.lock().pop();
    }

    /// Pop the compensation replaced by the one currently running, together
    /// with the context whose chain held it
    pub(crate) fn take_replaced_compensation(&self) -> Option<(ExecutionContext, ActivityRef)> {
        let mut current = Some(self);
        while let Some(ctx) = current {
            if let Some(previous) = ctx.inner.replaced.lock().pop() {
                return Some((ctx.clone(), previous));
            }
            current = ctx.parent();
        }
        None
    }

    /// Frame ids of this context, outermost first
    pub fn scope_ids(&self) -> Vec<String> {
        self.inner.scopes.lock().ids()
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("session_id", self.session_id())
            .field("scopes", &self.scope_ids())
            .field("killed", &self.is_killed())
            .field("forked", &self.inner.parent.is_some())
            .finish()
    }
}
