//! Scope frames and the per-context frame stack

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::activity::ActivityRef;
use crate::types::{Fault, DEFAULT_HANDLER_NAME};

/// One entry of the scope stack
///
/// Compensations are keyed by the id of the scope that installed them. A
/// frame's own compensation lives under its own id; compensations merged in
/// from completed inner scopes keep their original ids.
pub struct ScopeFrame {
    id: String,
    fault_handlers: HashMap<String, ActivityRef>,
    compensations: HashMap<String, ActivityRef>,
    bindings: Map<String, Value>,
    active_fault: Option<Fault>,
}

impl ScopeFrame {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fault_handlers: HashMap::new(),
            compensations: HashMap::new(),
            bindings: Map::new(),
            active_fault: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn install_fault_handler(&mut self, fault_name: impl Into<String>, handler: ActivityRef) {
        self.fault_handlers.insert(fault_name.into(), handler);
    }

    /// Install the frame's own compensation, replacing any previous one
    pub fn install_compensation(&mut self, compensation: ActivityRef) {
        self.compensations.insert(self.id.clone(), compensation);
    }

    pub fn has_fault_handler(&self, fault_name: &str) -> bool {
        self.fault_handlers.contains_key(fault_name)
    }

    /// Take the handler for `fault_name`, falling back to the `default`
    /// handler. A successful take uninstalls every handler of this frame.
    pub fn take_fault_handler(&mut self, fault_name: &str) -> Option<ActivityRef> {
        let handler = self
            .fault_handlers
            .get(fault_name)
            .or_else(|| self.fault_handlers.get(DEFAULT_HANDLER_NAME))
            .cloned()?;
        self.fault_handlers.clear();
        Some(handler)
    }

    /// The compensation installed by this frame, left in place
    pub fn own_compensation(&self) -> Option<ActivityRef> {
        self.compensations.get(&self.id).cloned()
    }

    /// Remove and return the compensation stored under `scope_id`
    pub fn take_compensation(&mut self, scope_id: &str) -> Option<ActivityRef> {
        self.compensations.remove(scope_id)
    }

    /// Adopt every compensation of a popped inner frame
    pub fn merge_compensations(&mut self, inner: ScopeFrame) {
        self.compensations.extend(inner.compensations);
    }

    /// Record a caught fault: `name -> payload` and `default -> name`
    pub fn bind_fault(&mut self, fault: &Fault) {
        self.bindings
            .insert(fault.name().to_string(), fault.payload().clone());
        self.bindings.insert(
            DEFAULT_HANDLER_NAME.to_string(),
            Value::String(fault.name().to_string()),
        );
    }

    pub fn binding(&self, name: &str) -> Option<&Value> {
        self.bindings.get(name)
    }

    pub fn active_fault(&self) -> Option<&Fault> {
        self.active_fault.as_ref()
    }

    /// Set the fault being handled in this frame, returning the previous one
    pub fn set_active_fault(&mut self, fault: Option<Fault>) -> Option<Fault> {
        std::mem::replace(&mut self.active_fault, fault)
    }
}

impl std::fmt::Debug for ScopeFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut handlers: Vec<_> = self.fault_handlers.keys().collect();
        handlers.sort();
        let mut compensations: Vec<_> = self.compensations.keys().collect();
        compensations.sort();
        f.debug_struct("ScopeFrame")
            .field("id", &self.id)
            .field("fault_handlers", &handlers)
            .field("compensations", &compensations)
            .field("active_fault", &self.active_fault)
            .finish()
    }
}

/// Stack of frames owned by one execution context, innermost last
#[derive(Debug, Default)]
pub struct ScopeStack {
    frames: Vec<ScopeFrame>,
}

impl ScopeStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, id: impl Into<String>) {
        self.frames.push(ScopeFrame::new(id));
    }

    pub fn pop(&mut self) -> Option<ScopeFrame> {
        self.frames.pop()
    }

    pub fn current(&self) -> Option<&ScopeFrame> {
        self.frames.last()
    }

    pub fn current_mut(&mut self) -> Option<&mut ScopeFrame> {
        self.frames.last_mut()
    }

    /// Frame ids from outermost to innermost
    pub fn ids(&self) -> Vec<String> {
        self.frames.iter().map(|frame| frame.id.clone()).collect()
    }

    /// Innermost frame currently handling a fault
    pub fn handled_fault(&self) -> Option<&Fault> {
        self.frames.iter().rev().find_map(ScopeFrame::active_fault)
    }

    /// Innermost binding named `name`
    pub fn binding(&self, name: &str) -> Option<&Value> {
        self.frames.iter().rev().find_map(|frame| frame.binding(name))
    }
}
