//! KillSwitch - cooperative termination signal
//!
//! Every execution context owns one switch. Killing is a request, not a
//! preemption: suspension points race their wait against [`KillSwitch::killed`]
//! and checkpoints poll [`KillSwitch::is_killed`]. A compensation that handles
//! the kill clears the switch, which swaps in a fresh cancellation token so
//! later waits block again.

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::types::Fault;

struct KillState {
    token: CancellationToken,
    killed: bool,
    killer: Option<Fault>,
}

impl KillState {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            killed: false,
            killer: None,
        }
    }
}

/// Per-context kill flag with async notification
pub struct KillSwitch {
    state: Mutex<KillState>,
}

impl KillSwitch {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(KillState::new()),
        }
    }

    /// Request termination, optionally recording the fault that caused it.
    ///
    /// Killing an already killed switch keeps the first killer fault.
    pub fn kill(&self, killer: Option<Fault>) {
        let mut state = self.state.lock();
        if !state.killed {
            state.killed = true;
            state.killer = killer;
        }
        state.token.cancel();
    }

    pub fn is_killed(&self) -> bool {
        self.state.lock().killed
    }

    pub fn killer_fault(&self) -> Option<Fault> {
        self.state.lock().killer.clone()
    }

    /// Clear the kill and return the killer fault that was recorded
    pub fn clear(&self) -> Option<Fault> {
        let mut state = self.state.lock();
        let killer = state.killer.take();
        if state.killed {
            state.killed = false;
            state.token = CancellationToken::new();
        }
        killer
    }

    /// Resolves once the switch is killed.
    pub async fn killed(&self) {
        let token = self.state.lock().token.clone();
        token.cancelled().await
    }
}

impl Default for KillSwitch {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for KillSwitch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("KillSwitch")
            .field("killed", &state.killed)
            .field("killer", &state.killer)
            .finish()
    }
}
