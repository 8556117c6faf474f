//! ChoiceInstance - single-winner state machine
//!
//! `Idle -> Armed -> {Won, Cancelled}`. The transition to `Won` happens under
//! the instance lock together with handing the message to the waiting
//! session, so concurrent deliveries from several sources resolve to exactly
//! one winner.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::types::Message;

static NEXT_CHOICE_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of one in-flight choice
pub type ChoiceId = u64;

/// Choice lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChoiceState {
    /// Created, not yet registered with any source
    Idle,
    /// Registered and waiting for the first delivery
    Armed,
    /// Resolved by a delivery on the given operation
    Won(String),
    /// Abandoned (killed session or closed source)
    Cancelled,
}

impl ChoiceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChoiceState::Won(_) | ChoiceState::Cancelled)
    }
}

struct ChoiceInner {
    state: ChoiceState,
    winner: Option<oneshot::Sender<Message>>,
}

/// One armed race among several inbound operations
pub struct ChoiceInstance {
    id: ChoiceId,
    operations: Vec<String>,
    inner: Mutex<ChoiceInner>,
}

impl ChoiceInstance {
    /// Create an idle instance and the receiver the winning message lands in
    pub fn new(operations: Vec<String>) -> (Arc<Self>, oneshot::Receiver<Message>) {
        let (tx, rx) = oneshot::channel();
        let instance = Arc::new(Self {
            id: NEXT_CHOICE_ID.fetch_add(1, Ordering::Relaxed),
            operations,
            inner: Mutex::new(ChoiceInner {
                state: ChoiceState::Idle,
                winner: Some(tx),
            }),
        });
        (instance, rx)
    }

    pub fn id(&self) -> ChoiceId {
        self.id
    }

    pub fn operations(&self) -> &[String] {
        &self.operations
    }

    pub fn state(&self) -> ChoiceState {
        self.inner.lock().state.clone()
    }

    pub fn is_armed(&self) -> bool {
        self.inner.lock().state == ChoiceState::Armed
    }

    /// `Idle -> Armed`; returns false from any other state
    pub fn arm(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != ChoiceState::Idle {
            return false;
        }
        inner.state = ChoiceState::Armed;
        true
    }

    /// Offer `message` for `operation_id`.
    ///
    /// Returns true only for the single delivery that moves the instance from
    /// `Armed` to `Won`. A rejected message stays with the caller.
    pub fn deliver(&self, operation_id: &str, message: &Message) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != ChoiceState::Armed
            || !self.operations.iter().any(|op| op == operation_id)
        {
            return false;
        }
        let Some(winner) = inner.winner.take() else {
            return false;
        };
        if winner.send(message.clone()).is_err() {
            // The armed session went away without cancelling.
            inner.state = ChoiceState::Cancelled;
            return false;
        }
        inner.state = ChoiceState::Won(operation_id.to_string());
        true
    }

    /// Move to `Cancelled` unless a delivery already won.
    ///
    /// Dropping the winner sender wakes the armed session.
    pub fn cancel(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            ChoiceState::Won(_) => false,
            ChoiceState::Cancelled => true,
            ChoiceState::Idle | ChoiceState::Armed => {
                inner.state = ChoiceState::Cancelled;
                inner.winner = None;
                true
            }
        }
    }
}

impl std::fmt::Debug for ChoiceInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChoiceInstance")
            .field("id", &self.id)
            .field("operations", &self.operations)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Barrier;

    #[test]
    fn test_deliver_requires_armed_state() {
        let (instance, _rx) = ChoiceInstance::new(vec!["a".to_string()]);
        let message = Message::new("a", json!(null));
        assert!(!instance.deliver("a", &message));
        assert!(instance.arm());
        assert!(!instance.arm());
        assert!(instance.deliver("a", &message));
        assert_eq!(instance.state(), ChoiceState::Won("a".to_string()));
    }

    #[test]
    fn test_deliver_rejects_unregistered_operation() {
        let (instance, _rx) = ChoiceInstance::new(vec!["a".to_string()]);
        instance.arm();
        assert!(!instance.deliver("b", &Message::new("b", json!(null))));
        assert!(instance.is_armed());
    }

    #[test]
    fn test_exactly_one_concurrent_delivery_wins() {
        let operations: Vec<String> = (0..8).map(|i| format!("op{}", i)).collect();
        let (instance, mut rx) = ChoiceInstance::new(operations.clone());
        instance.arm();

        let barrier = Arc::new(Barrier::new(operations.len()));
        let handles: Vec<_> = operations
            .into_iter()
            .map(|op| {
                let instance = instance.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    instance.deliver(&op, &Message::new(op.clone(), json!(op)))
                })
            })
            .collect();

        let wins = handles
            .into_iter()
            .map(|h| h.join().expect("delivery thread"))
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);

        let message = rx.try_recv().expect("winning message");
        assert_eq!(
            instance.state(),
            ChoiceState::Won(message.operation_id.clone())
        );
    }

    #[test]
    fn test_cancel_after_win_is_refused() {
        let (instance, _rx) = ChoiceInstance::new(vec!["a".to_string()]);
        instance.arm();
        assert!(instance.deliver("a", &Message::new("a", json!(1))));
        assert!(!instance.cancel());
    }

    #[test]
    fn test_cancel_wakes_receiver() {
        let (instance, rx) = ChoiceInstance::new(vec!["a".to_string()]);
        instance.arm();
        assert!(instance.cancel());
        assert!(tokio_test::block_on(rx).is_err());
        assert!(!instance.deliver("a", &Message::new("a", json!(1))));
    }
}
