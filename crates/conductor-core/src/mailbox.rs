//! Mailbox - per-session inbound queues
//!
//! Messages routed to a session land here. Each operation has a FIFO queue
//! and a list of registered choice waiters:
//! - a message with a waiting choice is offered to the waiters in order
//! - a message nobody accepts is queued, never dropped
//! - a waiter signing up for an operation with a queued message consumes it

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::choice::{ChoiceId, ChoiceInstance, InputSource};
use crate::types::Message;

#[derive(Default)]
struct MailboxInner {
    queues: HashMap<String, VecDeque<Message>>,
    waiters: HashMap<String, Vec<Arc<ChoiceInstance>>>,
    closed: bool,
}

impl MailboxInner {
    /// Offer a message to the waiters of its operation; hand it back if none accepts.
    fn offer(&mut self, message: Message) -> Option<Message> {
        let operation_id = message.operation_id.clone();
        if let Some(waiters) = self.waiters.get_mut(&operation_id) {
            while !waiters.is_empty() {
                let waiter = waiters.remove(0);
                if waiter.deliver(&operation_id, &message) {
                    return None;
                }
            }
        }
        Some(message)
    }
}

/// Inbound message store of one session
#[derive(Default)]
pub struct Mailbox {
    inner: Mutex<MailboxInner>,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route a message into the mailbox. Returns false once the mailbox is closed.
    pub fn push(&self, message: Message) -> bool {
        self.try_push(message).is_ok()
    }

    /// Like [`Mailbox::push`], handing the message back when the mailbox is closed
    pub fn try_push(&self, message: Message) -> Result<(), Message> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(message);
        }
        if let Some(message) = inner.offer(message) {
            inner
                .queues
                .entry(message.operation_id.clone())
                .or_default()
                .push_back(message);
        }
        Ok(())
    }

    /// Number of queued messages for an operation
    pub fn pending(&self, operation_id: &str) -> usize {
        self.inner
            .lock()
            .queues
            .get(operation_id)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    /// Number of choices currently waiting on an operation
    pub fn waiting(&self, operation_id: &str) -> usize {
        self.inner
            .lock()
            .waiters
            .get(operation_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Close the mailbox, cancel every waiter and return the unconsumed messages.
    pub fn close(&self) -> Vec<Message> {
        let mut inner = self.inner.lock();
        inner.closed = true;
        for waiter in inner.waiters.drain().flat_map(|(_, waiters)| waiters) {
            waiter.cancel();
        }
        inner
            .queues
            .drain()
            .flat_map(|(_, queue)| queue)
            .collect()
    }
}

impl InputSource for Mailbox {
    fn sign(&self, operation_id: &str, waiter: Arc<ChoiceInstance>) {
        let mut inner = self.inner.lock();
        if inner.closed {
            waiter.cancel();
            return;
        }
        if let Some(queue) = inner.queues.get_mut(operation_id) {
            if let Some(front) = queue.front() {
                if waiter.deliver(operation_id, front) {
                    queue.pop_front();
                    return;
                }
            }
        }
        if waiter.is_armed() {
            inner
                .waiters
                .entry(operation_id.to_string())
                .or_default()
                .push(waiter);
        }
    }

    fn cancel_waiting(&self, operation_id: &str, waiter: ChoiceId) {
        let mut inner = self.inner.lock();
        if let Some(waiters) = inner.waiters.get_mut(operation_id) {
            waiters.retain(|w| w.id() != waiter);
            if waiters.is_empty() {
                inner.waiters.remove(operation_id);
            }
        }
    }

    fn restore(&self, message: Message) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        if let Some(message) = inner.offer(message) {
            inner
                .queues
                .entry(message.operation_id.clone())
                .or_default()
                .push_front(message);
        }
    }
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Mailbox")
            .field("queued", &inner.queues.values().map(VecDeque::len).sum::<usize>())
            .field("waiters", &inner.waiters.values().map(Vec::len).sum::<usize>())
            .field("closed", &inner.closed)
            .finish()
    }
}
