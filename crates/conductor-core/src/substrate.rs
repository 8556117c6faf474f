//! Message substrate boundary
//!
//! The engine consumes two capabilities from the transport layer:
//! inbound delivery (through an [`InputSource`] such as the per-session
//! [`Mailbox`](crate::mailbox::Mailbox)) and outbound sending through
//! [`Outbound`]. [`SessionPort`] bundles both for one session.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;

use crate::choice::{race, InputSource, RaceOutcome};
use crate::mailbox::Mailbox;
use crate::types::{Fault, Message, IO_EXCEPTION};

/// Transport-level failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubstrateError {
    #[error("substrate closed")]
    Closed,

    #[error("send failed: {0}")]
    Send(String),
}

impl From<SubstrateError> for Fault {
    fn from(error: SubstrateError) -> Self {
        Fault::new(IO_EXCEPTION, json!({ "message": error.to_string() }))
    }
}

/// Outbound half of the substrate
#[async_trait]
pub trait Outbound: Send + Sync {
    /// Hand a message to the transport
    async fn send(&self, message: Message) -> Result<(), SubstrateError>;
}

/// Full substrate contract: blocking receive by operation plus send.
#[async_trait]
pub trait MessageSubstrate: Send + Sync {
    /// Wait for the next message addressed to `operation_id`
    async fn receive(&self, operation_id: &str) -> Result<Message, SubstrateError>;

    /// Send a message
    async fn send(&self, message: Message) -> Result<(), SubstrateError>;
}

/// Outbound that drops everything; used by contexts without a transport.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardOutbound;

#[async_trait]
impl Outbound for DiscardOutbound {
    async fn send(&self, message: Message) -> Result<(), SubstrateError> {
        tracing::debug!(
            operation = %message.operation_id,
            correlation_id = ?message.correlation_id,
            "discarding outbound message"
        );
        Ok(())
    }
}

/// Inbound source and outbound sink of one session
#[derive(Clone)]
pub struct SessionPort {
    input: Arc<dyn InputSource>,
    outbound: Arc<dyn Outbound>,
}

impl SessionPort {
    pub fn new(input: Arc<dyn InputSource>, outbound: Arc<dyn Outbound>) -> Self {
        Self { input, outbound }
    }

    /// Port backed by a fresh mailbox that discards outbound traffic
    pub fn detached() -> Self {
        Self::new(Arc::new(Mailbox::new()), Arc::new(DiscardOutbound))
    }

    pub fn input(&self) -> &Arc<dyn InputSource> {
        &self.input
    }

    pub fn outbound(&self) -> &Arc<dyn Outbound> {
        &self.outbound
    }
}

#[async_trait]
impl MessageSubstrate for SessionPort {
    async fn receive(&self, operation_id: &str) -> Result<Message, SubstrateError> {
        match race(&self.input, vec![operation_id.to_string()], None).await {
            RaceOutcome::Won { message, .. } => Ok(message),
            RaceOutcome::Killed | RaceOutcome::Closed => Err(SubstrateError::Closed),
        }
    }

    async fn send(&self, message: Message) -> Result<(), SubstrateError> {
        self.outbound.send(message).await
    }
}

impl std::fmt::Debug for SessionPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPort").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_substrate_error_becomes_io_exception_fault() {
        let fault: Fault = SubstrateError::Send("socket reset".to_string()).into();
        assert_eq!(fault.name(), IO_EXCEPTION);
        assert_eq!(fault.payload()["message"], "send failed: socket reset");
    }

    struct Collect(parking_lot::Mutex<Vec<Message>>);

    #[async_trait]
    impl Outbound for Collect {
        async fn send(&self, message: Message) -> Result<(), SubstrateError> {
            self.0.lock().push(message);
            Ok(())
        }
    }

    #[test]
    fn test_port_send_reaches_outbound() {
        tokio_test::block_on(async {
            let sink = Arc::new(Collect(parking_lot::Mutex::new(Vec::new())));
            let port = SessionPort::new(Arc::new(Mailbox::new()), sink.clone());

            port.send(Message::correlated("notify", 4, json!("done")))
                .await
                .unwrap();
            let sent = sink.0.lock().clone();
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].operation_id, "notify");
            assert_eq!(sent[0].correlation_id, Some(4));
        });
    }

    #[test]
    fn test_port_receive_on_closed_mailbox_fails_immediately() {
        tokio_test::block_on(async {
            let mailbox = Arc::new(Mailbox::new());
            let port = SessionPort::new(mailbox.clone(), Arc::new(DiscardOutbound));
            mailbox.close();

            assert_eq!(port.receive("ping").await, Err(SubstrateError::Closed));
        });
    }

    #[test]
    fn test_port_receive_takes_queued_message() {
        tokio_test::block_on(async {
            let mailbox = Arc::new(Mailbox::new());
            let port = SessionPort::new(mailbox.clone(), Arc::new(DiscardOutbound));
            mailbox.push(Message::new("ping", json!(1)));

            let message = port.receive("ping").await.unwrap();
            assert_eq!(message.payload, json!(1));
            assert_eq!(mailbox.pending("ping"), 0);
        });
    }

    #[test]
    fn test_port_receive_fails_when_mailbox_closes() {
        tokio_test::block_on(async {
            let mailbox = Arc::new(Mailbox::new());
            let port = SessionPort::new(mailbox.clone(), Arc::new(DiscardOutbound));

            let receive = port.receive("never");
            let close = async {
                tokio::task::yield_now().await;
                mailbox.close();
            };
            let (result, _) = tokio::join!(receive, close);
            assert_eq!(result, Err(SubstrateError::Closed));
        });
    }
}
