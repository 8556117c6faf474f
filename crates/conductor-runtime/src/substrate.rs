//! In-memory message substrate over tokio channels
//!
//! The client half plays the remote peers: it pushes inbound messages and
//! reads whatever sessions send. The server half feeds a
//! [`Dispatcher`](crate::dispatcher::Dispatcher) and hands sessions an
//! [`Outbound`] sink.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use conductor_core::substrate::{Outbound, SubstrateError};
use conductor_core::types::Message;

/// Outbound sink backed by an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelOutbound {
    tx: mpsc::UnboundedSender<Message>,
}

impl ChannelOutbound {
    pub fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl Outbound for ChannelOutbound {
    async fn send(&self, message: Message) -> Result<(), SubstrateError> {
        self.tx.send(message).map_err(|_| SubstrateError::Closed)
    }
}

/// Peer side of the in-memory transport
pub struct TransportClient {
    inbound: mpsc::Sender<Message>,
    outbound: mpsc::UnboundedReceiver<Message>,
}

impl TransportClient {
    /// Deliver a message to the engine
    pub async fn send(&self, message: Message) -> Result<(), SubstrateError> {
        self.inbound
            .send(message)
            .await
            .map_err(|_| SubstrateError::Closed)
    }

    /// Next message sent by a session; `None` once every sender is gone
    pub async fn recv(&mut self) -> Option<Message> {
        self.outbound.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        self.outbound.try_recv().ok()
    }

    /// Stop delivering; the dispatcher reading the server half drains and exits
    pub fn close_inbound(&mut self) {
        let (closed, _) = mpsc::channel(1);
        self.inbound = closed;
    }
}

/// Engine side of the in-memory transport
pub struct TransportServer {
    pub inbound: mpsc::Receiver<Message>,
    pub outbound: Arc<ChannelOutbound>,
}

/// Create a connected client/server pair; `capacity` bounds pending inbound messages
pub fn memory_transport(capacity: usize) -> (TransportClient, TransportServer) {
    let (inbound_tx, inbound_rx) = mpsc::channel(capacity.max(1));
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    (
        TransportClient {
            inbound: inbound_tx,
            outbound: outbound_rx,
        },
        TransportServer {
            inbound: inbound_rx,
            outbound: Arc::new(ChannelOutbound::new(outbound_tx)),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_messages_cross_both_directions() {
        tokio_test::block_on(async {
            let (mut client, mut server) = memory_transport(4);
            client.send(Message::new("ping", json!(1))).await.unwrap();
            assert_eq!(server.inbound.recv().await.unwrap().operation_id, "ping");

            server.outbound.send(Message::new("pong", json!(2))).await.unwrap();
            assert_eq!(client.recv().await.unwrap().operation_id, "pong");
        });
    }

    #[test]
    fn test_closed_client_fails_outbound_send() {
        tokio_test::block_on(async {
            let (client, server) = memory_transport(1);
            drop(client);
            let result = server.outbound.send(Message::new("pong", json!(null))).await;
            assert_eq!(result, Err(SubstrateError::Closed));
        });
    }
}
