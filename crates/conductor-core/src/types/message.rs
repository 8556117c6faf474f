//! Message type definition
//!
//! The envelope exchanged with the message substrate. Payload encoding is
//! the concern of the protocol layers; here it is an opaque JSON value.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{CorrelationId, Fault};

/// Inbound or outbound message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Operation this message is addressed to
    pub operation_id: String,
    /// Correlation/request id, if the transport carries one
    #[serde(default)]
    pub correlation_id: Option<CorrelationId>,
    /// Message payload
    #[serde(default)]
    pub payload: Value,
    /// Fault carried by a fault response
    #[serde(default)]
    pub fault: Option<Fault>,
}

impl Message {
    /// Create an uncorrelated message
    pub fn new(operation_id: impl Into<String>, payload: Value) -> Self {
        Self {
            operation_id: operation_id.into(),
            correlation_id: None,
            payload,
            fault: None,
        }
    }

    /// Create a correlated message
    pub fn correlated(
        operation_id: impl Into<String>,
        correlation_id: CorrelationId,
        payload: Value,
    ) -> Self {
        Self::new(operation_id, payload).with_correlation(correlation_id)
    }

    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Build a response to `request` on the same operation and correlation id
    pub fn response_to(request: &Message, payload: Value) -> Self {
        Self {
            operation_id: request.operation_id.clone(),
            correlation_id: request.correlation_id,
            payload,
            fault: None,
        }
    }

    /// Build a fault response to `request`
    pub fn fault_response_to(request: &Message, fault: Fault) -> Self {
        Self {
            operation_id: request.operation_id.clone(),
            correlation_id: request.correlation_id,
            payload: Value::Null,
            fault: Some(fault),
        }
    }

    pub fn is_fault(&self) -> bool {
        self.fault.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fault_response_keeps_operation_and_correlation() {
        let request = Message::correlated("order", 42, json!({"qty": 1}));
        let reply = Message::fault_response_to(&request, Fault::named("OutOfStock"));
        assert_eq!(reply.operation_id, "order");
        assert_eq!(reply.correlation_id, Some(42));
        assert!(reply.is_fault());
        assert!(reply.payload.is_null());
    }

    #[test]
    fn test_deserialize_defaults_optional_fields() {
        let message: Message = serde_json::from_value(json!({"operation_id": "ping"})).unwrap();
        assert_eq!(message.correlation_id, None);
        assert!(message.fault.is_none());
        assert!(message.payload.is_null());
    }
}
