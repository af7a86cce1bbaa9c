//! # Message Serialization Contract
//!
//! Types implementing [`QueueMessage`] can be staged and relayed. Any
//! serde-compatible type gets JSON encoding through the blanket implementation.

use crate::error::{OutboxError, OutboxResult};

/// Message serialization contract
pub trait QueueMessage: Send + Sync + Clone + 'static {
    /// Serialize the message to bytes
    fn to_bytes(&self) -> OutboxResult<Vec<u8>>;

    /// Deserialize the message from bytes
    fn from_bytes(bytes: &[u8]) -> OutboxResult<Self>
    where
        Self: Sized;

    /// Type name recorded in `payload_type`
    fn type_name() -> &'static str
    where
        Self: Sized,
    {
        std::any::type_name::<Self>()
    }
}

/// Blanket implementation for types that implement Serialize + DeserializeOwned
impl<T> QueueMessage for T
where
    T: serde::Serialize + serde::de::DeserializeOwned + Send + Sync + Clone + 'static,
{
    fn to_bytes(&self) -> OutboxResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| OutboxError::serialization(e.to_string()))
    }

    fn from_bytes(bytes: &[u8]) -> OutboxResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| OutboxError::serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
    struct TestMessage {
        id: u64,
        data: String,
    }

    #[test]
    fn test_queue_message_roundtrip() {
        let msg = TestMessage {
            id: 42,
            data: "hello".to_string(),
        };

        let bytes = msg.to_bytes().expect("serialization should succeed");
        let decoded = TestMessage::from_bytes(&bytes).expect("deserialization should succeed");

        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_queue_message_invalid_bytes() {
        let result = TestMessage::from_bytes(b"not valid json");
        assert!(matches!(
            result,
            Err(OutboxError::SerializationError { .. })
        ));
    }

    #[test]
    fn test_type_name_is_fully_qualified() {
        assert!(TestMessage::type_name().ends_with("TestMessage"));
        assert!(TestMessage::type_name().contains("::"));
    }
}
