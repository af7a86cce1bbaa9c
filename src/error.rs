//! # Outbox Error Types
//!
//! Structured error handling for the relay using thiserror. Every fallible
//! operation in the crate returns [`OutboxResult`].
//!
//! The taxonomy follows the layers a message crosses:
//!
//! - `SerializationError` - payload could not be encoded or decoded
//! - `StoreError` - a transactional operation against the relational store failed
//! - `TransportError` / `UnsupportedMessageType` - broker send, receive or ack failed
//! - `AuditError` - the audit hook rejected a record
//! - `StateError` - the queue is not `Available`
//! - `ConfigurationError` - settings could not be loaded or validated

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OutboxError {
    #[error("Serialization error: {message}")]
    SerializationError { message: String },

    #[error("Store error: {operation}: {message}")]
    StoreError { operation: String, message: String },

    #[error("Transport error: {operation}: {message}")]
    TransportError { operation: String, message: String },

    #[error("Unsupported message type: {shape}")]
    UnsupportedMessageType { shape: String },

    #[error("Audit error: {message}")]
    AuditError { message: String },

    #[error("Invalid state: queue {queue_name} is {state}")]
    StateError { queue_name: String, state: String },

    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },
}

impl OutboxError {
    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Create a store error for the named operation
    pub fn store(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StoreError {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a transport error for the named operation
    pub fn transport(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransportError {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create an unsupported wire-message shape error
    pub fn unsupported_message_type(shape: impl Into<String>) -> Self {
        Self::UnsupportedMessageType {
            shape: shape.into(),
        }
    }

    /// Create an audit error
    pub fn audit(message: impl Into<String>) -> Self {
        Self::AuditError {
            message: message.into(),
        }
    }

    /// Create a state error
    pub fn state(queue_name: impl Into<String>, state: impl std::fmt::Display) -> Self {
        Self::StateError {
            queue_name: queue_name.into(),
            state: state.to_string(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError {
            message: message.into(),
        }
    }

    /// Whether this failure happened on the broker side of the relay.
    ///
    /// An unsupported wire shape counts as a transport failure.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::TransportError { .. } | Self::UnsupportedMessageType { .. }
        )
    }

    pub fn is_store(&self) -> bool {
        matches!(self, Self::StoreError { .. })
    }
}

impl From<sqlx::Error> for OutboxError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => OutboxError::store("query", "No rows found"),
            sqlx::Error::Database(db_err) => OutboxError::store("database", db_err.to_string()),
            sqlx::Error::PoolTimedOut => {
                OutboxError::store("pool", "Timed out acquiring a database connection")
            }
            sqlx::Error::PoolClosed => OutboxError::store("pool", "Database pool is closed"),
            sqlx::Error::Configuration(config_err) => {
                OutboxError::configuration(format!("database: {config_err}"))
            }
            _ => OutboxError::store("connection", err.to_string()),
        }
    }
}

impl From<serde_json::Error> for OutboxError {
    fn from(err: serde_json::Error) -> Self {
        OutboxError::serialization(err.to_string())
    }
}

impl From<config::ConfigError> for OutboxError {
    fn from(err: config::ConfigError) -> Self {
        OutboxError::configuration(err.to_string())
    }
}

/// Result type alias for relay operations
pub type OutboxResult<T> = Result<T, OutboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let store_err = OutboxError::store("claim_batch", "connection reset");
        assert!(matches!(store_err, OutboxError::StoreError { .. }));
        assert!(store_err.is_store());

        let shape_err = OutboxError::unsupported_message_type("map");
        assert!(shape_err.is_transport());

        let audit_err = OutboxError::audit("sink unavailable");
        assert!(!audit_err.is_transport());
    }

    #[test]
    fn test_error_conversions() {
        let sqlx_err = sqlx::Error::PoolTimedOut;
        let outbox_err: OutboxError = sqlx_err.into();
        assert!(outbox_err.is_store());

        let json_err = serde_json::from_str::<serde_json::Value>("{invalid json").unwrap_err();
        let outbox_err: OutboxError = json_err.into();
        assert!(matches!(outbox_err, OutboxError::SerializationError { .. }));
    }

    #[test]
    fn test_error_display() {
        let err = OutboxError::transport("send", "broker unreachable");
        let display = format!("{err}");
        assert!(display.contains("Transport error"));
        assert!(display.contains("send"));
        assert!(display.contains("broker unreachable"));

        let err = OutboxError::state("orders", "disposed");
        assert_eq!(format!("{err}"), "Invalid state: queue orders is disposed");
    }
}
