//! # Broker Contract
//!
//! The minimal surface the relay needs from a message transport. A concrete
//! broker (point-to-point queue, pub/sub topic, any FIFO transport) provides a
//! connection that opens sessions; sessions open producers and consumers
//! against a named destination.
//!
//! ```text
//! BrokerConnection ── create_session ──> BrokerSession
//!                                         ├── create_producer ──> MessageProducer::send
//!                                         └── create_consumer ──> MessageConsumer::receive ──> Delivery::acknowledge
//! ```
//!
//! Every handle can be closed independently. Closing a handle twice must not fail.

use std::time::Duration;

use async_trait::async_trait;

use super::wire::WireMessage;
use crate::error::OutboxResult;

#[async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    type Session: BrokerSession;

    async fn create_session(&self) -> OutboxResult<Self::Session>;

    /// Whether deliveries are acknowledged by the broker on receipt
    fn auto_acknowledge(&self) -> bool;

    async fn close(&self) -> OutboxResult<()>;

    /// Provider name for logging
    fn provider_name(&self) -> &'static str;
}

#[async_trait]
pub trait BrokerSession: Send + Sync + 'static {
    type Producer: MessageProducer;
    type Consumer: MessageConsumer;

    async fn create_producer(&self, destination: &str) -> OutboxResult<Self::Producer>;

    async fn create_consumer(&self, destination: &str) -> OutboxResult<Self::Consumer>;

    async fn close(&self) -> OutboxResult<()>;
}

#[async_trait]
pub trait MessageProducer: Send + Sync + 'static {
    /// Transmit a message, returning the broker-assigned message id
    async fn send(&self, message: WireMessage) -> OutboxResult<String>;

    async fn close(&self) -> OutboxResult<()>;
}

#[async_trait]
pub trait MessageConsumer: Send + Sync + 'static {
    type Delivery: Delivery;

    /// Block up to `timeout` for the next message; `None` when nothing arrived
    async fn receive(&self, timeout: Duration) -> OutboxResult<Option<Self::Delivery>>;

    async fn close(&self) -> OutboxResult<()>;
}

/// A received broker message together with its acknowledgement handle
#[async_trait]
pub trait Delivery: Send + Sync + 'static {
    fn broker_message_id(&self) -> &str;

    fn message(&self) -> &WireMessage;

    async fn acknowledge(&self) -> OutboxResult<()>;
}
