//! # Messaging Module
//!
//! Broker-facing side of the relay: the wire model, the broker contract, the
//! serialization contract, the adapter that ties them to a queue, and an
//! in-memory broker for development and tests.

pub mod adapter;
pub mod broker;
pub mod codec;
pub mod in_memory;
pub mod wire;

pub use adapter::{BrokerAdapter, ReceivedMessage};
pub use broker::{BrokerConnection, BrokerSession, Delivery, MessageConsumer, MessageProducer};
pub use codec::QueueMessage;
pub use in_memory::{
    InMemoryBroker, InMemoryConnection, InMemoryConsumer, InMemoryDelivery, InMemoryProducer,
    InMemorySession,
};
pub use wire::{WireBody, WireMessage};
