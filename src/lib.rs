#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Tasker Outbox
//!
//! Durable store-and-forward message relay (transactional outbox).
//!
//! ## Overview
//!
//! Producers stage outbound messages into a relational table inside their own
//! database transaction. Partitioned background workers claim batches of
//! staged rows, transmit them through a broker adapter, and record the outcome
//! on each row. Delivery is at-least-once and survives restarts, because all
//! state lives in the store. Concurrent claimers are kept apart by row locks
//! alone.
//!
//! ## Module Organization
//!
//! - [`queue`] - `OutboxQueue` facade, queue descriptor, partition assignment
//! - [`store`] - staged message store trait with Postgres and in-memory implementations
//! - [`dispatch`] - per-partition dispatch workers and their scheduler
//! - [`messaging`] - broker contract, wire model, adapter, in-memory broker
//! - [`audit`] - audit hook contract
//! - [`models`] - staged message rows and sender identity
//! - [`database`] - pool creation and migrations
//! - [`config`] - layered configuration loading
//! - [`error`] - structured error handling
//! - [`logging`] - tracing subscriber setup
//!
//! ## Testing
//!
//! ```bash
//! cargo test                              # Unit and in-memory integration tests
//! cargo test --features test-database     # Adds Postgres-backed tests (needs DATABASE_URL)
//! ```

pub mod audit;
pub mod config;
pub mod database;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod models;
pub mod queue;
pub mod store;

pub use audit::{AuditHook, NoopAuditHook, TracingAuditHook};
pub use config::{ConfigLoader, DatabaseConfig, OutboxConfig, QueueSettings};
pub use dispatch::{DispatchReport, DispatchScheduler, SchedulerState};
pub use error::{OutboxError, OutboxResult};
pub use messaging::{BrokerAdapter, InMemoryBroker, QueueMessage, ReceivedMessage};
pub use models::{MessageState, SenderIdentity, StagedMessage};
pub use queue::{OutboxQueue, QueueDescriptor, QueueState};
pub use store::{InMemoryStagedMessageStore, PgStagedMessageStore, StagedMessageStore};
