//! # Staged Message Store
//!
//! Durable buffer between producers and the broker. Producers insert inside
//! their own transaction; dispatch workers claim, then report outcomes.
//!
//! ## Claim Protocol
//!
//! A row is claimable when its state is `new` or `error` and no worker owns
//! it. `claim_batch` locks eligible rows with `FOR UPDATE SKIP LOCKED`, so two
//! concurrent claimers on the same partition receive disjoint sets without any
//! coordination beyond row locks. Claimed rows keep their owner until they are
//! reported sent, reported failed, or released.
//!
//! ```text
//! new ──claim──> new(owned) ──sent──> sent
//!                    └──failed──> error ──claim──> error(owned) ──sent──> sent
//! ```

pub mod in_memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::OutboxResult;
use crate::messaging::QueueMessage;
use crate::models::{NewStagedMessage, SenderIdentity, StagedMessage, StateCounts};

pub use in_memory::{InMemoryStagedMessageStore, InMemoryTransaction};
pub use postgres::PgStagedMessageStore;

/// Parameters for one claim
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub queue_name: String,
    pub partition: i32,
    /// Worker incarnation recorded as the owner of claimed rows
    pub instance_id: String,
    pub batch_size: u32,
}

/// A claimed row with its decoded entity
#[derive(Debug, Clone)]
pub struct ClaimedMessage<T> {
    pub message_id: String,
    pub partition: i32,
    pub entity: T,
    pub sender: SenderIdentity,
    pub payload_type: String,
    pub created_at: DateTime<Utc>,
}

impl<T: QueueMessage> ClaimedMessage<T> {
    /// Verify and decode a locked row
    ///
    /// Fails when the stored checksum or length no longer matches the payload,
    /// or when the payload or sender identity cannot be decoded.
    pub fn decode(message: &StagedMessage) -> OutboxResult<Self> {
        message.verify_integrity()?;
        Ok(Self {
            message_id: message.message_id.clone(),
            partition: message.partition,
            entity: T::from_bytes(&message.payload)?,
            sender: message.sender()?,
            payload_type: message.payload_type.clone(),
            created_at: message.created_at,
        })
    }
}

/// Per-message results of one dispatch firing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchOutcomes {
    pub sent: Vec<String>,
    /// `(message_id, error description)`
    pub failed: Vec<(String, String)>,
}

impl DispatchOutcomes {
    pub fn record_sent(&mut self, message_id: impl Into<String>) {
        self.sent.push(message_id.into());
    }

    pub fn record_failed(&mut self, message_id: impl Into<String>, error: impl Into<String>) {
        self.failed.push((message_id.into(), error.into()));
    }

    pub fn is_empty(&self) -> bool {
        self.sent.is_empty() && self.failed.is_empty()
    }
}

/// Rows actually transitioned by `report_outcomes`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeSummary {
    pub sent: u64,
    pub failed: u64,
}

#[async_trait]
pub trait StagedMessageStore: Send + Sync + 'static {
    /// Producer unit of work that staged rows join
    type Transaction: Send;

    async fn begin(&self) -> OutboxResult<Self::Transaction>;

    async fn commit(&self, tx: Self::Transaction) -> OutboxResult<()>;

    async fn rollback(&self, tx: Self::Transaction) -> OutboxResult<()>;

    /// Stage one message inside the caller's transaction
    ///
    /// The row becomes visible to claimers only when `tx` commits.
    async fn insert(
        &self,
        tx: &mut Self::Transaction,
        message: NewStagedMessage,
    ) -> OutboxResult<StagedMessage>;

    /// Claim up to `batch_size` eligible rows of one partition, oldest first
    ///
    /// Rows that fail integrity checks or decoding are marked `error` with the
    /// reason and left out of the result. Runs in its own transaction.
    async fn claim_batch<T: QueueMessage>(
        &self,
        request: &ClaimRequest,
    ) -> OutboxResult<Vec<ClaimedMessage<T>>>;

    /// Record the outcome of a firing for rows owned by `instance_id`
    ///
    /// Applied atomically; rows named in neither list keep their owner.
    async fn report_outcomes(
        &self,
        instance_id: &str,
        outcomes: &DispatchOutcomes,
    ) -> OutboxResult<OutcomeSummary>;

    /// Drop ownership of unsent rows held by a worker incarnation
    async fn release(&self, queue_name: &str, instance_id: &str) -> OutboxResult<u64>;

    async fn find(&self, message_id: &str) -> OutboxResult<Option<StagedMessage>>;

    async fn state_counts(&self, queue_name: &str) -> OutboxResult<StateCounts>;
}
