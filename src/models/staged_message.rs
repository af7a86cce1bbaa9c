use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{OutboxError, OutboxResult};
use crate::models::SenderIdentity;

/// Lifecycle state of a staged message
///
/// `New` and `Error` rows are eligible for claim when unowned; `Sent` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageState {
    New,
    Sent,
    Error,
}

impl MessageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageState::New => "new",
            MessageState::Sent => "sent",
            MessageState::Error => "error",
        }
    }

    /// Whether a row in this state may be claimed (ownership permitting)
    pub fn is_claimable(&self) -> bool {
        matches!(self, MessageState::New | MessageState::Error)
    }
}

impl fmt::Display for MessageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageState {
    type Err = OutboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(MessageState::New),
            "sent" => Ok(MessageState::Sent),
            "error" => Ok(MessageState::Error),
            other => Err(OutboxError::store(
                "decode_row",
                format!("unknown message state '{other}'"),
            )),
        }
    }
}

/// Lowercase hex SHA-256 of a payload
pub fn payload_checksum(payload: &[u8]) -> String {
    format!("{:x}", Sha256::digest(payload))
}

/// One outbound message durably buffered ahead of broker transmission
///
/// Maps to the `tasker_outbox_staged_messages` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedMessage {
    pub message_id: String,
    pub queue_name: String,
    pub partition: i32,
    pub payload: Vec<u8>,
    pub payload_type: String,
    pub checksum: String,
    pub length: i32,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub state: MessageState,
    pub owner_instance_id: Option<String>,
    pub error: Option<String>,
    pub sender_identity: String,
}

/// New staged message for insertion (without generated fields)
#[derive(Debug, Clone)]
pub struct NewStagedMessage {
    pub queue_name: String,
    pub partition: i32,
    pub payload: Vec<u8>,
    pub payload_type: String,
    pub sender_identity: SenderIdentity,
}

impl StagedMessage {
    /// Build the row written at insert time
    ///
    /// Assigns the id, checksum, length and creation time. An empty payload is
    /// rejected because there is nothing to relay.
    pub fn stage(new_message: NewStagedMessage) -> OutboxResult<Self> {
        if new_message.payload.is_empty() {
            return Err(OutboxError::serialization(format!(
                "refusing to stage an empty {} payload for queue {}",
                new_message.payload_type, new_message.queue_name
            )));
        }
        if new_message.partition < 0 {
            return Err(OutboxError::store(
                "insert",
                format!("partition must be >= 0, got {}", new_message.partition),
            ));
        }
        let length = i32::try_from(new_message.payload.len()).map_err(|_| {
            OutboxError::serialization(format!(
                "payload of {} bytes exceeds the storable length",
                new_message.payload.len()
            ))
        })?;

        Ok(Self {
            message_id: Uuid::new_v4().to_string(),
            queue_name: new_message.queue_name,
            partition: new_message.partition,
            checksum: payload_checksum(&new_message.payload),
            length,
            payload: new_message.payload,
            payload_type: new_message.payload_type,
            created_at: Utc::now(),
            sent_at: None,
            state: MessageState::New,
            owner_instance_id: None,
            error: None,
            sender_identity: new_message.sender_identity.to_record()?,
        })
    }

    /// Claim eligibility: claimable state and no current owner
    pub fn is_claimable(&self) -> bool {
        self.state.is_claimable() && self.owner_instance_id.is_none()
    }

    /// Check the stored payload against its recorded checksum and length
    pub fn verify_integrity(&self) -> OutboxResult<()> {
        if usize::try_from(self.length).ok() != Some(self.payload.len()) {
            return Err(OutboxError::serialization(format!(
                "payload length mismatch for {}: recorded {}, stored {}",
                self.message_id,
                self.length,
                self.payload.len()
            )));
        }
        let actual = payload_checksum(&self.payload);
        if actual != self.checksum {
            return Err(OutboxError::serialization(format!(
                "checksum mismatch for {}: recorded {}, computed {actual}",
                self.message_id, self.checksum
            )));
        }
        Ok(())
    }

    /// Decode the stored sender identity
    pub fn sender(&self) -> OutboxResult<SenderIdentity> {
        SenderIdentity::from_record(&self.sender_identity)
    }
}

/// Raw row shape as read by sqlx, converted into [`StagedMessage`]
#[derive(Debug, Clone, FromRow)]
pub struct StagedMessageRow {
    pub message_id: String,
    pub queue_name: String,
    pub partition_id: i32,
    pub payload: Vec<u8>,
    pub payload_type: String,
    pub checksum: String,
    pub length: i32,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub state: String,
    pub owner_instance_id: Option<String>,
    pub error: Option<String>,
    pub sender_identity: String,
}

impl TryFrom<StagedMessageRow> for StagedMessage {
    type Error = OutboxError;

    fn try_from(row: StagedMessageRow) -> Result<Self, Self::Error> {
        Ok(Self {
            state: row.state.parse()?,
            message_id: row.message_id,
            queue_name: row.queue_name,
            partition: row.partition_id,
            payload: row.payload,
            payload_type: row.payload_type,
            checksum: row.checksum,
            length: row.length,
            created_at: row.created_at,
            sent_at: row.sent_at,
            owner_instance_id: row.owner_instance_id,
            error: row.error,
            sender_identity: row.sender_identity,
        })
    }
}

/// Per-state row counts for one queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    pub new: u64,
    pub sent: u64,
    pub error: u64,
    /// Unsent rows currently owned by a worker
    pub claimed: u64,
}

impl StateCounts {
    pub fn total(&self) -> u64 {
        self.new + self.sent + self.error
    }

    /// Rows not yet delivered
    pub fn pending(&self) -> u64 {
        self.new + self.error
    }
}
