pub mod identity;
pub mod staged_message;

// Re-export core models for easy access
pub use identity::SenderIdentity;
pub use staged_message::{
    payload_checksum, MessageState, NewStagedMessage, StagedMessage, StagedMessageRow, StateCounts,
};
