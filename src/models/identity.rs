use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{OutboxError, OutboxResult};

/// Identity of the caller that produced a message
///
/// Stored with each staged row as JSON and handed to the audit hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderIdentity {
    pub principal: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl SenderIdentity {
    pub fn new(principal: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Identity used for system-originated messages
    pub fn anonymous() -> Self {
        Self::new("anonymous")
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Serialized form stored in the `sender_identity` column
    pub fn to_record(&self) -> OutboxResult<String> {
        serde_json::to_string(self).map_err(|e| {
            OutboxError::serialization(format!("sender identity could not be encoded: {e}"))
        })
    }

    pub fn from_record(record: &str) -> OutboxResult<Self> {
        serde_json::from_str(record).map_err(|e| {
            OutboxError::serialization(format!("sender identity could not be decoded: {e}"))
        })
    }
}

impl Default for SenderIdentity {
    fn default() -> Self {
        Self::anonymous()
    }
}
