//! # Audit Hook
//!
//! Side-effect hook invoked on send and receive for queues with auditing
//! enabled. The relay only depends on the [`AuditHook`] contract; where the
//! records end up is the implementation's business.
//!
//! A failing hook fails the surrounding broker operation. On send the broker
//! already holds the bytes at that point, so the guarantee is best-effort
//! rather than transactional.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;
use uuid::Uuid;

use crate::error::OutboxResult;
use crate::models::{payload_checksum, SenderIdentity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditKind {
    Send,
    Receive,
}

impl fmt::Display for AuditKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditKind::Send => f.write_str("send"),
            AuditKind::Receive => f.write_str("receive"),
        }
    }
}

/// Correlates one audited change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeContext {
    pub change_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub origin: String,
}

impl ChangeContext {
    pub fn generate(origin: impl Into<String>) -> Self {
        Self {
            change_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            origin: origin.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditEvent<'a> {
    pub entity_type: &'a str,
    pub queue_name: &'a str,
    pub kind: AuditKind,
    /// Serialized entity
    pub entity: &'a [u8],
    pub change_context: ChangeContext,
    pub identity: &'a SenderIdentity,
}

/// Acknowledgement returned by a hook for a stored audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub record_id: String,
    pub recorded_at: DateTime<Utc>,
}

#[async_trait]
pub trait AuditHook: Send + Sync + 'static {
    async fn audit(&self, event: AuditEvent<'_>) -> OutboxResult<AuditRecord>;
}

/// Writes audit records to the `tracing` pipeline under the `audit` target
#[derive(Debug, Default, Clone)]
pub struct TracingAuditHook;

#[async_trait]
impl AuditHook for TracingAuditHook {
    async fn audit(&self, event: AuditEvent<'_>) -> OutboxResult<AuditRecord> {
        let record = AuditRecord {
            record_id: event.change_context.change_id.to_string(),
            recorded_at: Utc::now(),
        };
        info!(
            target: "audit",
            kind = %event.kind,
            queue = %event.queue_name,
            entity_type = %event.entity_type,
            principal = %event.identity.principal,
            change_id = %event.change_context.change_id,
            origin = %event.change_context.origin,
            entity_bytes = event.entity.len(),
            entity_checksum = %payload_checksum(event.entity),
            "Audit record"
        );
        Ok(record)
    }
}

/// Accepts every event without recording it
#[derive(Debug, Default, Clone)]
pub struct NoopAuditHook;

#[async_trait]
impl AuditHook for NoopAuditHook {
    async fn audit(&self, event: AuditEvent<'_>) -> OutboxResult<AuditRecord> {
        Ok(AuditRecord {
            record_id: event.change_context.change_id.to_string(),
            recorded_at: event.change_context.occurred_at,
        })
    }
}
