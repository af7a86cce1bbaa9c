//! Shared fixtures for the integration suites

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use tasker_outbox::audit::{AuditEvent, AuditHook, AuditKind, AuditRecord};
use tasker_outbox::config::QueueSettings;
use tasker_outbox::messaging::{InMemoryBroker, InMemoryConnection};
use tasker_outbox::models::{NewStagedMessage, SenderIdentity};
use tasker_outbox::queue::OutboxQueue;
use tasker_outbox::store::{InMemoryStagedMessageStore, StagedMessageStore};
use tasker_outbox::{OutboxError, OutboxResult, QueueMessage};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub order_id: u64,
    pub amount_cents: i64,
}

impl OrderPlaced {
    pub fn new(order_id: u64) -> Self {
        Self {
            order_id,
            amount_cents: (order_id as i64) * 100,
        }
    }
}

/// Generate a unique name for test data
pub fn unique_name(prefix: &str) -> String {
    let timestamp = Utc::now().timestamp_millis();
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}_{timestamp}_{}", &random[..8])
}

/// Queue settings whose workers never fire on their own during a test
pub fn manual_settings(name: &str, partitions: u32) -> QueueSettings {
    let mut settings = QueueSettings::named(name);
    settings.thread_pool_size = partitions;
    settings.start_delay_ms = 3_600_000;
    settings.send_interval_ms = 3_600_000;
    settings
}

/// Queue settings that dispatch almost immediately
pub fn eager_settings(name: &str, partitions: u32) -> QueueSettings {
    let mut settings = QueueSettings::named(name);
    settings.thread_pool_size = partitions;
    settings.start_delay_ms = 0;
    settings.send_interval_ms = 25;
    settings
}

pub type TestQueue = OutboxQueue<OrderPlaced, InMemoryStagedMessageStore, InMemoryConnection>;

pub struct Harness {
    pub store: Arc<InMemoryStagedMessageStore>,
    pub broker: InMemoryBroker,
    pub queue: TestQueue,
}

impl Harness {
    pub fn new(settings: &QueueSettings) -> Self {
        Self::with_audit(settings, None)
    }

    pub fn with_audit(settings: &QueueSettings, audit: Option<Arc<dyn AuditHook>>) -> Self {
        let store = Arc::new(InMemoryStagedMessageStore::new());
        let broker = InMemoryBroker::new();
        let queue = OutboxQueue::from_settings(
            settings,
            Arc::clone(&store),
            broker.connect(settings.auto_ack),
            audit,
        )
        .expect("valid queue settings");
        Self {
            store,
            broker,
            queue,
        }
    }

    pub fn queue_name(&self) -> &str {
        self.queue.descriptor().name()
    }
}

/// Insert one committed row straight into a partition
pub async fn stage_committed(
    store: &InMemoryStagedMessageStore,
    queue_name: &str,
    partition: i32,
    entity: &OrderPlaced,
) -> String {
    let mut tx = store.begin().await.unwrap();
    let staged = store
        .insert(
            &mut tx,
            NewStagedMessage {
                queue_name: queue_name.to_string(),
                partition,
                payload: entity.to_bytes().unwrap(),
                payload_type: OrderPlaced::type_name().to_string(),
                sender_identity: SenderIdentity::new("test-producer"),
            },
        )
        .await
        .unwrap();
    store.commit(tx).await.unwrap();
    staged.message_id
}

/// Audit hook that records every event and can be switched to fail
#[derive(Debug, Default)]
pub struct RecordingAuditHook {
    pub events: Mutex<Vec<(AuditKind, String, String)>>,
    pub fail: AtomicBool,
}

impl RecordingAuditHook {
    pub fn failing() -> Self {
        let hook = Self::default();
        hook.fail.store(true, Ordering::SeqCst);
        hook
    }

    pub fn kinds(&self) -> Vec<AuditKind> {
        self.events.lock().iter().map(|(kind, _, _)| *kind).collect()
    }
}

#[async_trait]
impl AuditHook for RecordingAuditHook {
    async fn audit(&self, event: AuditEvent<'_>) -> OutboxResult<AuditRecord> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(OutboxError::audit("audit store unavailable"));
        }
        self.events.lock().push((
            event.kind,
            event.queue_name.to_string(),
            event.identity.principal.clone(),
        ));
        Ok(AuditRecord {
            record_id: event.change_context.change_id.to_string(),
            recorded_at: event.change_context.occurred_at,
        })
    }
}
