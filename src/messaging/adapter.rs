//! # Broker Adapter
//!
//! Wraps a [`BrokerConnection`] for one queue. The session, producer and
//! consumer are opened on first use under a single async mutex, so concurrent
//! partition workers never race to create them.
//!
//! The queue's `auto_ack` setting selects the receive mode. With `auto_ack`
//! on, a delivery from a manually acknowledging connection is acknowledged as
//! soon as it is decoded. With it off, every received delivery is kept in an
//! in-memory receipt cache keyed by broker message id until
//! [`BrokerAdapter::ack`] is called for it. A connection that acknowledges on
//! receipt never leaves anything to cache. The cache is not persisted; receipts are lost on restart and
//! the broker redelivers.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::broker::{BrokerConnection, BrokerSession, Delivery, MessageConsumer, MessageProducer};
use super::codec::QueueMessage;
use super::wire::{WireBody, WireMessage, PROPERTY_CHECKSUM, PROPERTY_PAYLOAD_TYPE, PROPERTY_SENDER};
use crate::audit::{AuditEvent, AuditHook, AuditKind, ChangeContext};
use crate::error::{OutboxError, OutboxResult};
use crate::models::{payload_checksum, SenderIdentity};
use crate::queue::QueueDescriptor;

type SessionOf<C> = <C as BrokerConnection>::Session;
type ProducerOf<C> = <SessionOf<C> as BrokerSession>::Producer;
type ConsumerOf<C> = <SessionOf<C> as BrokerSession>::Consumer;
type DeliveryOf<C> = <ConsumerOf<C> as MessageConsumer>::Delivery;

const AUDIT_ORIGIN: &str = "tasker-outbox";

/// A decoded inbound message
#[derive(Debug, Clone)]
pub struct ReceivedMessage<T> {
    /// Broker-assigned id, the key for [`BrokerAdapter::ack`]
    pub broker_message_id: String,
    pub entity: T,
    pub sender: SenderIdentity,
    pub payload_type: Option<String>,
    pub received_at: DateTime<Utc>,
}

struct SessionHandles<C: BrokerConnection> {
    session: Option<Arc<SessionOf<C>>>,
    producer: Option<Arc<ProducerOf<C>>>,
    consumer: Option<Arc<ConsumerOf<C>>>,
    closed: bool,
}

impl<C: BrokerConnection> Default for SessionHandles<C> {
    fn default() -> Self {
        Self {
            session: None,
            producer: None,
            consumer: None,
            closed: false,
        }
    }
}

pub struct BrokerAdapter<C: BrokerConnection> {
    connection: C,
    descriptor: Arc<QueueDescriptor>,
    audit: Option<Arc<dyn AuditHook>>,
    handles: Mutex<SessionHandles<C>>,
    unacknowledged: DashMap<String, DeliveryOf<C>>,
}

impl<C: BrokerConnection> std::fmt::Debug for BrokerAdapter<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerAdapter")
            .field("provider", &self.connection.provider_name())
            .field("queue", &self.descriptor.name())
            .field("unacknowledged", &self.unacknowledged.len())
            .finish()
    }
}

impl<C: BrokerConnection> BrokerAdapter<C> {
    /// The audit hook is only invoked when the descriptor has auditing enabled.
    pub fn new(
        connection: C,
        descriptor: Arc<QueueDescriptor>,
        audit: Option<Arc<dyn AuditHook>>,
    ) -> Self {
        Self {
            connection,
            descriptor,
            audit,
            handles: Mutex::new(SessionHandles::default()),
            unacknowledged: DashMap::new(),
        }
    }

    pub fn descriptor(&self) -> &QueueDescriptor {
        &self.descriptor
    }

    /// Number of received deliveries awaiting [`ack`](Self::ack)
    pub fn unacknowledged_count(&self) -> usize {
        self.unacknowledged.len()
    }

    async fn session(
        &self,
        handles: &mut SessionHandles<C>,
        operation: &str,
    ) -> OutboxResult<Arc<SessionOf<C>>> {
        if handles.closed {
            return Err(OutboxError::transport(operation, "broker adapter is closed"));
        }
        if let Some(session) = &handles.session {
            return Ok(Arc::clone(session));
        }
        let session = Arc::new(self.connection.create_session().await?);
        debug!(
            provider = self.connection.provider_name(),
            queue = %self.descriptor.name(),
            "Opened broker session"
        );
        handles.session = Some(Arc::clone(&session));
        Ok(session)
    }

    async fn producer(&self) -> OutboxResult<Arc<ProducerOf<C>>> {
        let mut handles = self.handles.lock().await;
        let session = self.session(&mut handles, "send").await?;
        if let Some(producer) = &handles.producer {
            return Ok(Arc::clone(producer));
        }
        let producer = Arc::new(session.create_producer(self.descriptor.name()).await?);
        handles.producer = Some(Arc::clone(&producer));
        Ok(producer)
    }

    async fn consumer(&self) -> OutboxResult<Arc<ConsumerOf<C>>> {
        let mut handles = self.handles.lock().await;
        let session = self.session(&mut handles, "receive").await?;
        if let Some(consumer) = &handles.consumer {
            return Ok(Arc::clone(consumer));
        }
        let consumer = Arc::new(session.create_consumer(self.descriptor.name()).await?);
        handles.consumer = Some(Arc::clone(&consumer));
        Ok(consumer)
    }

    async fn audit(
        &self,
        kind: AuditKind,
        entity_type: &str,
        entity: &[u8],
        identity: &SenderIdentity,
    ) -> OutboxResult<()> {
        if !self.descriptor.audit_enabled() {
            return Ok(());
        }
        let Some(hook) = &self.audit else {
            return Ok(());
        };

        let event = AuditEvent {
            entity_type,
            queue_name: self.descriptor.name(),
            kind,
            entity,
            change_context: ChangeContext::generate(AUDIT_ORIGIN),
            identity,
        };
        hook.audit(event).await.map(|_| ()).map_err(|e| {
            OutboxError::transport(kind.to_string(), format!("audit hook failed: {e}"))
        })
    }

    /// Transmit one entity, returning the broker message id
    #[instrument(skip(self, entity, identity), fields(queue = %self.descriptor.name()))]
    pub async fn send<T: QueueMessage>(
        &self,
        entity: &T,
        identity: &SenderIdentity,
    ) -> OutboxResult<String> {
        let payload = entity.to_bytes()?;
        let checksum = payload_checksum(&payload);
        let message = WireMessage::bytes(payload.clone())
            .with_property(PROPERTY_PAYLOAD_TYPE, self.descriptor.payload_type())
            .with_property(PROPERTY_CHECKSUM, checksum)
            .with_property(PROPERTY_SENDER, identity.to_record()?);

        let producer = self.producer().await?;
        let broker_message_id = producer.send(message).await?;

        // The broker already holds the message if the hook fails here
        self.audit(AuditKind::Send, self.descriptor.payload_type(), &payload, identity)
            .await?;

        debug!(broker_message_id = %broker_message_id, "Sent message to broker");
        Ok(broker_message_id)
    }

    /// Wait up to `timeout` for one message
    ///
    /// Returns `Ok(None)` when nothing arrived in time.
    #[instrument(skip(self), fields(queue = %self.descriptor.name()))]
    pub async fn receive<T: QueueMessage>(
        &self,
        timeout: Duration,
    ) -> OutboxResult<Option<ReceivedMessage<T>>> {
        let consumer = self.consumer().await?;
        let Some(delivery) = consumer.receive(timeout).await? else {
            return Ok(None);
        };

        let message = delivery.message();
        let payload: &[u8] = match &message.body {
            WireBody::Bytes(bytes) => bytes,
            WireBody::Text(text) => text.as_bytes(),
            other => {
                warn!(
                    broker_message_id = %delivery.broker_message_id(),
                    shape = other.shape(),
                    "Rejected broker message with unsupported body"
                );
                return Err(OutboxError::unsupported_message_type(other.shape()));
            }
        };

        if let Some(expected) = message.property(PROPERTY_CHECKSUM) {
            let actual = payload_checksum(payload);
            if actual != expected {
                return Err(OutboxError::serialization(format!(
                    "checksum mismatch for broker message {}: expected {expected}, computed {actual}",
                    delivery.broker_message_id()
                )));
            }
        }

        let entity = T::from_bytes(payload)?;
        let sender = match message.property(PROPERTY_SENDER) {
            Some(record) => SenderIdentity::from_record(record)?,
            None => SenderIdentity::anonymous(),
        };
        let payload_type = message.property(PROPERTY_PAYLOAD_TYPE).map(str::to_string);

        self.audit(
            AuditKind::Receive,
            payload_type.as_deref().unwrap_or(T::type_name()),
            payload,
            &sender,
        )
        .await?;

        let broker_message_id = delivery.broker_message_id().to_string();
        if !self.connection.auto_acknowledge() {
            if self.descriptor.auto_acknowledge() {
                delivery.acknowledge().await?;
            } else {
                self.unacknowledged
                    .insert(broker_message_id.clone(), delivery);
            }
        }

        Ok(Some(ReceivedMessage {
            broker_message_id,
            entity,
            sender,
            payload_type,
            received_at: Utc::now(),
        }))
    }

    /// Collect up to `max_results` messages
    ///
    /// Each individual receive waits up to the full `timeout`; collection stops
    /// once `max_results` are held or more than `timeout` has elapsed overall.
    /// An error after at least one message was collected ends the batch early
    /// and the collected messages are returned.
    pub async fn receive_batch<T: QueueMessage>(
        &self,
        max_results: usize,
        timeout: Duration,
    ) -> OutboxResult<Vec<ReceivedMessage<T>>> {
        let started = Instant::now();
        let mut collected = Vec::with_capacity(max_results);

        while collected.len() < max_results && started.elapsed() <= timeout {
            match self.receive::<T>(timeout).await {
                Ok(Some(message)) => collected.push(message),
                Ok(None) => {}
                Err(e) if collected.is_empty() => return Err(e),
                Err(e) => {
                    warn!(
                        queue = %self.descriptor.name(),
                        collected = collected.len(),
                        error = %e,
                        "Receive failed mid-batch, returning partial batch"
                    );
                    break;
                }
            }
        }

        Ok(collected)
    }

    /// Acknowledge a cached delivery
    ///
    /// Returns `false` when the id is unknown or was already acknowledged.
    pub async fn ack(&self, broker_message_id: &str) -> OutboxResult<bool> {
        let Some((id, delivery)) = self.unacknowledged.remove(broker_message_id) else {
            return Ok(false);
        };

        match delivery.acknowledge().await {
            Ok(()) => Ok(true),
            Err(e) => {
                self.unacknowledged.insert(id, delivery);
                Err(e)
            }
        }
    }

    /// Close producer, consumer, session and connection
    ///
    /// Every handle is attempted; the first failure is returned afterwards.
    /// Closing an already closed adapter is a no-op.
    pub async fn close(&self) -> OutboxResult<()> {
        let mut handles = self.handles.lock().await;
        if handles.closed {
            return Ok(());
        }
        handles.closed = true;

        let mut first_error: Option<OutboxError> = None;
        let mut record = |result: OutboxResult<()>, handle: &str| {
            if let Err(e) = result {
                warn!(queue = %self.descriptor.name(), handle, error = %e, "Failed to close broker handle");
                first_error.get_or_insert(e);
            }
        };

        if let Some(producer) = handles.producer.take() {
            record(producer.close().await, "producer");
        }
        if let Some(consumer) = handles.consumer.take() {
            record(consumer.close().await, "consumer");
        }
        if let Some(session) = handles.session.take() {
            record(session.close().await, "session");
        }
        record(self.connection.close().await, "connection");

        let dropped = self.unacknowledged.len();
        self.unacknowledged.clear();
        debug!(queue = %self.descriptor.name(), dropped_receipts = dropped, "Broker adapter closed");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
