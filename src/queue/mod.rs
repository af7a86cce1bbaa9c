//! # Outbox Queue
//!
//! [`OutboxQueue`] is the application-facing handle for one logical queue. It
//! stages outbound entities into the store inside the caller's transaction,
//! owns the dispatch scheduler that relays them, and exposes the inbound
//! receive/ack path of the broker adapter.
//!
//! ## Lifecycle
//!
//! ```text
//! Available ──dispose──> Disposed
//! ```
//!
//! Every operation on a disposed queue fails with `StateError`.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tasker_outbox::config::QueueSettings;
//! use tasker_outbox::messaging::InMemoryBroker;
//! use tasker_outbox::models::SenderIdentity;
//! use tasker_outbox::queue::OutboxQueue;
//! use tasker_outbox::store::{InMemoryStagedMessageStore, StagedMessageStore};
//!
//! #[derive(Clone, serde::Serialize, serde::Deserialize)]
//! struct OrderPlaced { order_id: u64 }
//!
//! # async fn example() -> tasker_outbox::OutboxResult<()> {
//! let store = Arc::new(InMemoryStagedMessageStore::new());
//! let broker = InMemoryBroker::new();
//! let queue = OutboxQueue::<OrderPlaced, _, _>::from_settings(
//!     &QueueSettings::named("orders"),
//!     Arc::clone(&store),
//!     broker.connect(false),
//!     None,
//! )?;
//!
//! let mut tx = store.begin().await?;
//! queue.stage(&mut tx, &OrderPlaced { order_id: 7 }, &SenderIdentity::new("checkout")).await?;
//! store.commit(tx).await?;
//!
//! queue.start()?;
//! // ...
//! queue.dispose().await?;
//! # Ok(())
//! # }
//! ```

pub mod descriptor;
pub mod partition;

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, instrument};

use crate::audit::AuditHook;
use crate::config::QueueSettings;
use crate::dispatch::{DispatchReport, DispatchScheduler, SchedulerState};
use crate::error::{OutboxError, OutboxResult};
use crate::messaging::{BrokerAdapter, BrokerConnection, QueueMessage, ReceivedMessage};
use crate::models::{NewStagedMessage, SenderIdentity, StagedMessage, StateCounts};
use crate::store::StagedMessageStore;

pub use descriptor::QueueDescriptor;
pub use partition::{partition_for_current_thread, partition_for_key};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueState {
    Available,
    Disposed,
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueState::Available => f.write_str("available"),
            QueueState::Disposed => f.write_str("disposed"),
        }
    }
}

pub struct OutboxQueue<T, S, C>
where
    S: StagedMessageStore,
    C: BrokerConnection,
{
    descriptor: Arc<QueueDescriptor>,
    store: Arc<S>,
    adapter: Arc<BrokerAdapter<C>>,
    scheduler: DispatchScheduler<T, S, C>,
    state: RwLock<QueueState>,
    _entity: PhantomData<fn() -> T>,
}

impl<T, S, C> OutboxQueue<T, S, C>
where
    T: QueueMessage,
    S: StagedMessageStore,
    C: BrokerConnection,
{
    pub fn new(
        descriptor: QueueDescriptor,
        store: Arc<S>,
        connection: C,
        audit: Option<Arc<dyn AuditHook>>,
    ) -> Self {
        let descriptor = Arc::new(descriptor);
        let adapter = Arc::new(BrokerAdapter::new(
            connection,
            Arc::clone(&descriptor),
            audit,
        ));
        let scheduler =
            DispatchScheduler::new(Arc::clone(&descriptor), Arc::clone(&store), Arc::clone(&adapter));

        info!(
            queue = %descriptor.name(),
            partitions = descriptor.partition_count(),
            payload_type = %descriptor.payload_type(),
            "Outbox queue available"
        );

        Self {
            descriptor,
            store,
            adapter,
            scheduler,
            state: RwLock::new(QueueState::Available),
            _entity: PhantomData,
        }
    }

    /// Build from configuration; `payload_type` defaults to the Rust type name of `T`
    pub fn from_settings(
        settings: &QueueSettings,
        store: Arc<S>,
        connection: C,
        audit: Option<Arc<dyn AuditHook>>,
    ) -> OutboxResult<Self> {
        let descriptor = QueueDescriptor::from_settings(settings, T::type_name())?;
        Ok(Self::new(descriptor, store, connection, audit))
    }

    pub fn descriptor(&self) -> &QueueDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> QueueState {
        *self.state.read()
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    pub fn adapter(&self) -> &BrokerAdapter<C> {
        &self.adapter
    }

    fn ensure_available(&self) -> OutboxResult<()> {
        match *self.state.read() {
            QueueState::Available => Ok(()),
            state => Err(OutboxError::state(self.descriptor.name(), state)),
        }
    }

    async fn stage_in_partition(
        &self,
        tx: &mut S::Transaction,
        entity: &T,
        identity: &SenderIdentity,
        partition: i32,
    ) -> OutboxResult<StagedMessage> {
        self.ensure_available()?;
        let payload = entity.to_bytes()?;
        self.store
            .insert(
                tx,
                NewStagedMessage {
                    queue_name: self.descriptor.name().to_string(),
                    partition,
                    payload,
                    payload_type: self.descriptor.payload_type().to_string(),
                    sender_identity: identity.clone(),
                },
            )
            .await
    }

    /// Stage an entity inside the caller's transaction
    ///
    /// The partition is derived from the current thread. The message becomes
    /// eligible for dispatch once `tx` commits.
    #[instrument(skip_all, fields(queue = %self.descriptor.name()))]
    pub async fn stage(
        &self,
        tx: &mut S::Transaction,
        entity: &T,
        identity: &SenderIdentity,
    ) -> OutboxResult<StagedMessage> {
        let partition = partition_for_current_thread(self.descriptor.partition_count());
        self.stage_in_partition(tx, entity, identity, partition).await
    }

    /// Stage with the partition derived from `partition_key`
    pub async fn stage_with_partition_key(
        &self,
        tx: &mut S::Transaction,
        entity: &T,
        identity: &SenderIdentity,
        partition_key: &str,
    ) -> OutboxResult<StagedMessage> {
        let partition = partition_for_key(partition_key, self.descriptor.partition_count());
        self.stage_in_partition(tx, entity, identity, partition).await
    }

    async fn send_in_partition(
        &self,
        entity: &T,
        identity: &SenderIdentity,
        partition: i32,
    ) -> OutboxResult<StagedMessage> {
        self.ensure_available()?;
        let mut tx = self.store.begin().await?;
        match self.stage_in_partition(&mut tx, entity, identity, partition).await {
            Ok(staged) => {
                self.store.commit(tx).await?;
                Ok(staged)
            }
            Err(e) => {
                if let Err(rollback_error) = self.store.rollback(tx).await {
                    tracing::warn!(
                        queue = %self.descriptor.name(),
                        error = %rollback_error,
                        "Rollback after failed stage also failed"
                    );
                }
                Err(e)
            }
        }
    }

    /// Stage an entity in a transaction of its own
    pub async fn send(&self, entity: &T, identity: &SenderIdentity) -> OutboxResult<StagedMessage> {
        let partition = partition_for_current_thread(self.descriptor.partition_count());
        self.send_in_partition(entity, identity, partition).await
    }

    pub async fn send_with_partition_key(
        &self,
        entity: &T,
        identity: &SenderIdentity,
        partition_key: &str,
    ) -> OutboxResult<StagedMessage> {
        let partition = partition_for_key(partition_key, self.descriptor.partition_count());
        self.send_in_partition(entity, identity, partition).await
    }

    pub async fn receive(&self, timeout: Duration) -> OutboxResult<Option<ReceivedMessage<T>>> {
        self.ensure_available()?;
        self.adapter.receive(timeout).await
    }

    /// Receive with the queue's configured timeout
    pub async fn receive_default(&self) -> OutboxResult<Option<ReceivedMessage<T>>> {
        self.receive(self.descriptor.receive_timeout()).await
    }

    pub async fn receive_batch(
        &self,
        max_results: usize,
        timeout: Duration,
    ) -> OutboxResult<Vec<ReceivedMessage<T>>> {
        self.ensure_available()?;
        self.adapter.receive_batch(max_results, timeout).await
    }

    /// Acknowledge a received message; `false` when unknown or already acknowledged
    pub async fn ack(&self, broker_message_id: &str) -> OutboxResult<bool> {
        self.ensure_available()?;
        self.adapter.ack(broker_message_id).await
    }

    /// Start the partition dispatch workers
    pub fn start(&self) -> OutboxResult<()> {
        self.ensure_available()?;
        self.scheduler.start()
    }

    /// Run one firing per partition immediately
    pub async fn flush(&self) -> OutboxResult<Vec<DispatchReport>> {
        self.ensure_available()?;
        self.scheduler.dispatch_all_once().await
    }

    pub async fn state_counts(&self) -> OutboxResult<StateCounts> {
        self.store.state_counts(self.descriptor.name()).await
    }

    /// Stop dispatch, close the broker adapter, and mark the queue disposed
    ///
    /// Waits for in-flight firings. Disposing twice is a no-op.
    pub async fn dispose(&self) -> OutboxResult<()> {
        {
            let mut state = self.state.write();
            if *state == QueueState::Disposed {
                return Ok(());
            }
            *state = QueueState::Disposed;
        }

        let stopped = self.scheduler.stop().await;
        let closed = self.adapter.close().await;
        info!(queue = %self.descriptor.name(), "Outbox queue disposed");

        stopped.and(closed)
    }
}
