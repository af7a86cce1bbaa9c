use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::OutboxResult;
use crate::logging::{log_dispatch_operation, log_error};
use crate::messaging::{BrokerAdapter, BrokerConnection, QueueMessage};
use crate::queue::QueueDescriptor;
use crate::store::{ClaimRequest, DispatchOutcomes, StagedMessageStore};

/// Counts from one firing of a partition worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub partition: i32,
    pub claimed: usize,
    pub sent: usize,
    pub failed: usize,
}

/// Dispatch loop for a single partition
///
/// Each worker incarnation gets a fresh `instance_id`, recorded as the owner
/// of every row it claims.
pub struct PartitionWorker<T, S, C>
where
    S: StagedMessageStore,
    C: BrokerConnection,
{
    partition: i32,
    instance_id: String,
    descriptor: Arc<QueueDescriptor>,
    store: Arc<S>,
    adapter: Arc<BrokerAdapter<C>>,
    _entity: PhantomData<fn() -> T>,
}

impl<T, S, C> PartitionWorker<T, S, C>
where
    T: QueueMessage,
    S: StagedMessageStore,
    C: BrokerConnection,
{
    pub fn new(
        partition: i32,
        descriptor: Arc<QueueDescriptor>,
        store: Arc<S>,
        adapter: Arc<BrokerAdapter<C>>,
    ) -> Self {
        Self {
            partition,
            instance_id: Uuid::new_v4().to_string(),
            descriptor,
            store,
            adapter,
            _entity: PhantomData,
        }
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Claim, send and report one batch
    pub async fn fire(&self) -> OutboxResult<DispatchReport> {
        let request = ClaimRequest {
            queue_name: self.descriptor.name().to_string(),
            partition: self.partition,
            instance_id: self.instance_id.clone(),
            batch_size: self.descriptor.batch_size(),
        };

        let claimed = self.store.claim_batch::<T>(&request).await?;
        let mut report = DispatchReport {
            partition: self.partition,
            claimed: claimed.len(),
            ..DispatchReport::default()
        };
        if claimed.is_empty() {
            debug!(queue = %self.descriptor.name(), partition = self.partition, "Nothing to dispatch");
            return Ok(report);
        }

        let mut outcomes = DispatchOutcomes::default();
        for message in &claimed {
            match self.adapter.send(&message.entity, &message.sender).await {
                Ok(_) => outcomes.record_sent(&message.message_id),
                Err(e) => {
                    warn!(
                        queue = %self.descriptor.name(),
                        partition = self.partition,
                        message_id = %message.message_id,
                        error = %e,
                        "Failed to send staged message"
                    );
                    outcomes.record_failed(&message.message_id, e.to_string());
                }
            }
        }
        report.sent = outcomes.sent.len();
        report.failed = outcomes.failed.len();

        if let Err(e) = self.store.report_outcomes(&self.instance_id, &outcomes).await {
            // Hand the rows back so another firing retries them
            if let Err(release_error) = self
                .store
                .release(self.descriptor.name(), &self.instance_id)
                .await
            {
                log_error(
                    "dispatch",
                    "release",
                    &release_error.to_string(),
                    Some(self.descriptor.name()),
                );
            }
            return Err(e);
        }

        log_dispatch_operation(
            self.descriptor.name(),
            self.partition,
            &self.instance_id,
            report.claimed,
            report.sent,
            report.failed,
        );
        Ok(report)
    }

    /// Fire on the queue's schedule until the shutdown flag is raised
    ///
    /// The first firing happens after `start_delay`, then every
    /// `dispatch_interval`. A firing in progress always completes before the
    /// loop observes shutdown. Firing errors are logged and the loop continues.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let start = Instant::now() + self.descriptor.start_delay();
        let mut timer = interval_at(start, self.descriptor.dispatch_interval());
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            queue = %self.descriptor.name(),
            partition = self.partition,
            instance_id = %self.instance_id,
            start_delay_ms = self.descriptor.start_delay().as_millis() as u64,
            interval_ms = self.descriptor.dispatch_interval().as_millis() as u64,
            "Starting partition dispatch worker"
        );

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    // Woken without the stop flag, keep waiting for the next tick
                    continue;
                }
                _ = timer.tick() => {
                    if let Err(e) = self.fire().await {
                        log_error(
                            "dispatch",
                            "fire",
                            &e.to_string(),
                            Some(self.descriptor.name()),
                        );
                    }
                }
            }
        }

        info!(
            queue = %self.descriptor.name(),
            partition = self.partition,
            instance_id = %self.instance_id,
            "Partition dispatch worker stopped"
        );
    }
}
