use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::worker::{DispatchReport, PartitionWorker};
use crate::error::{OutboxError, OutboxResult};
use crate::logging::log_error;
use crate::messaging::{BrokerAdapter, BrokerConnection, QueueMessage};
use crate::queue::QueueDescriptor;
use crate::store::StagedMessageStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    Stopped,
    Running,
    Stopping,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerState::Stopped => f.write_str("stopped"),
            SchedulerState::Running => f.write_str("running"),
            SchedulerState::Stopping => f.write_str("stopping"),
        }
    }
}

struct WorkerHandle {
    partition: i32,
    instance_id: String,
    join: JoinHandle<()>,
}

struct RunningWorkers {
    shutdown: watch::Sender<bool>,
    workers: Vec<WorkerHandle>,
}

/// Runs one dispatch worker per partition of a queue
pub struct DispatchScheduler<T, S, C>
where
    S: StagedMessageStore,
    C: BrokerConnection,
{
    descriptor: Arc<QueueDescriptor>,
    store: Arc<S>,
    adapter: Arc<BrokerAdapter<C>>,
    state: Mutex<SchedulerState>,
    running: Mutex<Option<RunningWorkers>>,
    _entity: PhantomData<fn() -> T>,
}

impl<T, S, C> DispatchScheduler<T, S, C>
where
    T: QueueMessage,
    S: StagedMessageStore,
    C: BrokerConnection,
{
    pub fn new(
        descriptor: Arc<QueueDescriptor>,
        store: Arc<S>,
        adapter: Arc<BrokerAdapter<C>>,
    ) -> Self {
        Self {
            descriptor,
            store,
            adapter,
            state: Mutex::new(SchedulerState::Stopped),
            running: Mutex::new(None),
            _entity: PhantomData,
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.lock()
    }

    /// `(partition, instance_id)` of every running worker
    pub fn worker_instances(&self) -> Vec<(i32, String)> {
        self.running
            .lock()
            .as_ref()
            .map(|running| {
                running
                    .workers
                    .iter()
                    .map(|w| (w.partition, w.instance_id.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Spawn one worker task per partition
    ///
    /// Must be called from within a tokio runtime. Fails with `StateError`
    /// unless the scheduler is stopped.
    pub fn start(&self) -> OutboxResult<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            OutboxError::configuration(format!("dispatch scheduler requires a tokio runtime: {e}"))
        })?;

        let mut state = self.state.lock();
        if *state != SchedulerState::Stopped {
            return Err(OutboxError::state(self.descriptor.name(), *state));
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let workers = self
            .descriptor
            .partitions()
            .map(|partition| {
                let worker = PartitionWorker::<T, S, C>::new(
                    partition,
                    Arc::clone(&self.descriptor),
                    Arc::clone(&self.store),
                    Arc::clone(&self.adapter),
                );
                let instance_id = worker.instance_id().to_string();
                let join = runtime.spawn(worker.run(shutdown_rx.clone()));
                WorkerHandle {
                    partition,
                    instance_id,
                    join,
                }
            })
            .collect::<Vec<_>>();

        info!(
            queue = %self.descriptor.name(),
            partitions = workers.len(),
            "Dispatch scheduler started"
        );

        *self.running.lock() = Some(RunningWorkers { shutdown, workers });
        *state = SchedulerState::Running;
        Ok(())
    }

    /// Signal every worker, wait for in-flight firings, release their claims
    ///
    /// Stopping a stopped scheduler is a no-op. The first release failure is
    /// returned after the scheduler reached `Stopped`. Dropping the future
    /// part way still leaves the scheduler `Stopped`, but claims of the
    /// interrupted workers stay owned until their instance ids are released.
    pub async fn stop(&self) -> OutboxResult<()> {
        let running = {
            let mut state = self.state.lock();
            match *state {
                SchedulerState::Stopped => return Ok(()),
                SchedulerState::Stopping => {
                    return Err(OutboxError::state(self.descriptor.name(), *state))
                }
                SchedulerState::Running => *state = SchedulerState::Stopping,
            }
            self.running.lock().take()
        };
        let mut stopping = StoppingGuard {
            state: &self.state,
            queue: self.descriptor.name(),
            completed: false,
        };

        let mut first_error = None;
        if let Some(running) = running {
            // Receivers may already be gone if every worker exited
            let _ = running.shutdown.send(true);

            let (joins, workers): (Vec<_>, Vec<_>) = running
                .workers
                .into_iter()
                .map(|w| (w.join, (w.partition, w.instance_id)))
                .unzip();

            for (result, (partition, _)) in join_all(joins).await.into_iter().zip(&workers) {
                if let Err(e) = result {
                    error!(
                        queue = %self.descriptor.name(),
                        partition = *partition,
                        error = %e,
                        "Dispatch worker terminated abnormally"
                    );
                }
            }

            for (partition, instance_id) in workers {
                match self
                    .store
                    .release(self.descriptor.name(), &instance_id)
                    .await
                {
                    Ok(0) => {}
                    Ok(released) => info!(
                        queue = %self.descriptor.name(),
                        partition,
                        released,
                        "Released claims of stopped worker"
                    ),
                    Err(e) => {
                        log_error("dispatch", "release", &e.to_string(), Some(&instance_id));
                        first_error.get_or_insert(e);
                    }
                }
            }
        }

        stopping.completed = true;
        drop(stopping);
        info!(queue = %self.descriptor.name(), "Dispatch scheduler stopped");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Run a single firing for one partition on demand
    ///
    /// Uses a transient worker incarnation, independent of any running worker.
    pub async fn dispatch_partition_once(&self, partition: i32) -> OutboxResult<DispatchReport> {
        if partition < 0 || partition as u32 >= self.descriptor.partition_count() {
            return Err(OutboxError::configuration(format!(
                "queue '{}' has no partition {partition}",
                self.descriptor.name()
            )));
        }

        let worker = PartitionWorker::<T, S, C>::new(
            partition,
            Arc::clone(&self.descriptor),
            Arc::clone(&self.store),
            Arc::clone(&self.adapter),
        );
        worker.fire().await
    }

    /// One on-demand firing for every partition
    pub async fn dispatch_all_once(&self) -> OutboxResult<Vec<DispatchReport>> {
        let mut reports = Vec::with_capacity(self.descriptor.partition_count() as usize);
        for partition in self.descriptor.partitions() {
            reports.push(self.dispatch_partition_once(partition).await?);
        }
        Ok(reports)
    }
}

/// Returns the scheduler to `Stopped` even when `stop` is cancelled
struct StoppingGuard<'a> {
    state: &'a Mutex<SchedulerState>,
    queue: &'a str,
    completed: bool,
}

impl Drop for StoppingGuard<'_> {
    fn drop(&mut self) {
        *self.state.lock() = SchedulerState::Stopped;
        if !self.completed {
            warn!(
                queue = %self.queue,
                "Dispatch scheduler stop was cancelled before claims were released"
            );
        }
    }
}
