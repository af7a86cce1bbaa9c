//! # In-Memory Broker
//!
//! Thread-safe in-memory implementation of the broker contract for testing and
//! development.
//!
//! ## Features
//!
//! - **FIFO destinations**: one queue per destination name, created on first use
//! - **Blocking receive**: consumers park on a `Notify` until a message arrives or the timeout passes
//! - **Manual acknowledgement**: in manual mode received messages stay in flight until acknowledged
//! - **Fault injection**: `fail_next_sends` and `inject` for exercising error paths

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use super::broker::{BrokerConnection, BrokerSession, Delivery, MessageConsumer, MessageProducer};
use super::wire::WireMessage;
use crate::error::{OutboxError, OutboxResult};

#[derive(Debug, Clone)]
struct StoredMessage {
    seq: u64,
    id: String,
    message: WireMessage,
}

#[derive(Debug, Default)]
struct Destination {
    ready: VecDeque<StoredMessage>,
    in_flight: HashMap<String, StoredMessage>,
    acknowledged: u64,
}

#[derive(Debug, Default)]
struct BrokerState {
    destinations: Mutex<HashMap<String, Destination>>,
    next_id: AtomicU64,
    fail_next_sends: AtomicU32,
    arrivals: Notify,
}

impl BrokerState {
    fn enqueue(&self, destination: &str, message: WireMessage) -> String {
        let seq = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("mem-{seq}");
        self.destinations
            .lock()
            .entry(destination.to_string())
            .or_default()
            .ready
            .push_back(StoredMessage {
                seq,
                id: id.clone(),
                message,
            });
        self.arrivals.notify_waiters();
        id
    }

    fn take(&self, destination: &str, auto_acknowledge: bool) -> Option<StoredMessage> {
        let mut destinations = self.destinations.lock();
        let queue = destinations.get_mut(destination)?;
        let stored = queue.ready.pop_front()?;
        if auto_acknowledge {
            queue.acknowledged += 1;
        } else {
            queue.in_flight.insert(stored.id.clone(), stored.clone());
        }
        Some(stored)
    }
}

/// Shared in-memory broker; clones observe the same destinations
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a connection; `auto_acknowledge` selects the acknowledgement mode
    pub fn connect(&self, auto_acknowledge: bool) -> InMemoryConnection {
        InMemoryConnection {
            state: Arc::clone(&self.state),
            auto_acknowledge,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Enqueue a raw wire message, bypassing any producer (for testing)
    pub fn inject(&self, destination: &str, message: WireMessage) -> String {
        self.state.enqueue(destination, message)
    }

    /// Make the next `count` producer sends fail with a transport error
    pub fn fail_next_sends(&self, count: u32) {
        self.state.fail_next_sends.store(count, Ordering::SeqCst);
    }

    /// Messages waiting to be received
    pub fn pending(&self, destination: &str) -> usize {
        self.state
            .destinations
            .lock()
            .get(destination)
            .map(|d| d.ready.len())
            .unwrap_or(0)
    }

    /// Messages received in manual mode and not yet acknowledged
    pub fn in_flight(&self, destination: &str) -> usize {
        self.state
            .destinations
            .lock()
            .get(destination)
            .map(|d| d.in_flight.len())
            .unwrap_or(0)
    }

    pub fn acknowledged(&self, destination: &str) -> u64 {
        self.state
            .destinations
            .lock()
            .get(destination)
            .map(|d| d.acknowledged)
            .unwrap_or(0)
    }

    /// Return every in-flight message to the head of its destination
    pub fn recover(&self, destination: &str) -> usize {
        let recovered = {
            let mut destinations = self.state.destinations.lock();
            let Some(queue) = destinations.get_mut(destination) else {
                return 0;
            };
            let mut returned: Vec<StoredMessage> = queue.in_flight.drain().map(|(_, m)| m).collect();
            returned.sort_by(|a, b| b.seq.cmp(&a.seq));
            let count = returned.len();
            for message in returned {
                queue.ready.push_front(message);
            }
            count
        };
        if recovered > 0 {
            self.state.arrivals.notify_waiters();
        }
        recovered
    }
}

fn ensure_open(closed: &AtomicBool, operation: &str, handle: &str) -> OutboxResult<()> {
    if closed.load(Ordering::Acquire) {
        return Err(OutboxError::transport(
            operation,
            format!("{handle} is closed"),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct InMemoryConnection {
    state: Arc<BrokerState>,
    auto_acknowledge: bool,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    type Session = InMemorySession;

    async fn create_session(&self) -> OutboxResult<Self::Session> {
        ensure_open(&self.closed, "create_session", "connection")?;
        Ok(InMemorySession {
            state: Arc::clone(&self.state),
            auto_acknowledge: self.auto_acknowledge,
            closed: AtomicBool::new(false),
        })
    }

    fn auto_acknowledge(&self) -> bool {
        self.auto_acknowledge
    }

    async fn close(&self) -> OutboxResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        "in_memory"
    }
}

#[derive(Debug)]
pub struct InMemorySession {
    state: Arc<BrokerState>,
    auto_acknowledge: bool,
    closed: AtomicBool,
}

#[async_trait]
impl BrokerSession for InMemorySession {
    type Producer = InMemoryProducer;
    type Consumer = InMemoryConsumer;

    async fn create_producer(&self, destination: &str) -> OutboxResult<Self::Producer> {
        ensure_open(&self.closed, "create_producer", "session")?;
        Ok(InMemoryProducer {
            state: Arc::clone(&self.state),
            destination: destination.to_string(),
            closed: AtomicBool::new(false),
        })
    }

    async fn create_consumer(&self, destination: &str) -> OutboxResult<Self::Consumer> {
        ensure_open(&self.closed, "create_consumer", "session")?;
        Ok(InMemoryConsumer {
            state: Arc::clone(&self.state),
            destination: destination.to_string(),
            auto_acknowledge: self.auto_acknowledge,
            closed: AtomicBool::new(false),
        })
    }

    async fn close(&self) -> OutboxResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[derive(Debug)]
pub struct InMemoryProducer {
    state: Arc<BrokerState>,
    destination: String,
    closed: AtomicBool,
}

#[async_trait]
impl MessageProducer for InMemoryProducer {
    async fn send(&self, message: WireMessage) -> OutboxResult<String> {
        ensure_open(&self.closed, "send", "producer")?;

        let injected_failure = self
            .state
            .fail_next_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected_failure {
            return Err(OutboxError::transport(
                "send",
                format!("injected send failure for {}", self.destination),
            ));
        }

        let id = self.state.enqueue(&self.destination, message);
        debug!(destination = %self.destination, message_id = %id, "In-memory broker accepted message");
        Ok(id)
    }

    async fn close(&self) -> OutboxResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[derive(Debug)]
pub struct InMemoryConsumer {
    state: Arc<BrokerState>,
    destination: String,
    auto_acknowledge: bool,
    closed: AtomicBool,
}

#[async_trait]
impl MessageConsumer for InMemoryConsumer {
    type Delivery = InMemoryDelivery;

    async fn receive(&self, timeout: Duration) -> OutboxResult<Option<Self::Delivery>> {
        ensure_open(&self.closed, "receive", "consumer")?;
        let deadline = Instant::now() + timeout;

        loop {
            // Register interest before checking so an enqueue in between is not missed
            let notified = self.state.arrivals.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(stored) = self.state.take(&self.destination, self.auto_acknowledge) {
                let acknowledger = (!self.auto_acknowledge).then(|| Acknowledger {
                    state: Arc::clone(&self.state),
                    destination: self.destination.clone(),
                });
                return Ok(Some(InMemoryDelivery {
                    id: stored.id,
                    message: stored.message,
                    acknowledger,
                }));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
            ensure_open(&self.closed, "receive", "consumer")?;
        }
    }

    async fn close(&self) -> OutboxResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[derive(Debug)]
struct Acknowledger {
    state: Arc<BrokerState>,
    destination: String,
}

#[derive(Debug)]
pub struct InMemoryDelivery {
    id: String,
    message: WireMessage,
    /// Present only for manual-acknowledge deliveries
    acknowledger: Option<Acknowledger>,
}

#[async_trait]
impl Delivery for InMemoryDelivery {
    fn broker_message_id(&self) -> &str {
        &self.id
    }

    fn message(&self) -> &WireMessage {
        &self.message
    }

    async fn acknowledge(&self) -> OutboxResult<()> {
        let Some(acknowledger) = &self.acknowledger else {
            return Ok(());
        };
        let mut destinations = acknowledger.state.destinations.lock();
        let queue = destinations
            .get_mut(&acknowledger.destination)
            .ok_or_else(|| {
                OutboxError::transport(
                    "acknowledge",
                    format!("unknown destination {}", acknowledger.destination),
                )
            })?;
        if queue.in_flight.remove(&self.id).is_none() {
            return Err(OutboxError::transport(
                "acknowledge",
                format!("message {} is not in flight", self.id),
            ));
        }
        queue.acknowledged += 1;
        Ok(())
    }
}
