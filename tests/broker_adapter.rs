//! Inbound path and broker adapter behaviour against the in-memory broker

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::*;
use tasker_outbox::audit::{AuditHook, AuditKind};
use tasker_outbox::messaging::{
    BrokerAdapter, BrokerConnection, BrokerSession, InMemoryBroker, InMemoryConnection,
    MessageProducer, WireBody, WireMessage,
};
use tasker_outbox::models::SenderIdentity;
use tasker_outbox::queue::OutboxQueue;
use tasker_outbox::store::InMemoryStagedMessageStore;
use tasker_outbox::{OutboxError, QueueDescriptor, QueueMessage, QueueState};

fn adapter(
    broker: &InMemoryBroker,
    name: &str,
    auto_ack: bool,
    audit: Option<Arc<dyn AuditHook>>,
) -> BrokerAdapter<InMemoryConnection> {
    let mut settings = manual_settings(name, 1);
    settings.auto_ack = auto_ack;
    settings.audit_enabled = audit.is_some();
    let descriptor = QueueDescriptor::from_settings(&settings, OrderPlaced::type_name()).unwrap();
    BrokerAdapter::new(broker.connect(auto_ack), Arc::new(descriptor), audit)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_receive_batch_returns_early_when_full() {
    let broker = InMemoryBroker::new();
    let name = unique_name("orders");
    let consumer = adapter(&broker, &name, false, None);

    let producer_broker = broker.clone();
    let producer_name = name.clone();
    let producer = tokio::spawn(async move {
        let session = producer_broker
            .connect(true)
            .create_session()
            .await
            .unwrap();
        let producer = session.create_producer(&producer_name).await.unwrap();
        for order_id in 0..5u64 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let payload = OrderPlaced::new(order_id).to_bytes().unwrap();
            producer.send(WireMessage::bytes(payload)).await.unwrap();
        }
    });

    let started = Instant::now();
    let batch = consumer
        .receive_batch::<OrderPlaced>(5, Duration::from_secs(2))
        .await
        .unwrap();
    let elapsed = started.elapsed();
    producer.await.unwrap();

    assert_eq!(batch.len(), 5);
    assert!(elapsed < Duration::from_millis(1500), "took {elapsed:?}");
    assert_eq!(consumer.unacknowledged_count(), 5);
}

#[tokio::test]
async fn test_receive_batch_on_empty_destination_times_out() {
    let broker = InMemoryBroker::new();
    let consumer = adapter(&broker, &unique_name("orders"), true, None);

    let started = Instant::now();
    let batch = consumer
        .receive_batch::<OrderPlaced>(3, Duration::from_millis(100))
        .await
        .unwrap();

    assert!(batch.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[tokio::test]
async fn test_ack_of_unknown_id_is_false() {
    let broker = InMemoryBroker::new();
    let consumer = adapter(&broker, &unique_name("orders"), false, None);
    assert!(!consumer.ack("unknown-id").await.unwrap());
}

#[tokio::test]
async fn test_ack_is_idempotent() {
    let broker = InMemoryBroker::new();
    let name = unique_name("orders");
    let adapter = adapter(&broker, &name, false, None);

    adapter
        .send(&OrderPlaced::new(1), &SenderIdentity::new("checkout"))
        .await
        .unwrap();
    let received = adapter
        .receive::<OrderPlaced>(Duration::from_millis(100))
        .await
        .unwrap()
        .expect("message delivered");
    assert_eq!(broker.in_flight(&name), 1);

    assert!(adapter.ack(&received.broker_message_id).await.unwrap());
    assert!(!adapter.ack(&received.broker_message_id).await.unwrap());
    assert_eq!(broker.in_flight(&name), 0);
    assert_eq!(broker.acknowledged(&name), 1);
    assert_eq!(adapter.unacknowledged_count(), 0);
}

#[tokio::test]
async fn test_unsupported_body_shape_is_rejected() {
    let broker = InMemoryBroker::new();
    let name = unique_name("orders");
    let consumer = adapter(&broker, &name, true, None);

    broker.inject(
        &name,
        WireMessage {
            body: WireBody::Map(BTreeMap::from([(
                "order_id".to_string(),
                serde_json::json!(1),
            )])),
            properties: BTreeMap::new(),
        },
    );

    let err = consumer
        .receive::<OrderPlaced>(Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, OutboxError::UnsupportedMessageType { ref shape } if shape == "map"));
    assert!(err.is_transport());
}

#[tokio::test]
async fn test_audit_records_send_and_receive() {
    let broker = InMemoryBroker::new();
    let name = unique_name("orders");
    let hook = Arc::new(RecordingAuditHook::default());
    let adapter = adapter(&broker, &name, true, Some(hook.clone() as Arc<dyn AuditHook>));

    adapter
        .send(&OrderPlaced::new(3), &SenderIdentity::new("checkout"))
        .await
        .unwrap();
    let received = adapter
        .receive::<OrderPlaced>(Duration::from_millis(100))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(received.sender.principal, "checkout");
    assert_eq!(hook.kinds(), vec![AuditKind::Send, AuditKind::Receive]);
    assert!(hook
        .events
        .lock()
        .iter()
        .all(|(_, queue, principal)| queue == &name && principal == "checkout"));
}

#[tokio::test]
async fn test_audit_failure_surfaces_as_transport_error() {
    let broker = InMemoryBroker::new();
    let name = unique_name("orders");
    let hook: Arc<dyn AuditHook> = Arc::new(RecordingAuditHook::failing());
    let adapter = adapter(&broker, &name, true, Some(hook));

    let err = adapter
        .send(&OrderPlaced::new(4), &SenderIdentity::anonymous())
        .await
        .unwrap_err();
    assert!(matches!(err, OutboxError::TransportError { .. }));
    // the broker already accepted the message
    assert_eq!(broker.pending(&name), 1);
}

#[tokio::test]
async fn test_close_is_idempotent_and_drops_receipts() {
    let broker = InMemoryBroker::new();
    let name = unique_name("orders");
    let adapter = adapter(&broker, &name, false, None);

    adapter
        .send(&OrderPlaced::new(5), &SenderIdentity::anonymous())
        .await
        .unwrap();
    adapter
        .receive::<OrderPlaced>(Duration::from_millis(100))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(adapter.unacknowledged_count(), 1);

    adapter.close().await.unwrap();
    adapter.close().await.unwrap();
    assert_eq!(adapter.unacknowledged_count(), 0);

    let err = adapter
        .receive::<OrderPlaced>(Duration::from_millis(10))
        .await
        .unwrap_err();
    assert!(err.is_transport());
}

#[tokio::test]
async fn test_disposed_queue_rejects_operations() {
    let harness = Harness::new(&manual_settings(&unique_name("orders"), 2));
    harness.queue.dispose().await.unwrap();
    assert_eq!(harness.queue.state(), QueueState::Disposed);

    let err = harness
        .queue
        .send(&OrderPlaced::new(1), &SenderIdentity::anonymous())
        .await
        .unwrap_err();
    assert!(matches!(err, OutboxError::StateError { .. }));
    assert!(matches!(
        harness.queue.receive(Duration::from_millis(1)).await,
        Err(OutboxError::StateError { .. })
    ));
    assert!(matches!(
        harness.queue.ack("anything").await,
        Err(OutboxError::StateError { .. })
    ));
    assert!(harness.queue.start().is_err());

    // disposing again is harmless
    harness.queue.dispose().await.unwrap();
}

#[tokio::test]
async fn test_queue_round_trip_through_receive_default() {
    let mut settings = manual_settings(&unique_name("orders"), 1);
    settings.receive_timeout_ms = 200;
    let harness = Harness::new(&settings);

    harness
        .queue
        .send(&OrderPlaced::new(8), &SenderIdentity::new("checkout"))
        .await
        .unwrap();
    harness.queue.flush().await.unwrap();

    let received = harness.queue.receive_default().await.unwrap().unwrap();
    assert_eq!(received.entity, OrderPlaced::new(8));
    assert!(harness.queue.ack(&received.broker_message_id).await.unwrap());
    harness.queue.dispose().await.unwrap();
}

#[tokio::test]
async fn test_auto_ack_setting_controls_receive_mode() {
    let mut settings = manual_settings(&unique_name("orders"), 1);
    settings.auto_ack = true;
    settings.receive_timeout_ms = 200;
    let store = Arc::new(InMemoryStagedMessageStore::new());
    let broker = InMemoryBroker::new();
    let queue: TestQueue =
        OutboxQueue::from_settings(&settings, store, broker.connect(false), None).unwrap();
    assert!(queue.descriptor().auto_acknowledge());

    queue
        .send(&OrderPlaced::new(11), &SenderIdentity::new("checkout"))
        .await
        .unwrap();
    queue.flush().await.unwrap();
    let received = queue.receive_default().await.unwrap().unwrap();

    assert_eq!(received.entity, OrderPlaced::new(11));
    assert_eq!(queue.adapter().unacknowledged_count(), 0);
    assert_eq!(broker.in_flight(&settings.name), 0);
    assert_eq!(broker.acknowledged(&settings.name), 1);
    assert!(!queue.ack(&received.broker_message_id).await.unwrap());
    queue.dispose().await.unwrap();
}
