//! # In-Memory Staged Message Store
//!
//! Process-local store for tests and development. Transactions buffer staged
//! rows and apply them on commit; a dropped transaction discards its rows.
//! Claims hold the table lock for their whole duration, which gives the same
//! disjointness the Postgres store gets from `SKIP LOCKED`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{ClaimRequest, ClaimedMessage, DispatchOutcomes, OutcomeSummary, StagedMessageStore};
use crate::error::{OutboxError, OutboxResult};
use crate::messaging::QueueMessage;
use crate::models::{MessageState, NewStagedMessage, StagedMessage, StateCounts};

/// Rows staged inside an uncommitted unit of work
#[derive(Debug, Default)]
pub struct InMemoryTransaction {
    staged: Vec<StagedMessage>,
}

impl InMemoryTransaction {
    pub fn staged_count(&self) -> usize {
        self.staged.len()
    }
}

/// Rows in commit order. Claims take the oldest `created_at` first, with
/// commit order breaking ties.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStagedMessageStore {
    rows: Arc<Mutex<Vec<StagedMessage>>>,
}

impl InMemoryStagedMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every row of a queue (for testing)
    pub async fn rows(&self, queue_name: &str) -> Vec<StagedMessage> {
        self.rows
            .lock()
            .await
            .iter()
            .filter(|row| row.queue_name == queue_name)
            .cloned()
            .collect()
    }

    /// Overwrite a stored payload without updating its checksum (for testing)
    pub async fn corrupt_payload(&self, message_id: &str, payload: Vec<u8>) -> bool {
        let mut rows = self.rows.lock().await;
        match rows.iter_mut().find(|row| row.message_id == message_id) {
            Some(row) => {
                row.payload = payload;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl StagedMessageStore for InMemoryStagedMessageStore {
    type Transaction = InMemoryTransaction;

    async fn begin(&self) -> OutboxResult<Self::Transaction> {
        Ok(InMemoryTransaction::default())
    }

    async fn commit(&self, tx: Self::Transaction) -> OutboxResult<()> {
        if tx.staged.is_empty() {
            return Ok(());
        }
        let mut rows = self.rows.lock().await;
        for staged in &tx.staged {
            if rows.iter().any(|row| row.message_id == staged.message_id) {
                return Err(OutboxError::store(
                    "commit",
                    format!("duplicate message id {}", staged.message_id),
                ));
            }
        }
        rows.extend(tx.staged);
        Ok(())
    }

    async fn rollback(&self, tx: Self::Transaction) -> OutboxResult<()> {
        debug!(discarded = tx.staged.len(), "Rolled back in-memory transaction");
        Ok(())
    }

    async fn insert(
        &self,
        tx: &mut Self::Transaction,
        message: NewStagedMessage,
    ) -> OutboxResult<StagedMessage> {
        let staged = StagedMessage::stage(message)?;
        tx.staged.push(staged.clone());
        Ok(staged)
    }

    async fn claim_batch<T: QueueMessage>(
        &self,
        request: &ClaimRequest,
    ) -> OutboxResult<Vec<ClaimedMessage<T>>> {
        let limit = request.batch_size as usize;
        let mut rows = self.rows.lock().await;

        let mut eligible: Vec<usize> = rows
            .iter()
            .enumerate()
            .filter(|(_, row)| {
                row.queue_name == request.queue_name
                    && row.partition == request.partition
                    && row.is_claimable()
            })
            .map(|(index, _)| index)
            .collect();
        // stable sort keeps commit order among equal timestamps
        eligible.sort_by_key(|index| rows[*index].created_at);

        // at most `limit` rows are examined, so malformed rows shrink the batch
        let mut claimed = Vec::with_capacity(limit.min(eligible.len()));
        for index in eligible.into_iter().take(limit) {
            let row = &mut rows[index];
            match ClaimedMessage::<T>::decode(row) {
                Ok(message) => {
                    row.owner_instance_id = Some(request.instance_id.clone());
                    claimed.push(message);
                }
                Err(e) => {
                    warn!(
                        message_id = %row.message_id,
                        queue = %request.queue_name,
                        error = %e,
                        "Staged message failed verification during claim"
                    );
                    row.state = MessageState::Error;
                    row.error = Some(e.to_string());
                }
            }
        }

        Ok(claimed)
    }

    async fn report_outcomes(
        &self,
        instance_id: &str,
        outcomes: &DispatchOutcomes,
    ) -> OutboxResult<OutcomeSummary> {
        let mut rows = self.rows.lock().await;
        let mut summary = OutcomeSummary::default();
        let now = Utc::now();

        for row in rows.iter_mut().filter(|row| {
            row.owner_instance_id.as_deref() == Some(instance_id) && row.state.is_claimable()
        }) {
            if outcomes.sent.contains(&row.message_id) {
                row.state = MessageState::Sent;
                row.sent_at = Some(now);
                row.owner_instance_id = None;
                row.error = None;
                summary.sent += 1;
            } else if let Some((_, error)) =
                outcomes.failed.iter().find(|(id, _)| *id == row.message_id)
            {
                row.state = MessageState::Error;
                row.error = Some(error.clone());
                row.owner_instance_id = None;
                summary.failed += 1;
            }
        }

        Ok(summary)
    }

    async fn release(&self, queue_name: &str, instance_id: &str) -> OutboxResult<u64> {
        let mut rows = self.rows.lock().await;
        let mut released = 0;
        for row in rows.iter_mut().filter(|row| {
            row.queue_name == queue_name
                && row.owner_instance_id.as_deref() == Some(instance_id)
                && row.state.is_claimable()
        }) {
            row.owner_instance_id = None;
            released += 1;
        }
        Ok(released)
    }

    async fn find(&self, message_id: &str) -> OutboxResult<Option<StagedMessage>> {
        Ok(self
            .rows
            .lock()
            .await
            .iter()
            .find(|row| row.message_id == message_id)
            .cloned())
    }

    async fn state_counts(&self, queue_name: &str) -> OutboxResult<StateCounts> {
        let rows = self.rows.lock().await;
        let mut counts = StateCounts::default();
        for row in rows.iter().filter(|row| row.queue_name == queue_name) {
            match row.state {
                MessageState::New => counts.new += 1,
                MessageState::Sent => counts.sent += 1,
                MessageState::Error => counts.error += 1,
            }
            if row.state.is_claimable() && row.owner_instance_id.is_some() {
                counts.claimed += 1;
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SenderIdentity;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u32,
    }

    fn new_message(partition: i32, seq: u32) -> NewStagedMessage {
        NewStagedMessage {
            queue_name: "pings".to_string(),
            partition,
            payload: serde_json::to_vec(&Ping { seq }).unwrap(),
            payload_type: "Ping".to_string(),
            sender_identity: SenderIdentity::new("tester"),
        }
    }

    fn request(partition: i32, instance_id: &str, batch_size: u32) -> ClaimRequest {
        ClaimRequest {
            queue_name: "pings".to_string(),
            partition,
            instance_id: instance_id.to_string(),
            batch_size,
        }
    }

    async fn seed(store: &InMemoryStagedMessageStore, partition: i32, count: u32) {
        let mut tx = store.begin().await.unwrap();
        for seq in 0..count {
            store.insert(&mut tx, new_message(partition, seq)).await.unwrap();
        }
        store.commit(tx).await.unwrap();
    }

    #[tokio::test]
    async fn test_uncommitted_rows_are_invisible() {
        let store = InMemoryStagedMessageStore::new();
        let mut tx = store.begin().await.unwrap();
        store.insert(&mut tx, new_message(0, 1)).await.unwrap();

        let claimed = store.claim_batch::<Ping>(&request(0, "w1", 10)).await.unwrap();
        assert!(claimed.is_empty());

        store.rollback(tx).await.unwrap();
        assert_eq!(store.state_counts("pings").await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_claim_is_fifo_and_bounded() {
        let store = InMemoryStagedMessageStore::new();
        seed(&store, 0, 5).await;

        let claimed = store.claim_batch::<Ping>(&request(0, "w1", 3)).await.unwrap();
        let seqs: Vec<u32> = claimed.iter().map(|m| m.entity.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);

        let rest = store.claim_batch::<Ping>(&request(0, "w2", 10)).await.unwrap();
        let seqs: Vec<u32> = rest.iter().map(|m| m.entity.seq).collect();
        assert_eq!(seqs, vec![3, 4]);
    }

    #[tokio::test]
    async fn test_claim_orders_by_staging_time_not_commit_time() {
        let store = InMemoryStagedMessageStore::new();
        let mut first = store.begin().await.unwrap();
        store.insert(&mut first, new_message(0, 1)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let mut second = store.begin().await.unwrap();
        store.insert(&mut second, new_message(0, 2)).await.unwrap();
        store.commit(second).await.unwrap();
        store.commit(first).await.unwrap();

        let claimed = store.claim_batch::<Ping>(&request(0, "w1", 1)).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].entity.seq, 1);

        let next = store.claim_batch::<Ping>(&request(0, "w2", 1)).await.unwrap();
        assert_eq!(next[0].entity.seq, 2);
    }

    #[tokio::test]
    async fn test_malformed_row_counts_against_batch_size() {
        let store = InMemoryStagedMessageStore::new();
        seed(&store, 0, 3).await;
        let rows = store.rows("pings").await;
        assert!(store.corrupt_payload(&rows[0].message_id, br#"{"seq":9}"#.to_vec()).await);

        let claimed = store.claim_batch::<Ping>(&request(0, "w1", 1)).await.unwrap();
        assert!(claimed.is_empty());

        let counts = store.state_counts("pings").await.unwrap();
        assert_eq!(counts, StateCounts { new: 2, sent: 0, error: 1, claimed: 0 });
        for row in &rows[1..] {
            let untouched = store.find(&row.message_id).await.unwrap().unwrap();
            assert_eq!(untouched.state, MessageState::New);
            assert!(untouched.owner_instance_id.is_none());
        }
    }

    #[tokio::test]
    async fn test_report_outcomes_transitions_owned_rows() {
        let store = InMemoryStagedMessageStore::new();
        seed(&store, 0, 3).await;
        let claimed = store.claim_batch::<Ping>(&request(0, "w1", 10)).await.unwrap();

        let mut outcomes = DispatchOutcomes::default();
        outcomes.record_sent(&claimed[0].message_id);
        outcomes.record_failed(&claimed[1].message_id, "broker unavailable");

        // a foreign instance id transitions nothing
        let foreign = store.report_outcomes("w2", &outcomes).await.unwrap();
        assert_eq!(foreign, OutcomeSummary::default());

        let summary = store.report_outcomes("w1", &outcomes).await.unwrap();
        assert_eq!(summary, OutcomeSummary { sent: 1, failed: 1 });

        let sent = store.find(&claimed[0].message_id).await.unwrap().unwrap();
        assert_eq!(sent.state, MessageState::Sent);
        assert!(sent.sent_at.is_some());
        assert!(sent.owner_instance_id.is_none());

        let failed = store.find(&claimed[1].message_id).await.unwrap().unwrap();
        assert_eq!(failed.state, MessageState::Error);
        assert_eq!(failed.error.as_deref(), Some("broker unavailable"));
        assert!(failed.is_claimable());

        let untouched = store.find(&claimed[2].message_id).await.unwrap().unwrap();
        assert_eq!(untouched.owner_instance_id.as_deref(), Some("w1"));

        let counts = store.state_counts("pings").await.unwrap();
        assert_eq!(counts, StateCounts { new: 1, sent: 1, error: 1, claimed: 1 });
    }

    #[tokio::test]
    async fn test_release_returns_rows_to_pool() {
        let store = InMemoryStagedMessageStore::new();
        seed(&store, 2, 4).await;
        store.claim_batch::<Ping>(&request(2, "w1", 10)).await.unwrap();

        assert_eq!(store.release("pings", "w1").await.unwrap(), 4);
        let reclaimed = store.claim_batch::<Ping>(&request(2, "w2", 10)).await.unwrap();
        assert_eq!(reclaimed.len(), 4);
    }

    #[tokio::test]
    async fn test_corrupted_row_is_marked_error_and_skipped() {
        let store = InMemoryStagedMessageStore::new();
        seed(&store, 0, 2).await;
        let rows = store.rows("pings").await;
        assert!(store.corrupt_payload(&rows[0].message_id, br#"{"seq":9}"#.to_vec()).await);

        let claimed = store.claim_batch::<Ping>(&request(0, "w1", 10)).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].message_id, rows[1].message_id);

        let bad = store.find(&rows[0].message_id).await.unwrap().unwrap();
        assert_eq!(bad.state, MessageState::Error);
        assert!(bad.owner_instance_id.is_none());
        assert!(bad.error.unwrap().contains("checksum mismatch"));
    }
}
