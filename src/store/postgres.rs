//! # Postgres Staged Message Store
//!
//! sqlx implementation of [`StagedMessageStore`] over the
//! `tasker_outbox_staged_messages` table. Claims lock rows with
//! `FOR UPDATE SKIP LOCKED` so concurrent claimers never see each other's rows.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Row};
use tracing::{debug, error, info, instrument, warn};

use super::{ClaimRequest, ClaimedMessage, DispatchOutcomes, OutcomeSummary, StagedMessageStore};
use crate::database::run_migrations;
use crate::error::{OutboxError, OutboxResult};
use crate::messaging::QueueMessage;
use crate::models::{NewStagedMessage, StagedMessage, StagedMessageRow, StateCounts};

const STAGED_MESSAGE_COLUMNS: &str = "message_id, queue_name, partition_id, payload, payload_type, \
     checksum, length, created_at, sent_at, state, owner_instance_id, error, sender_identity";

#[derive(Debug, Clone)]
pub struct PgStagedMessageStore {
    pool: PgPool,
}

impl PgStagedMessageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the staged message table and indexes when missing
    pub async fn ensure_schema(&self) -> OutboxResult<()> {
        run_migrations(&self.pool).await
    }

    async fn mark_malformed(
        tx: &mut sqlx::Transaction<'static, Postgres>,
        message_id: &str,
        reason: &str,
    ) -> OutboxResult<()> {
        sqlx::query(
            "UPDATE tasker_outbox_staged_messages \
             SET state = 'error', error = $2, owner_instance_id = NULL \
             WHERE message_id = $1",
        )
        .bind(message_id)
        .bind(reason)
        .execute(&mut **tx)
        .await
        .map_err(|e| OutboxError::store("claim_batch", format!("Failed to mark {message_id} malformed: {e}")))?;
        Ok(())
    }
}

fn count_column(row: &sqlx::postgres::PgRow, column: &str) -> OutboxResult<u64> {
    let value: i64 = row.try_get(column)?;
    Ok(u64::try_from(value).unwrap_or_default())
}

#[async_trait]
impl StagedMessageStore for PgStagedMessageStore {
    type Transaction = sqlx::Transaction<'static, Postgres>;

    async fn begin(&self) -> OutboxResult<Self::Transaction> {
        self.pool
            .begin()
            .await
            .map_err(|e| OutboxError::store("begin", e.to_string()))
    }

    async fn commit(&self, tx: Self::Transaction) -> OutboxResult<()> {
        tx.commit()
            .await
            .map_err(|e| OutboxError::store("commit", e.to_string()))
    }

    async fn rollback(&self, tx: Self::Transaction) -> OutboxResult<()> {
        tx.rollback()
            .await
            .map_err(|e| OutboxError::store("rollback", e.to_string()))
    }

    #[instrument(skip(self, tx, message), fields(queue = %message.queue_name, partition = message.partition))]
    async fn insert(
        &self,
        tx: &mut Self::Transaction,
        message: NewStagedMessage,
    ) -> OutboxResult<StagedMessage> {
        let staged = StagedMessage::stage(message)?;

        sqlx::query(
            "INSERT INTO tasker_outbox_staged_messages \
             (message_id, queue_name, partition_id, payload, payload_type, checksum, length, \
              created_at, sent_at, state, owner_instance_id, error, sender_identity) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(&staged.message_id)
        .bind(&staged.queue_name)
        .bind(staged.partition)
        .bind(&staged.payload)
        .bind(&staged.payload_type)
        .bind(&staged.checksum)
        .bind(staged.length)
        .bind(staged.created_at)
        .bind(staged.sent_at)
        .bind(staged.state.as_str())
        .bind(&staged.owner_instance_id)
        .bind(&staged.error)
        .bind(&staged.sender_identity)
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            error!(message_id = %staged.message_id, error = %e, "Failed to stage message");
            OutboxError::store("insert", e.to_string())
        })?;

        debug!(message_id = %staged.message_id, length = staged.length, "Staged message");
        Ok(staged)
    }

    #[instrument(skip(self), fields(queue = %request.queue_name, partition = request.partition))]
    async fn claim_batch<T: QueueMessage>(
        &self,
        request: &ClaimRequest,
    ) -> OutboxResult<Vec<ClaimedMessage<T>>> {
        let mut tx = self.begin().await?;

        let query = format!(
            "SELECT {STAGED_MESSAGE_COLUMNS} \
             FROM tasker_outbox_staged_messages \
             WHERE queue_name = $1 AND partition_id = $2 \
               AND state IN ('new', 'error') AND owner_instance_id IS NULL \
             ORDER BY created_at ASC \
             LIMIT $3 \
             FOR UPDATE SKIP LOCKED"
        );

        let rows = sqlx::query_as::<_, StagedMessageRow>(&query)
            .bind(&request.queue_name)
            .bind(request.partition)
            .bind(i64::from(request.batch_size))
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| {
                error!("Failed to claim staged messages: {}", e);
                OutboxError::store("claim_batch", e.to_string())
            })?;

        if rows.is_empty() {
            tx.commit()
                .await
                .map_err(|e| OutboxError::store("claim_batch", e.to_string()))?;
            debug!("No staged messages available for claiming");
            return Ok(Vec::new());
        }

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let message_id = row.message_id.clone();
            let decoded = StagedMessage::try_from(row).and_then(|m| ClaimedMessage::<T>::decode(&m));
            match decoded {
                Ok(message) => claimed.push(message),
                Err(e) => {
                    warn!(message_id = %message_id, error = %e, "Staged message failed verification during claim");
                    Self::mark_malformed(&mut tx, &message_id, &e.to_string()).await?;
                }
            }
        }

        if !claimed.is_empty() {
            let ids: Vec<String> = claimed.iter().map(|m| m.message_id.clone()).collect();
            sqlx::query(
                "UPDATE tasker_outbox_staged_messages \
                 SET owner_instance_id = $1 \
                 WHERE message_id = ANY($2)",
            )
            .bind(&request.instance_id)
            .bind(&ids)
            .execute(&mut *tx)
            .await
            .map_err(|e| OutboxError::store("claim_batch", e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| OutboxError::store("claim_batch", e.to_string()))?;

        if !claimed.is_empty() {
            info!(
                claimed_count = claimed.len(),
                instance_id = %request.instance_id,
                "Claimed staged messages"
            );
        }
        Ok(claimed)
    }

    #[instrument(skip(self, outcomes), fields(sent = outcomes.sent.len(), failed = outcomes.failed.len()))]
    async fn report_outcomes(
        &self,
        instance_id: &str,
        outcomes: &DispatchOutcomes,
    ) -> OutboxResult<OutcomeSummary> {
        if outcomes.is_empty() {
            return Ok(OutcomeSummary::default());
        }

        let mut tx = self.begin().await?;
        let mut summary = OutcomeSummary::default();

        if !outcomes.sent.is_empty() {
            summary.sent = sqlx::query(
                "UPDATE tasker_outbox_staged_messages \
                 SET state = 'sent', sent_at = NOW(), owner_instance_id = NULL, error = NULL \
                 WHERE message_id = ANY($1) \
                   AND owner_instance_id = $2 \
                   AND state IN ('new', 'error')",
            )
            .bind(&outcomes.sent)
            .bind(instance_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| OutboxError::store("report_outcomes", e.to_string()))?
            .rows_affected();
        }

        if !outcomes.failed.is_empty() {
            let (ids, errors): (Vec<String>, Vec<String>) = outcomes.failed.iter().cloned().unzip();
            summary.failed = sqlx::query(
                "UPDATE tasker_outbox_staged_messages AS m \
                 SET state = 'error', error = f.error, owner_instance_id = NULL \
                 FROM UNNEST($1::VARCHAR[], $2::TEXT[]) AS f(message_id, error) \
                 WHERE m.message_id = f.message_id \
                   AND m.owner_instance_id = $3 \
                   AND m.state IN ('new', 'error')",
            )
            .bind(&ids)
            .bind(&errors)
            .bind(instance_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| OutboxError::store("report_outcomes", e.to_string()))?
            .rows_affected();
        }

        tx.commit()
            .await
            .map_err(|e| OutboxError::store("report_outcomes", e.to_string()))?;
        Ok(summary)
    }

    #[instrument(skip(self))]
    async fn release(&self, queue_name: &str, instance_id: &str) -> OutboxResult<u64> {
        let result = sqlx::query(
            "UPDATE tasker_outbox_staged_messages \
             SET owner_instance_id = NULL \
             WHERE queue_name = $1 \
               AND owner_instance_id = $2 \
               AND state IN ('new', 'error')",
        )
        .bind(queue_name)
        .bind(instance_id)
        .execute(&self.pool)
        .await
        .map_err(|e| OutboxError::store("release", e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn find(&self, message_id: &str) -> OutboxResult<Option<StagedMessage>> {
        let query = format!(
            "SELECT {STAGED_MESSAGE_COLUMNS} FROM tasker_outbox_staged_messages WHERE message_id = $1"
        );
        sqlx::query_as::<_, StagedMessageRow>(&query)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| OutboxError::store("find", e.to_string()))?
            .map(StagedMessage::try_from)
            .transpose()
    }

    async fn state_counts(&self, queue_name: &str) -> OutboxResult<StateCounts> {
        let row = sqlx::query(
            "SELECT \
                COUNT(*) FILTER (WHERE state = 'new') AS new_count, \
                COUNT(*) FILTER (WHERE state = 'sent') AS sent_count, \
                COUNT(*) FILTER (WHERE state = 'error') AS error_count, \
                COUNT(*) FILTER (WHERE state <> 'sent' AND owner_instance_id IS NOT NULL) AS claimed_count \
             FROM tasker_outbox_staged_messages \
             WHERE queue_name = $1",
        )
        .bind(queue_name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| OutboxError::store("state_counts", e.to_string()))?;

        Ok(StateCounts {
            new: count_column(&row, "new_count")?,
            sent: count_column(&row, "sent_count")?,
            error: count_column(&row, "error_count")?,
            claimed: count_column(&row, "claimed_count")?,
        })
    }
}
