use crate::broker::{BrokerError, ClaimBatch, EntryId, StreamEntry, StreamLog};
use crate::payment_message::PaymentMessage;
use std::sync::Arc;
use std::time::Duration;

pub const PAYMENTS_STREAM: &str = "payments_stream";
pub const GROUP_NAME: &str = "payments";

/// Durable queue of admitted payments, consumed through a single consumer
/// group. Entries stay pending from delivery until acknowledged, and are only
/// deleted after acknowledgment.
#[derive(Clone)]
pub struct PaymentsQueue {
    log: Arc<dyn StreamLog>,
    batch_size: usize,
    block: Duration,
}

impl PaymentsQueue {
    pub fn new(log: Arc<dyn StreamLog>, batch_size: usize, block: Duration) -> Self {
        Self {
            log,
            batch_size: batch_size.max(1),
            block,
        }
    }

    /// Ensures the stream and its consumer group exist. Safe to call from
    /// every process on every start.
    pub async fn setup(&self) -> Result<(), BrokerError> {
        self.log.create_group(PAYMENTS_STREAM, GROUP_NAME).await?;
        tracing::info!(stream = PAYMENTS_STREAM, group = GROUP_NAME, "Payments queue ready");
        Ok(())
    }

    pub async fn enqueue(&self, payment: &PaymentMessage) -> Result<EntryId, BrokerError> {
        self.log.append(PAYMENTS_STREAM, &payment.to_fields()).await
    }

    /// Waits up to the configured block window for entries never delivered to
    /// the group before; an empty result means the window elapsed.
    pub async fn dequeue(&self, consumer: &str) -> Result<Vec<StreamEntry>, BrokerError> {
        self.log
            .read_group(PAYMENTS_STREAM, GROUP_NAME, consumer, self.batch_size, self.block)
            .await
    }

    pub async fn ack(&self, id: EntryId) -> Result<(), BrokerError> {
        let acked = self.log.ack(PAYMENTS_STREAM, GROUP_NAME, id).await?;
        if acked == 0 {
            tracing::debug!(%id, "Entry was already acknowledged");
        }
        Ok(())
    }

    /// Removes an entry from the log. Callers ack first.
    pub async fn delete(&self, id: EntryId) -> Result<(), BrokerError> {
        self.log.delete(PAYMENTS_STREAM, id).await?;
        Ok(())
    }

    /// Reassigns to `consumer` up to `limit` entries that have been pending for
    /// at least `min_idle`, scanning from `cursor`.
    pub async fn reclaim_stale(
        &self,
        consumer: &str,
        min_idle: Duration,
        cursor: EntryId,
        limit: usize,
    ) -> Result<ClaimBatch, BrokerError> {
        self.log
            .auto_claim(PAYMENTS_STREAM, GROUP_NAME, consumer, min_idle, cursor, limit)
            .await
    }
}
