use crate::broker::{EntryId, StreamEntry};
use crate::gateway_type::GatewayType;
use crate::health_monitor::{HealthMonitor, HealthStatus};
use crate::payment::{truncate_to_millis, Payment};
use crate::payment_gateway::{PaymentGateway, SubmitOutcome};
use crate::payment_message::PaymentMessage;
use crate::queue::PaymentsQueue;
use crate::store::SummaryStore;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

const DEQUEUE_ERROR_PAUSE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub num_workers: usize,
    pub latency_threshold_ms: u64,
    pub reclaim_interval: Duration,
    pub reclaim_min_idle: Duration,
    pub reclaim_batch: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            num_workers: 4,
            latency_threshold_ms: 1000,
            reclaim_interval: Duration::from_secs(5),
            reclaim_min_idle: Duration::from_secs(10),
            reclaim_batch: 10,
        }
    }
}

/// How a delivered entry was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Accepted upstream: acked, deleted and recorded.
    Completed(GatewayType),
    /// Refused upstream for good: acked and deleted, not recorded.
    Rejected,
    /// Undecodable entry: acked and deleted.
    Malformed,
    /// Left pending for reclamation.
    Deferred,
}

#[derive(Clone)]
pub struct WorkerDependencies {
    pub queue: PaymentsQueue,
    pub health_monitor: Arc<HealthMonitor>,
    pub default_gateway: Arc<PaymentGateway>,
    pub fallback_gateway: Arc<PaymentGateway>,
    pub store: Arc<SummaryStore>,
}

impl WorkerDependencies {
    fn gateway(&self, gateway: GatewayType) -> &PaymentGateway {
        match gateway {
            GatewayType::Default => &self.default_gateway,
            GatewayType::Fallback => &self.fallback_gateway,
        }
    }
}

/// Picks the processor for the next payment from the local health snapshot.
/// Default wins while it is up and answering under the latency threshold.
pub fn select_gateway(
    default: HealthStatus,
    fallback: HealthStatus,
    latency_threshold_ms: u64,
) -> Option<GatewayType> {
    if !default.failing && default.min_response_time < latency_threshold_ms {
        Some(GatewayType::Default)
    } else if !fallback.failing {
        Some(GatewayType::Fallback)
    } else {
        None
    }
}

#[derive(Clone)]
pub struct WorkerPool {
    instance_id: String,
    settings: WorkerSettings,
    deps: WorkerDependencies,
}

impl WorkerPool {
    pub fn new(instance_id: String, settings: WorkerSettings, deps: WorkerDependencies) -> Self {
        Self {
            instance_id,
            settings,
            deps,
        }
    }

    /// Spawns the dequeue loops and the reclamation loop.
    pub fn start(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.settings.num_workers + 1);

        for worker_id in 0..self.settings.num_workers {
            let pool = self.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                pool.dequeue_loop(worker_id, shutdown).await;
            }));
        }

        let pool = self.clone();
        handles.push(tokio::spawn(async move {
            pool.reclaim_loop(shutdown).await;
        }));

        tracing::info!(
            instance = %self.instance_id,
            workers = self.settings.num_workers,
            "Started worker pool"
        );
        handles
    }

    /// Runs until shutdown, then waits for every loop to finish.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        for result in join_all(self.start(shutdown)).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Worker task failed");
            }
        }
    }

    async fn dequeue_loop(&self, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        let consumer = format!("{}-{}", self.instance_id, worker_id);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let entries = tokio::select! {
                _ = shutdown.changed() => break,
                entries = self.deps.queue.dequeue(&consumer) => entries,
            };

            match entries {
                Ok(entries) => {
                    for entry in &entries {
                        let disposition =
                            Self::process_entry(&self.deps, self.settings.latency_threshold_ms, entry)
                                .await;
                        tracing::debug!(worker_id, id = %entry.id, ?disposition, "Processed entry");
                    }
                }
                Err(e) => {
                    tracing::warn!(worker_id, error = %e, "Dequeue failed");
                    tokio::time::sleep(DEQUEUE_ERROR_PAUSE).await;
                }
            }
        }
        tracing::info!(worker_id, "Worker shutting down");
    }

    async fn reclaim_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let consumer = format!("{}-reclaimer", self.instance_id);
        let period = self.settings.reclaim_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cursor = EntryId::ZERO;

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }

            let batch = match self
                .deps
                .queue
                .reclaim_stale(
                    &consumer,
                    self.settings.reclaim_min_idle,
                    cursor,
                    self.settings.reclaim_batch,
                )
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::warn!(error = %e, "Reclaim failed");
                    cursor = EntryId::ZERO;
                    continue;
                }
            };

            if !batch.entries.is_empty() {
                tracing::info!(count = batch.entries.len(), "Reclaimed stale entries");
            }
            for entry in &batch.entries {
                let disposition =
                    Self::process_entry(&self.deps, self.settings.latency_threshold_ms, entry).await;
                tracing::debug!(id = %entry.id, ?disposition, "Processed reclaimed entry");
            }
            cursor = batch.next;
        }
        tracing::info!("Reclaimer shutting down");
    }

    /// Routes one delivered entry and settles it in the queue. Only
    /// `Deferred` leaves the entry pending.
    pub async fn process_entry(
        deps: &WorkerDependencies,
        latency_threshold_ms: u64,
        entry: &StreamEntry,
    ) -> Disposition {
        let msg = match PaymentMessage::from_fields(&entry.fields) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(id = %entry.id, error = %e, "Discarding malformed entry");
                Self::settle(deps, entry.id).await;
                return Disposition::Malformed;
            }
        };

        let Some(gateway) = select_gateway(
            deps.health_monitor.status(GatewayType::Default),
            deps.health_monitor.status(GatewayType::Fallback),
            latency_threshold_ms,
        ) else {
            tracing::debug!(id = %entry.id, "No processor available, leaving entry pending");
            return Disposition::Deferred;
        };

        let payment = Payment::new(
            msg.correlation_id,
            msg.amount,
            gateway,
            truncate_to_millis(OffsetDateTime::now_utc()),
        );

        match deps.gateway(gateway).submit(&payment).await {
            SubmitOutcome::Accepted => {
                Self::settle(deps, entry.id).await;
                if let Err(e) = deps.store.record(&payment).await {
                    tracing::error!(
                        correlation_id = %payment.correlation_id,
                        error = %e,
                        "Failed to record payment in summary"
                    );
                }
                Disposition::Completed(gateway)
            }
            SubmitOutcome::Retryable(e) => {
                tracing::info!(id = %entry.id, %gateway, error = %e, "Payment failed to process, will be reclaimed");
                Disposition::Deferred
            }
            SubmitOutcome::Rejected(e) => {
                tracing::warn!(
                    id = %entry.id,
                    %gateway,
                    correlation_id = %payment.correlation_id,
                    error = %e,
                    "Payment rejected by processor"
                );
                Self::settle(deps, entry.id).await;
                Disposition::Rejected
            }
        }
    }

    /// Ack, then delete. A failed ack skips the delete so the entry is never
    /// removed while still pending.
    async fn settle(deps: &WorkerDependencies, id: EntryId) {
        if let Err(e) = deps.queue.ack(id).await {
            tracing::warn!(%id, error = %e, "Failed to acknowledge entry");
            return;
        }
        if let Err(e) = deps.queue.delete(id).await {
            tracing::warn!(%id, error = %e, "Failed to delete entry");
        }
    }
}
