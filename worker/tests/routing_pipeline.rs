use mockito::{Server, ServerGuard};
use payments_worker::broker::{KeyValueStore, MemoryBroker, StreamLog};
use payments_worker::gateway_type::GatewayType;
use payments_worker::health_monitor::{cache_key, HealthMonitor, HealthSettings};
use payments_worker::payment_gateway::{PaymentGateway, HEALTH_ENDPOINT, PAYMENTS_ENDPOINT};
use payments_worker::payment_message::PaymentMessage;
use payments_worker::queue::{PaymentsQueue, GROUP_NAME, PAYMENTS_STREAM};
use payments_worker::store::{GatewaySummary, SummaryStore};
use payments_worker::worker_pool::{Disposition, WorkerDependencies, WorkerPool, WorkerSettings};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const HEALTHY: &str = r#"{"failing":false,"minResponseTime":10}"#;
const THRESHOLD_MS: u64 = 1000;

struct Harness {
    broker: Arc<MemoryBroker>,
    deps: WorkerDependencies,
    default_server: ServerGuard,
    fallback_server: ServerGuard,
}

impl Harness {
    async fn new() -> Self {
        let broker = Arc::new(MemoryBroker::new());
        let default_server = Server::new_async().await;
        let fallback_server = Server::new_async().await;

        let gateway = |gateway, url: String| {
            Arc::new(PaymentGateway::new(
                gateway,
                &url,
                Duration::from_millis(500),
                Duration::from_millis(500),
            ))
        };
        let default_gateway = gateway(GatewayType::Default, default_server.url());
        let fallback_gateway = gateway(GatewayType::Fallback, fallback_server.url());

        let health_monitor = Arc::new(HealthMonitor::new(
            "test-instance".to_string(),
            broker.clone(),
            default_gateway.clone(),
            fallback_gateway.clone(),
            HealthSettings::default(),
        ));

        let queue = PaymentsQueue::new(broker.clone(), 10, Duration::from_millis(50));
        queue.setup().await.unwrap();

        Self {
            deps: WorkerDependencies {
                queue,
                health_monitor,
                default_gateway,
                fallback_gateway,
                store: Arc::new(SummaryStore::new(broker.clone())),
            },
            broker,
            default_server,
            fallback_server,
        }
    }

    async fn health(&mut self, default: Option<&str>, fallback: Option<&str>) {
        for (server, body) in [
            (&mut self.default_server, default),
            (&mut self.fallback_server, fallback),
        ] {
            let mock = server.mock("GET", HEALTH_ENDPOINT);
            let mock = match body {
                Some(body) => mock.with_status(200).with_body(body),
                None => mock.with_status(500),
            };
            mock.create_async().await;
        }

        for gateway in GatewayType::ALL {
            self.deps.health_monitor.run_cycle(gateway).await;
        }
    }

    async fn enqueue(&self, correlation_id: &str, cents: i64) {
        self.deps
            .queue
            .enqueue(&PaymentMessage::new(correlation_id, Decimal::new(cents, 2)))
            .await
            .unwrap();
    }

    async fn process_next(&self) -> Disposition {
        let entries = self.deps.queue.dequeue("worker-0").await.unwrap();
        assert_eq!(entries.len(), 1);
        WorkerPool::process_entry(&self.deps, THRESHOLD_MS, &entries[0]).await
    }

    async fn summary(&self, gateway: GatewayType) -> GatewaySummary {
        let records = self
            .deps
            .store
            .range_query(gateway, 0, i128::MAX)
            .await
            .unwrap();
        GatewaySummary::from_records(&records).unwrap()
    }

    fn assert_queue_drained(&self) {
        assert!(self.broker.pending(PAYMENTS_STREAM, GROUP_NAME).is_empty());
        assert!(self.broker.entries(PAYMENTS_STREAM).is_empty());
    }
}

#[tokio::test]
async fn healthy_default_completes_payment() {
    let mut h = Harness::new().await;
    h.health(Some(HEALTHY), Some(HEALTHY)).await;
    let submitted = h
        .default_server
        .mock("POST", PAYMENTS_ENDPOINT)
        .match_body(mockito::Matcher::PartialJson(serde_json::json!({
            "correlationId": "a1",
            "amount": 19.9
        })))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    h.enqueue("a1", 1990).await;
    assert_eq!(
        h.process_next().await,
        Disposition::Completed(GatewayType::Default)
    );

    submitted.assert_async().await;
    h.assert_queue_drained();
    let summary = h.summary(GatewayType::Default).await;
    assert_eq!(summary.total_requests, 1);
    assert_eq!(summary.total_amount, Decimal::new(1990, 2));
    assert_eq!(h.summary(GatewayType::Fallback).await, GatewaySummary::default());
}

#[tokio::test]
async fn failing_default_routes_to_fallback() {
    let mut h = Harness::new().await;
    h.health(None, Some(HEALTHY)).await;
    let default_submit = h
        .default_server
        .mock("POST", PAYMENTS_ENDPOINT)
        .expect(0)
        .create_async()
        .await;
    h.fallback_server
        .mock("POST", PAYMENTS_ENDPOINT)
        .with_status(200)
        .create_async()
        .await;

    h.enqueue("b2", 500).await;
    assert_eq!(
        h.process_next().await,
        Disposition::Completed(GatewayType::Fallback)
    );

    default_submit.assert_async().await;
    h.assert_queue_drained();
    assert_eq!(h.summary(GatewayType::Fallback).await.total_requests, 1);
}

#[tokio::test]
async fn slow_default_routes_to_fallback() {
    let mut h = Harness::new().await;
    h.health(Some(r#"{"failing":false,"minResponseTime":1500}"#), Some(HEALTHY))
        .await;
    h.fallback_server
        .mock("POST", PAYMENTS_ENDPOINT)
        .with_status(200)
        .create_async()
        .await;

    h.enqueue("slow", 100).await;
    assert_eq!(
        h.process_next().await,
        Disposition::Completed(GatewayType::Fallback)
    );
}

#[tokio::test]
async fn both_failing_leaves_entry_pending_until_reclaimed() {
    let mut h = Harness::new().await;
    h.health(None, None).await;

    h.enqueue("c3", 1000).await;
    assert_eq!(h.process_next().await, Disposition::Deferred);

    let pending = h.broker.pending(PAYMENTS_STREAM, GROUP_NAME);
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].1, "worker-0");
    assert_eq!(h.broker.entries(PAYMENTS_STREAM).len(), 1);

    let min_idle = Duration::from_millis(100);
    let early = h
        .deps
        .queue
        .reclaim_stale("reclaimer", min_idle, Default::default(), 10)
        .await
        .unwrap();
    assert!(early.entries.is_empty());

    // Another instance publishes a healthy fallback; the lease here is still
    // held, so the next cycle only mirrors the shared entry.
    h.broker
        .set_with_ttl(&cache_key(GatewayType::Fallback), HEALTHY, Duration::from_secs(10))
        .await
        .unwrap();
    h.deps.health_monitor.run_cycle(GatewayType::Fallback).await;
    h.fallback_server
        .mock("POST", PAYMENTS_ENDPOINT)
        .with_status(200)
        .create_async()
        .await;

    tokio::time::sleep(Duration::from_millis(150)).await;
    let batch = h
        .deps
        .queue
        .reclaim_stale("reclaimer", min_idle, Default::default(), 10)
        .await
        .unwrap();
    assert_eq!(batch.entries.len(), 1);
    assert_eq!(batch.entries[0].fields["correlationId"], "c3");

    let disposition = WorkerPool::process_entry(&h.deps, THRESHOLD_MS, &batch.entries[0]).await;
    assert_eq!(disposition, Disposition::Completed(GatewayType::Fallback));
    h.assert_queue_drained();
    assert_eq!(h.summary(GatewayType::Fallback).await.total_requests, 1);
}

#[tokio::test]
async fn retryable_failure_is_deferred() {
    let mut h = Harness::new().await;
    h.health(Some(HEALTHY), None).await;
    h.default_server
        .mock("POST", PAYMENTS_ENDPOINT)
        .with_status(503)
        .create_async()
        .await;

    h.enqueue("d4", 100).await;
    assert_eq!(h.process_next().await, Disposition::Deferred);
    assert_eq!(h.broker.pending(PAYMENTS_STREAM, GROUP_NAME).len(), 1);
    assert_eq!(h.summary(GatewayType::Default).await.total_requests, 0);
}

#[tokio::test]
async fn rejected_payment_is_dropped_without_record() {
    let mut h = Harness::new().await;
    h.health(Some(HEALTHY), Some(HEALTHY)).await;
    h.default_server
        .mock("POST", PAYMENTS_ENDPOINT)
        .with_status(422)
        .create_async()
        .await;

    h.enqueue("e5", 100).await;
    assert_eq!(h.process_next().await, Disposition::Rejected);
    h.assert_queue_drained();
    assert_eq!(h.summary(GatewayType::Default).await.total_requests, 0);
}

#[tokio::test]
async fn malformed_entry_is_acked_and_deleted() {
    let mut h = Harness::new().await;
    h.health(Some(HEALTHY), Some(HEALTHY)).await;
    let submit = h
        .default_server
        .mock("POST", PAYMENTS_ENDPOINT)
        .expect(0)
        .create_async()
        .await;

    h.broker
        .append(PAYMENTS_STREAM, &[("amount", "not-a-number".to_string())])
        .await
        .unwrap();
    assert_eq!(h.process_next().await, Disposition::Malformed);

    submit.assert_async().await;
    h.assert_queue_drained();
}

#[tokio::test]
async fn pool_processes_queue_and_stops_on_shutdown() {
    let mut h = Harness::new().await;
    h.health(Some(HEALTHY), Some(HEALTHY)).await;
    h.default_server
        .mock("POST", PAYMENTS_ENDPOINT)
        .with_status(200)
        .expect(3)
        .create_async()
        .await;

    for (i, cid) in ["p1", "p2", "p3"].into_iter().enumerate() {
        h.enqueue(cid, 100 * (i as i64 + 1)).await;
    }

    let pool = WorkerPool::new(
        "test-instance".to_string(),
        WorkerSettings {
            num_workers: 2,
            ..WorkerSettings::default()
        },
        h.deps.clone(),
    );
    let (tx, rx) = watch::channel(false);
    let running = tokio::spawn(pool.run(rx));

    tokio::time::timeout(Duration::from_secs(5), async {
        while h.summary(GatewayType::Default).await.total_requests < 3 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("payments were not processed in time");

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), running)
        .await
        .expect("pool did not stop")
        .unwrap();

    assert_eq!(h.summary(GatewayType::Default).await.total_amount, Decimal::new(600, 2));
    h.assert_queue_drained();
}

#[tokio::test]
async fn pool_reclaims_deferred_entry_once_a_processor_recovers() {
    let mut h = Harness::new().await;
    h.health(None, None).await;
    h.enqueue("r1", 4200).await;

    let pool = WorkerPool::new(
        "test-instance".to_string(),
        WorkerSettings {
            num_workers: 1,
            reclaim_interval: Duration::from_millis(100),
            reclaim_min_idle: Duration::from_millis(100),
            ..WorkerSettings::default()
        },
        h.deps.clone(),
    );
    let (tx, rx) = watch::channel(false);
    let running = tokio::spawn(pool.run(rx));

    tokio::time::timeout(Duration::from_secs(2), async {
        while h.broker.pending(PAYMENTS_STREAM, GROUP_NAME).is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("entry was not delivered");
    assert_eq!(h.summary(GatewayType::Fallback).await.total_requests, 0);

    let submitted = h
        .fallback_server
        .mock("POST", PAYMENTS_ENDPOINT)
        .match_body(mockito::Matcher::PartialJson(serde_json::json!({
            "correlationId": "r1"
        })))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;
    h.broker
        .set_with_ttl(&cache_key(GatewayType::Fallback), HEALTHY, Duration::from_secs(10))
        .await
        .unwrap();
    h.deps.health_monitor.run_cycle(GatewayType::Fallback).await;

    tokio::time::timeout(Duration::from_secs(5), async {
        while h.summary(GatewayType::Fallback).await.total_requests < 1 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("deferred payment was not reclaimed");

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), running)
        .await
        .expect("pool did not stop")
        .unwrap();

    submitted.assert_async().await;
    assert_eq!(h.summary(GatewayType::Fallback).await.total_amount, Decimal::new(4200, 2));
    h.assert_queue_drained();
}
