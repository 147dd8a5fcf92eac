use payments_worker::broker::RedisBroker;
use payments_worker::config::WorkerConfig;
use payments_worker::gateway_type::GatewayType;
use payments_worker::health_monitor::HealthMonitor;
use payments_worker::payment_gateway::PaymentGateway;
use payments_worker::queue::PaymentsQueue;
use payments_worker::signal::shutdown_channel;
use payments_worker::store::SummaryStore;
use payments_worker::worker_pool::{WorkerDependencies, WorkerPool};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize tracing with default level WARN, overridable via RUST_LOG
    {
        use tracing_subscriber::{EnvFilter, fmt};
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = fmt().with_env_filter(env_filter).try_init();
    }

    let config = WorkerConfig::from_env()?;
    let broker = Arc::new(RedisBroker::connect(&config.redis_url).await?);

    let queue = PaymentsQueue::new(broker.clone(), config.dequeue_batch, config.dequeue_block);
    queue.setup().await?;

    let default_gateway = Arc::new(PaymentGateway::new(
        GatewayType::Default,
        &config.default_processor_url,
        config.health_timeout,
        config.request_timeout,
    ));
    let fallback_gateway = Arc::new(PaymentGateway::new(
        GatewayType::Fallback,
        &config.fallback_processor_url,
        config.health_timeout,
        config.request_timeout,
    ));

    let health_monitor = Arc::new(HealthMonitor::new(
        config.instance_id.clone(),
        broker.clone(),
        default_gateway.clone(),
        fallback_gateway.clone(),
        config.health_settings(),
    ));

    let shutdown = shutdown_channel();
    let mut handles = health_monitor.start(shutdown.clone());

    let worker_pool = WorkerPool::new(
        config.instance_id.clone(),
        config.worker_settings(),
        WorkerDependencies {
            queue,
            health_monitor,
            default_gateway,
            fallback_gateway,
            store: Arc::new(SummaryStore::new(broker)),
        },
    );
    handles.extend(worker_pool.start(shutdown));

    for result in futures_util::future::join_all(handles).await {
        if let Err(e) = result {
            tracing::error!(error = %e, "Task failed during shutdown");
        }
    }
    tracing::warn!(instance = %config.instance_id, "Worker stopped");
    Ok(())
}
