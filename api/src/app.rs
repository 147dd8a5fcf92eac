use payments_worker::broker::{BrokerError, KeyValueStore, RedisBroker, StreamLog};
use payments_worker::config::ConfigError;
use payments_worker::payment_message::PaymentMessage;
use payments_worker::queue::PaymentsQueue;
use payments_worker::store::SummaryStore;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinSet;

const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub listen_addr: SocketAddr,
    pub redis_url: String,
}

impl ApiConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let listen_addr = match lookup("LISTEN_ADDR") {
            None => SocketAddr::from(([0, 0, 0, 0], 9999)),
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
                key: "LISTEN_ADDR",
                value,
            })?,
        };

        Ok(Self {
            listen_addr,
            redis_url: lookup("REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1:6379/".to_string()),
        })
    }
}

/// What the HTTP handlers share: the admission side of the queue and the
/// summary read path.
pub struct App {
    pub queue: PaymentsQueue,
    pub store: SummaryStore,
    enqueues: Mutex<Enqueues>,
}

/// Enqueues answered `202` but possibly not yet appended. Once `closed`, no
/// new ones are accepted.
#[derive(Default)]
struct Enqueues {
    tasks: JoinSet<()>,
    closed: bool,
}

impl App {
    pub async fn connect(config: &ApiConfig) -> Result<Self, BrokerError> {
        let broker = Arc::new(RedisBroker::connect(&config.redis_url).await?);
        let app = Self::with_broker(broker);
        app.queue.setup().await?;
        Ok(app)
    }

    pub fn with_broker<B>(broker: Arc<B>) -> Self
    where
        B: StreamLog + KeyValueStore + 'static,
    {
        Self {
            // Never dequeues, so batch and block are unused.
            queue: PaymentsQueue::new(broker.clone(), 1, Duration::ZERO),
            store: SummaryStore::new(broker),
            enqueues: Mutex::new(Enqueues::default()),
        }
    }

    fn enqueues(&self) -> MutexGuard<'_, Enqueues> {
        self.enqueues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Appends `msg` to the queue in the background, bounded by a 5 s
    /// timeout. Returns `false` once draining has begun.
    pub fn admit(&self, msg: PaymentMessage) -> bool {
        let mut enqueues = self.enqueues();
        if enqueues.closed {
            return false;
        }
        while enqueues.tasks.try_join_next().is_some() {}

        let queue = self.queue.clone();
        enqueues.tasks.spawn(async move {
            match tokio::time::timeout(ENQUEUE_TIMEOUT, queue.enqueue(&msg)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    tracing::error!(correlation_id = %msg.correlation_id, error = %e, "Error enqueuing payment")
                }
                Err(_) => {
                    tracing::error!(correlation_id = %msg.correlation_id, "Timed out enqueuing payment")
                }
            }
        });
        true
    }

    /// Stops admitting and waits for every admitted payment to be appended
    /// or to time out.
    pub async fn drain(&self) {
        let mut tasks = {
            let mut enqueues = self.enqueues();
            enqueues.closed = true;
            std::mem::take(&mut enqueues.tasks)
        };
        let pending = tasks.len();
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Enqueue task failed");
            }
        }
        tracing::info!(pending, "Drained admitted payments");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_addr_defaults_and_validates() {
        let config = ApiConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.listen_addr.port(), 9999);

        let config = ApiConfig::from_lookup(|key| {
            (key == "LISTEN_ADDR").then(|| "127.0.0.1:8080".to_string())
        })
        .unwrap();
        assert_eq!(config.listen_addr, SocketAddr::from(([127, 0, 0, 1], 8080)));

        let err = ApiConfig::from_lookup(|key| (key == "LISTEN_ADDR").then(|| "nope".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "LISTEN_ADDR", .. }));
    }
}
