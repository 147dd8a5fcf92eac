use crate::broker::KeyValueStore;
use crate::gateway_type::GatewayType;
use crate::payment_gateway::PaymentGateway;
use arc_swap::ArcSwap;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub failing: bool,
    #[serde(rename = "minResponseTime")]
    pub min_response_time: u64,
}

impl HealthStatus {
    /// What a gateway is taken to be whenever its health is not known.
    pub const UNAVAILABLE: HealthStatus = HealthStatus {
        failing: true,
        min_response_time: 0,
    };

    pub fn healthy(min_response_time: u64) -> Self {
        Self {
            failing: false,
            min_response_time,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    /// Nothing learned yet; routed as failing.
    Unknown,
    /// This instance holds the lease and a probe is in flight.
    Probing,
    Healthy,
    Failing,
}

#[derive(Debug, Clone, Copy)]
struct GatewayHealth {
    state: ProbeState,
    status: HealthStatus,
}

impl GatewayHealth {
    const UNKNOWN: GatewayHealth = GatewayHealth {
        state: ProbeState::Unknown,
        status: HealthStatus::UNAVAILABLE,
    };

    fn from_status(status: HealthStatus) -> Self {
        let state = if status.failing {
            ProbeState::Failing
        } else {
            ProbeState::Healthy
        };
        Self { state, status }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HealthSettings {
    pub probe_interval: Duration,
    pub lease_ttl: Duration,
    pub cache_ttl: Duration,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(6),
            lease_ttl: Duration::from_secs(5),
            cache_ttl: Duration::from_secs(10),
        }
    }
}

pub fn lease_key(gateway: GatewayType) -> String {
    format!("health:check:{}:lock", gateway.ordinal())
}

pub fn cache_key(gateway: GatewayType) -> String {
    format!("processor:{}:health", gateway.ordinal())
}

/// Tracks the health of both processors.
///
/// Across the cluster, only the holder of a gateway's lease probes it and
/// publishes the result to the shared cache. Every instance mirrors the shared
/// cache into a local snapshot each tick, and routing reads only that
/// snapshot.
pub struct HealthMonitor {
    instance_id: String,
    store: Arc<dyn KeyValueStore>,
    gateways: [Arc<PaymentGateway>; 2],
    settings: HealthSettings,
    local: [ArcSwap<GatewayHealth>; 2],
}

impl HealthMonitor {
    pub fn new(
        instance_id: String,
        store: Arc<dyn KeyValueStore>,
        default_gateway: Arc<PaymentGateway>,
        fallback_gateway: Arc<PaymentGateway>,
        settings: HealthSettings,
    ) -> Self {
        Self {
            instance_id,
            store,
            gateways: [default_gateway, fallback_gateway],
            settings,
            local: [
                ArcSwap::from_pointee(GatewayHealth::UNKNOWN),
                ArcSwap::from_pointee(GatewayHealth::UNKNOWN),
            ],
        }
    }

    /// Last known status of `gateway`. Never touches the network or the store.
    pub fn status(&self, gateway: GatewayType) -> HealthStatus {
        self.local[gateway.index()].load().status
    }

    pub fn state(&self, gateway: GatewayType) -> ProbeState {
        self.local[gateway.index()].load().state
    }

    fn set_local(&self, gateway: GatewayType, health: GatewayHealth) {
        self.local[gateway.index()].store(Arc::new(health));
    }

    /// Spawns one probe loop per gateway. Each loop finishes its current
    /// cycle and exits once `shutdown` flips.
    pub fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        GatewayType::ALL
            .into_iter()
            .map(|gateway| {
                let monitor = Arc::clone(self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { monitor.probe_loop(gateway, shutdown).await })
            })
            .collect()
    }

    /// Runs until shutdown, then waits for every probe loop to finish.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        for result in join_all(self.start(shutdown)).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Health probe task failed");
            }
        }
    }

    async fn probe_loop(&self, gateway: GatewayType, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.settings.probe_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => self.run_cycle(gateway).await,
            }
        }
        tracing::info!(%gateway, "Health probe loop stopped");
    }

    /// One tick: probe if this instance wins the lease, then mirror the shared
    /// cache locally.
    pub async fn run_cycle(&self, gateway: GatewayType) {
        if self.try_acquire_lease(gateway).await {
            self.probe(gateway).await;
        }
        self.refresh(gateway).await;
    }

    async fn try_acquire_lease(&self, gateway: GatewayType) -> bool {
        match self
            .store
            .set_if_absent(&lease_key(gateway), &self.instance_id, self.settings.lease_ttl)
            .await
        {
            Ok(acquired) => acquired,
            Err(e) => {
                tracing::warn!(%gateway, error = %e, "Failed to acquire health lease");
                false
            }
        }
    }

    async fn probe(&self, gateway: GatewayType) -> HealthStatus {
        let previous = **self.local[gateway.index()].load();
        self.set_local(
            gateway,
            GatewayHealth {
                state: ProbeState::Probing,
                status: previous.status,
            },
        );

        let status = match self.gateways[gateway.index()].probe_health().await {
            Ok(body) => serde_json::from_slice::<HealthStatus>(&body).unwrap_or_else(|e| {
                tracing::warn!(%gateway, error = %e, "Unparseable health payload");
                HealthStatus::UNAVAILABLE
            }),
            Err(e) => {
                tracing::warn!(%gateway, error = %e, "Health probe failed");
                HealthStatus::UNAVAILABLE
            }
        };

        match serde_json::to_string(&status) {
            Ok(payload) => {
                if let Err(e) = self
                    .store
                    .set_with_ttl(&cache_key(gateway), &payload, self.settings.cache_ttl)
                    .await
                {
                    tracing::warn!(%gateway, error = %e, "Failed to publish health status");
                }
            }
            Err(e) => tracing::error!(%gateway, error = %e, "Failed to encode health status"),
        }

        self.set_local(gateway, GatewayHealth::from_status(status));
        tracing::info!(%gateway, ?status, instance = %self.instance_id, "Probed processor health");
        status
    }

    async fn refresh(&self, gateway: GatewayType) {
        let status = match self.store.get(&cache_key(gateway)).await {
            Ok(Some(payload)) => serde_json::from_str::<HealthStatus>(&payload).unwrap_or_else(|e| {
                tracing::warn!(%gateway, error = %e, "Unparseable cached health status");
                HealthStatus::UNAVAILABLE
            }),
            Ok(None) => HealthStatus::UNAVAILABLE,
            Err(e) => {
                tracing::warn!(%gateway, error = %e, "Failed to read cached health status");
                HealthStatus::UNAVAILABLE
            }
        };
        self.set_local(gateway, GatewayHealth::from_status(status));
    }
}
