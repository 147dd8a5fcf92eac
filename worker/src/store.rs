use crate::broker::{BrokerError, KeyValueStore};
use crate::gateway_type::GatewayType;
use crate::payment::Payment;
use rust_decimal::Decimal;
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
#[error("summed amount of {count} payments exceeds the decimal range")]
pub struct AmountOverflow {
    pub count: usize,
}

/// A completed payment as kept in a gateway's summary index.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryRecord {
    pub correlation_id: String,
    pub amount: Decimal,
}

impl SummaryRecord {
    fn encode(&self) -> String {
        format!("{}:{}", self.correlation_id, self.amount)
    }

    fn decode(member: &str) -> Option<Self> {
        let (correlation_id, amount) = member.rsplit_once(':')?;
        Some(Self {
            correlation_id: correlation_id.to_string(),
            amount: Decimal::from_str(amount).ok()?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct GatewaySummary {
    #[serde(rename = "totalRequests")]
    pub total_requests: u64,
    #[serde(rename = "totalAmount")]
    pub total_amount: Decimal,
}

impl GatewaySummary {
    pub fn from_records(records: &[SummaryRecord]) -> Result<Self, AmountOverflow> {
        let total_amount = records
            .iter()
            .try_fold(Decimal::ZERO, |total, r| total.checked_add(r.amount))
            .ok_or(AmountOverflow {
                count: records.len(),
            })?;
        Ok(Self {
            total_requests: records.len() as u64,
            total_amount,
        })
    }
}

pub fn summary_key(gateway: GatewayType) -> String {
    format!("payments:{}", gateway)
}

/// Per-gateway index of completed payments ordered by request time.
pub struct SummaryStore {
    store: Arc<dyn KeyValueStore>,
}

impl SummaryStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub async fn record(&self, payment: &Payment) -> Result<(), BrokerError> {
        let record = SummaryRecord {
            correlation_id: payment.correlation_id.clone(),
            amount: payment.amount,
        };
        self.store
            .sorted_add(
                &summary_key(payment.gateway),
                payment.score() as f64,
                &record.encode(),
            )
            .await
    }

    /// Records scored within `[from, to]` nanoseconds since the epoch.
    pub async fn range_query(
        &self,
        gateway: GatewayType,
        from: i128,
        to: i128,
    ) -> Result<Vec<SummaryRecord>, BrokerError> {
        let members = self
            .store
            .sorted_range_by_score(&summary_key(gateway), from as f64, to as f64)
            .await?;

        Ok(members
            .iter()
            .filter_map(|member| {
                let record = SummaryRecord::decode(member);
                if record.is_none() {
                    tracing::warn!(%gateway, member = %member, "Skipping undecodable summary entry");
                }
                record
            })
            .collect())
    }

    pub async fn purge(&self) -> Result<(), BrokerError> {
        let keys = GatewayType::ALL.map(summary_key);
        let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
        self.store.delete_keys(&keys).await?;
        Ok(())
    }
}
