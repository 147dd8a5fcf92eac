use crate::gateway_type::GatewayType;
use rust_decimal::Decimal;
use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq)]
pub struct Payment {
    pub correlation_id: String,
    pub amount: Decimal,
    pub requested_at: OffsetDateTime,
    pub gateway: GatewayType,
}

impl Payment {
    pub fn new(
        correlation_id: String,
        amount: Decimal,
        gateway: GatewayType,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            correlation_id,
            amount,
            gateway,
            requested_at: now,
        }
    }

    /// Nanosecond epoch of `requested_at`, the score used by the summary index.
    pub fn score(&self) -> i128 {
        self.requested_at.unix_timestamp_nanos()
    }
}

/// Drops sub-millisecond precision so the timestamp sent upstream and the one
/// indexed in the summary store are the same instant.
pub fn truncate_to_millis(at: OffsetDateTime) -> OffsetDateTime {
    at.replace_nanosecond(at.millisecond() as u32 * 1_000_000)
        .unwrap_or(at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn score_is_nanosecond_epoch() {
        let payment = Payment::new(
            "a1".to_string(),
            Decimal::new(1990, 2),
            GatewayType::Default,
            datetime!(2025-01-01 00:00:01 UTC),
        );
        assert_eq!(payment.score(), 1_735_689_601_000_000_000);
    }

    #[test]
    fn truncates_below_milliseconds() {
        let at = datetime!(2025-07-15 12:34:56.123456789 UTC);
        assert_eq!(truncate_to_millis(at), datetime!(2025-07-15 12:34:56.123 UTC));
    }
}
