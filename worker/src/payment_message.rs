use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use thiserror::Error;

pub const CORRELATION_ID_FIELD: &str = "correlationId";
pub const AMOUNT_FIELD: &str = "amount";

/// Largest amount admitted. Keeps any realistic number of summed payments
/// well inside `Decimal`'s range.
pub const MAX_AMOUNT: Decimal = Decimal::from_parts(0xA4C6_8000, 0x38D7E, 0, false, 0);

/// A payment as admitted at the edge and carried through the queue.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PaymentMessage {
    #[serde(rename = "correlationId")]
    pub correlation_id: String,
    pub amount: Decimal,
}

#[derive(Debug, Error, PartialEq)]
pub enum MalformedEntry {
    #[error("field `{0}` is missing")]
    MissingField(&'static str),
    #[error("field `{field}` is invalid: {value:?}")]
    InvalidField { field: &'static str, value: String },
}

impl PaymentMessage {
    pub fn new(correlation_id: impl Into<String>, amount: Decimal) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            amount,
        }
    }

    /// Whether the message may enter the queue: a non-empty correlation id and
    /// an amount within `[0, MAX_AMOUNT]`.
    pub fn is_admissible(&self) -> bool {
        !self.correlation_id.is_empty() && is_admissible_amount(self.amount)
    }

    /// Field/value pairs written to the stream for this message.
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            (CORRELATION_ID_FIELD, self.correlation_id.clone()),
            (AMOUNT_FIELD, self.amount.to_string()),
        ]
    }

    /// Decodes a message from raw stream fields. Entries that fail here can
    /// never be processed.
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, MalformedEntry> {
        let correlation_id = fields
            .get(CORRELATION_ID_FIELD)
            .ok_or(MalformedEntry::MissingField(CORRELATION_ID_FIELD))?;
        if correlation_id.is_empty() {
            return Err(MalformedEntry::InvalidField {
                field: CORRELATION_ID_FIELD,
                value: correlation_id.clone(),
            });
        }

        let raw_amount = fields
            .get(AMOUNT_FIELD)
            .ok_or(MalformedEntry::MissingField(AMOUNT_FIELD))?;
        let amount = Decimal::from_str(raw_amount.trim())
            .ok()
            .filter(|amount| is_admissible_amount(*amount))
            .ok_or_else(|| MalformedEntry::InvalidField {
                field: AMOUNT_FIELD,
                value: raw_amount.clone(),
            })?;

        Ok(Self {
            correlation_id: correlation_id.clone(),
            amount,
        })
    }
}

fn is_admissible_amount(amount: Decimal) -> bool {
    !amount.is_sign_negative() && amount <= MAX_AMOUNT
}
