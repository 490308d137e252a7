use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::{Result, SyncError};

/// Account with a starting balance, created once at bootstrap
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Provider {
    pub id: i64,
    pub name: String,
    pub initial_value: Decimal,
}

impl Provider {
    /// Balance cache key, `{id}_{name}`
    pub fn cache_key(&self) -> String {
        format!("{}_{}", self.id, self.name)
    }
}

/// Immutable ledger row; `id` is the only ordering key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct LedgerTransaction {
    pub id: i64,
    pub provider_id: i64,
    pub value: Decimal,
}

/// Per-provider sums read in one snapshot, with the snapshot's head id
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderTotals {
    pub totals: BTreeMap<i64, Decimal>,
    pub last_transaction_id: i64,
}

/// Decimal places the ledger stores for an amount
pub const AMOUNT_SCALE: u32 = 2;

/// Largest magnitude a `NUMERIC(18, 2)` column holds
pub fn max_amount() -> Decimal {
    Decimal::new(999_999_999_999_999_999, AMOUNT_SCALE)
}

/// Check that `value` is stored exactly by the ledger's `NUMERIC(18, 2)`
/// columns instead of being rounded or overflowing
pub fn validate_amount(value: Decimal) -> std::result::Result<(), String> {
    if value.normalize().scale() > AMOUNT_SCALE {
        return Err(format!(
            "{} has more than {} decimal places",
            value, AMOUNT_SCALE
        ));
    }
    if value.abs() > max_amount() {
        return Err(format!("{} exceeds the maximum amount {}", value, max_amount()));
    }
    Ok(())
}

/// Inbound queue payload: `{"id": <provider id>, "value": <amount>}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionEvent {
    /// Provider the transaction belongs to
    pub id: i64,
    pub value: Decimal,
    /// Client-assigned idempotency key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<Uuid>,
}

impl TransactionEvent {
    pub fn new(provider_id: i64, value: Decimal) -> Self {
        Self {
            id: provider_id,
            value,
            event_id: Some(Uuid::new_v4()),
        }
    }

    /// Decode and validate a raw message body
    pub fn from_slice(payload: &[u8]) -> Result<Self> {
        let event: TransactionEvent = serde_json::from_slice(payload)
            .map_err(|e| SyncError::Validation(format!("Invalid message body: {}", e)))?;

        if event.id <= 0 {
            return Err(SyncError::Validation(format!(
                "Provider id must be positive, got {}",
                event.id
            )));
        }

        validate_amount(event.value).map_err(SyncError::Validation)?;

        Ok(event)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}
