//! Balance aggregation
//!
//! Pure functions over ledger rows. All arithmetic is exact decimal
//! arithmetic, so the order in which transactions are summed never changes
//! the result.

use crate::error::{Result, SyncError};
use crate::models::{LedgerTransaction, Provider};
use rust_decimal::Decimal;
use std::collections::BTreeMap;

/// Per-provider deltas for one range of transactions
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BalanceBatch {
    pub deltas: BTreeMap<i64, Decimal>,
    /// Highest transaction id in the range, 0 for an empty range
    pub last_transaction_id: i64,
    pub transaction_count: usize,
}

impl BalanceBatch {
    pub fn is_empty(&self) -> bool {
        self.transaction_count == 0
    }
}

/// Map of provider id to starting balance
pub fn initial_values(providers: &[Provider]) -> BTreeMap<i64, Decimal> {
    providers
        .iter()
        .map(|p| (p.id, p.initial_value))
        .collect()
}

/// Sum transaction values per provider.
///
/// `initial_values` is passed only on the first sync (cursor 0); each
/// provider's starting balance is then added exactly once, including
/// providers without transactions in the range.
pub fn aggregate(
    transactions: &[LedgerTransaction],
    initial_values: Option<&BTreeMap<i64, Decimal>>,
) -> Result<BalanceBatch> {
    let mut batch = BalanceBatch {
        transaction_count: transactions.len(),
        ..Default::default()
    };

    for transaction in transactions {
        let entry = batch
            .deltas
            .entry(transaction.provider_id)
            .or_insert(Decimal::ZERO);
        *entry = checked_add(*entry, transaction.value)?;
        batch.last_transaction_id = batch.last_transaction_id.max(transaction.id);
    }

    if let Some(initial) = initial_values {
        for (provider_id, initial_value) in initial {
            let entry = batch.deltas.entry(*provider_id).or_insert(Decimal::ZERO);
            *entry = checked_add(*entry, *initial_value)?;
        }
    }

    Ok(batch)
}

/// Full balances from scratch: `initial_value + total` for every provider
pub fn seed_balances(
    providers: &[Provider],
    totals: &BTreeMap<i64, Decimal>,
) -> Result<BTreeMap<i64, Decimal>> {
    providers
        .iter()
        .map(|p| {
            let total = totals.get(&p.id).copied().unwrap_or(Decimal::ZERO);
            Ok((p.id, checked_add(p.initial_value, total)?))
        })
        .collect()
}

/// Add deltas to current balances; a provider absent from `current` starts
/// at zero. Only providers with a delta appear in the result.
pub fn apply_deltas(
    current: &BTreeMap<i64, Decimal>,
    deltas: &BTreeMap<i64, Decimal>,
) -> Result<BTreeMap<i64, Decimal>> {
    deltas
        .iter()
        .map(|(provider_id, delta)| {
            let balance = current.get(provider_id).copied().unwrap_or(Decimal::ZERO);
            Ok((*provider_id, checked_add(balance, *delta)?))
        })
        .collect()
}

fn checked_add(a: Decimal, b: Decimal) -> Result<Decimal> {
    a.checked_add(b)
        .ok_or_else(|| SyncError::Internal(format!("Balance overflow adding {} to {}", b, a)))
}
