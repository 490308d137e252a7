use super::LedgerStore;
use crate::error::{Result, SyncError};
use crate::models::{LedgerTransaction, Provider, ProviderTotals};
use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::debug;

/// Ledger kept in process memory, with injectable transient failures
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    state: Mutex<LedgerState>,
}

#[derive(Debug, Default)]
struct LedgerState {
    providers: Vec<Provider>,
    transactions: Vec<LedgerTransaction>,
    idempotency_keys: HashMap<String, i64>,
    failures_remaining: u32,
    append_calls: u32,
}

impl LedgerState {
    fn take_failure(&mut self, operation: &str) -> Result<()> {
        if self.failures_remaining > 0 {
            self.failures_remaining -= 1;
            return Err(SyncError::Unavailable(format!(
                "injected ledger failure in {}",
                operation
            )));
        }
        Ok(())
    }
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls fail with a transient error
    pub fn fail_next(&self, count: u32) {
        self.state.lock().failures_remaining = count;
    }

    /// Number of `append_transaction` invocations, including failed ones
    pub fn append_calls(&self) -> u32 {
        self.state.lock().append_calls
    }

    pub fn transactions(&self) -> Vec<LedgerTransaction> {
        self.state.lock().transactions.clone()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn create_provider(&self, name: &str, initial_value: Decimal) -> Result<i64> {
        let mut state = self.state.lock();
        state.take_failure("create_provider")?;

        if state.providers.iter().any(|p| p.name == name) {
            return Err(SyncError::Validation(format!(
                "Provider {} already exists",
                name
            )));
        }

        let id = state.providers.len() as i64 + 1;
        state.providers.push(Provider {
            id,
            name: name.to_string(),
            initial_value,
        });
        Ok(id)
    }

    async fn append_transaction(
        &self,
        provider_id: i64,
        value: Decimal,
        idempotency_key: Option<&str>,
    ) -> Result<i64> {
        let mut state = self.state.lock();
        state.append_calls += 1;
        state.take_failure("append_transaction")?;

        if !state.providers.iter().any(|p| p.id == provider_id) {
            return Err(SyncError::ProviderNotFound(provider_id));
        }

        if let Some(key) = idempotency_key {
            if let Some(&existing) = state.idempotency_keys.get(key) {
                let same = state
                    .transactions
                    .iter()
                    .any(|t| t.id == existing && t.provider_id == provider_id && t.value == value);
                if !same {
                    return Err(SyncError::IdempotencyConflict {
                        key: key.to_string(),
                        existing_id: existing,
                    });
                }
                debug!(transaction_id = existing, key, "Duplicate idempotency key");
                return Ok(existing);
            }
        }

        let id = state.transactions.len() as i64 + 1;
        state.transactions.push(LedgerTransaction {
            id,
            provider_id,
            value,
        });
        if let Some(key) = idempotency_key {
            state.idempotency_keys.insert(key.to_string(), id);
        }
        Ok(id)
    }

    async fn list_providers(&self) -> Result<Vec<Provider>> {
        let mut state = self.state.lock();
        state.take_failure("list_providers")?;
        Ok(state.providers.clone())
    }

    async fn list_transactions_since(&self, cursor_id: i64) -> Result<Vec<LedgerTransaction>> {
        let mut state = self.state.lock();
        state.take_failure("list_transactions_since")?;
        Ok(state
            .transactions
            .iter()
            .filter(|t| t.id > cursor_id)
            .cloned()
            .collect())
    }

    async fn transaction_totals_by_provider(&self) -> Result<ProviderTotals> {
        let mut state = self.state.lock();
        state.take_failure("transaction_totals_by_provider")?;

        let mut totals = ProviderTotals::default();
        for transaction in &state.transactions {
            let entry = totals
                .totals
                .entry(transaction.provider_id)
                .or_insert(Decimal::ZERO);
            *entry = entry.checked_add(transaction.value).ok_or_else(|| {
                SyncError::Internal(format!(
                    "Total overflow for provider {}",
                    transaction.provider_id
                ))
            })?;
            totals.last_transaction_id = totals.last_transaction_id.max(transaction.id);
        }
        Ok(totals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_ids_are_assigned_in_order() {
        let ledger = InMemoryLedgerStore::new();
        let visa = ledger.create_provider("Visa", dec!(1000.00)).await.unwrap();

        let first = ledger.append_transaction(visa, dec!(1), None).await.unwrap();
        let second = ledger.append_transaction(visa, dec!(2), None).await.unwrap();
        assert!(second > first);

        let since = ledger.list_transactions_since(first).await.unwrap();
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].id, second);
    }

    #[tokio::test]
    async fn test_unknown_provider() {
        let ledger = InMemoryLedgerStore::new();
        let result = ledger.append_transaction(7, dec!(1), None).await;
        assert!(matches!(result, Err(SyncError::ProviderNotFound(7))));
    }

    #[tokio::test]
    async fn test_duplicate_key_returns_existing_id() {
        let ledger = InMemoryLedgerStore::new();
        let visa = ledger.create_provider("Visa", dec!(1000.00)).await.unwrap();

        let first = ledger
            .append_transaction(visa, dec!(5), Some("evt-1"))
            .await
            .unwrap();
        let again = ledger
            .append_transaction(visa, dec!(5), Some("evt-1"))
            .await
            .unwrap();

        assert_eq!(first, again);
        assert_eq!(ledger.transactions().len(), 1);
    }

    #[tokio::test]
    async fn test_reused_key_with_different_payload_conflicts() {
        let ledger = InMemoryLedgerStore::new();
        let visa = ledger.create_provider("Visa", dec!(1000.00)).await.unwrap();

        ledger
            .append_transaction(visa, dec!(5), Some("LEDGER:1"))
            .await
            .unwrap();
        let result = ledger
            .append_transaction(visa, dec!(7), Some("LEDGER:1"))
            .await;

        assert!(matches!(
            result,
            Err(SyncError::IdempotencyConflict { existing_id: 1, .. })
        ));
        assert_eq!(ledger.transactions().len(), 1);
    }

    #[tokio::test]
    async fn test_totals_overflow_is_an_error() {
        let ledger = InMemoryLedgerStore::new();
        let visa = ledger.create_provider("Visa", Decimal::ZERO).await.unwrap();
        ledger.append_transaction(visa, Decimal::MAX, None).await.unwrap();
        ledger.append_transaction(visa, Decimal::MAX, None).await.unwrap();

        let result = ledger.transaction_totals_by_provider().await;
        assert!(matches!(result, Err(SyncError::Internal(_))));
    }

    #[tokio::test]
    async fn test_totals_track_snapshot_head() {
        let ledger = InMemoryLedgerStore::new();
        let visa = ledger.create_provider("Visa", dec!(1000.00)).await.unwrap();
        let mastercard = ledger.create_provider("Mastercard", dec!(2000.00)).await.unwrap();

        ledger.append_transaction(visa, dec!(100.00), None).await.unwrap();
        ledger.append_transaction(mastercard, dec!(-200.00), None).await.unwrap();
        ledger.append_transaction(visa, dec!(200.00), None).await.unwrap();

        let totals = ledger.transaction_totals_by_provider().await.unwrap();
        assert_eq!(totals.totals[&visa], dec!(300.00));
        assert_eq!(totals.totals[&mastercard], dec!(-200.00));
        assert_eq!(totals.last_transaction_id, 3);
    }

    #[tokio::test]
    async fn test_injected_failures_are_transient() {
        let ledger = InMemoryLedgerStore::new();
        ledger.fail_next(1);

        let err = ledger.list_providers().await.unwrap_err();
        assert!(err.is_retryable());
        assert!(ledger.list_providers().await.is_ok());
    }
}
