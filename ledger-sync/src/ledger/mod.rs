pub mod memory;
pub mod postgres;

use crate::error::Result;
use crate::models::{LedgerTransaction, Provider, ProviderTotals};
use async_trait::async_trait;
use rust_decimal::Decimal;

pub use memory::InMemoryLedgerStore;
pub use postgres::PgLedgerStore;

/// Durable, append-only record of providers and their transactions
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn create_provider(&self, name: &str, initial_value: Decimal) -> Result<i64>;

    /// Append a transaction and return its id.
    ///
    /// A repeated `idempotency_key` returns the id of the row already stored
    /// for that key instead of appending again. Fails with
    /// `SyncError::ProviderNotFound` if `provider_id` is unknown.
    async fn append_transaction(
        &self,
        provider_id: i64,
        value: Decimal,
        idempotency_key: Option<&str>,
    ) -> Result<i64>;

    async fn list_providers(&self) -> Result<Vec<Provider>>;

    /// Transactions with `id > cursor_id`, ascending by id
    async fn list_transactions_since(&self, cursor_id: i64) -> Result<Vec<LedgerTransaction>>;

    /// Sum of transaction values per provider, read in a single snapshot
    async fn transaction_totals_by_provider(&self) -> Result<ProviderTotals>;
}
