pub mod memory;
pub mod redis_store;

use crate::error::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::BTreeMap;

pub use memory::InMemoryCacheStore;
pub use redis_store::RedisCacheStore;

/// Default reserved key holding the sync cursor
pub const DEFAULT_CURSOR_KEY: &str = "last_processed_id";

/// Derived key/value view of provider balances plus the sync cursor
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Decimal>>;

    async fn set(&self, key: &str, value: Decimal) -> Result<()>;

    /// Highest transaction id incorporated into the cache, 0 if never synced
    async fn last_processed_id(&self) -> Result<i64>;

    /// Write every balance and the cursor as one atomic unit.
    ///
    /// Either all keys are updated or none are, so a failed commit leaves
    /// the previous snapshot and cursor intact.
    async fn commit(&self, balances: &BTreeMap<String, Decimal>, cursor: i64) -> Result<()>;
}
