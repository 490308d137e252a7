// Ledger Sync Library
// Queue-to-ledger ingestion and ledger-to-cache balance reconciliation

pub mod aggregator;
pub mod bootstrap;
pub mod cache;
pub mod config;
pub mod error;
pub mod ingestion;
pub mod ledger;
pub mod metrics;
pub mod models;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod server;

// Re-exports
pub use cache::{CacheStore, InMemoryCacheStore, RedisCacheStore};
pub use config::Config;
pub use error::{ErrorKind, Result, SyncError};
pub use ingestion::{IngestOutcome, IngestionWorker};
pub use ledger::{InMemoryLedgerStore, LedgerStore, PgLedgerStore};
pub use models::*;
pub use retry::{ExhaustionPolicy, RetryConfig, RetryExecutor};
pub use scheduler::{CycleReport, FillReport, SyncScheduler};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const SERVICE_NAME: &str = "ledger-sync";
