//! Sync scheduler
//!
//! Periodically folds ledger transactions past the cache cursor into the
//! balance cache. Each cycle commits every updated balance together with the
//! new cursor in one atomic cache write, so a failed cycle leaves the cache
//! exactly as it was and the next cycle reprocesses the same range.
//!
//! Cycles and the startup fill are single-flight: they share one async
//! mutex, so two reconciliations never read and write the cache at the same
//! time.

use crate::aggregator;
use crate::cache::CacheStore;
use crate::error::{Result, SyncError};
use crate::ledger::LedgerStore;
use crate::metrics::{SYNC_CURSOR, SYNC_CYCLES_TOTAL};
use crate::models::Provider;
use crate::retry::RetryExecutor;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Result of one reconciliation cycle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub previous_cursor: i64,
    pub cursor: i64,
    pub transactions: usize,
    /// Balances written, by cache key
    pub balances: BTreeMap<String, Decimal>,
}

impl CycleReport {
    pub fn is_empty(&self) -> bool {
        self.transactions == 0
    }
}

/// Result of the startup fill
#[derive(Debug, Clone, PartialEq)]
pub struct FillReport {
    pub cursor: i64,
    pub balances: BTreeMap<String, Decimal>,
}

pub struct SyncScheduler {
    ledger: Arc<dyn LedgerStore>,
    cache: Arc<dyn CacheStore>,
    retry: RetryExecutor,
    interval: Duration,
    cycle_lock: Mutex<()>,
}

impl SyncScheduler {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        cache: Arc<dyn CacheStore>,
        retry: RetryExecutor,
        interval: Duration,
    ) -> Self {
        Self {
            ledger,
            cache,
            retry,
            interval,
            cycle_lock: Mutex::new(()),
        }
    }

    /// Run a cycle every interval until shutdown. The first cycle starts one
    /// full interval after the call; a cycle in progress when shutdown is
    /// requested is allowed to finish.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_secs = self.interval.as_secs(), "Sync scheduler started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Sync scheduler stopping");
                    break;
                }
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.run_cycle().await {
                error!(error = %e, "Sync cycle failed, cursor unchanged");
            }
        }
    }

    /// Fold every transaction past the cache cursor into the cache
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let _guard = self.cycle_lock.lock().await;

        let result = self.reconcile().await;
        let outcome = match &result {
            Ok(report) if report.is_empty() => "empty",
            Ok(_) => "applied",
            Err(_) => "failed",
        };
        SYNC_CYCLES_TOTAL.with_label_values(&[outcome]).inc();

        result
    }

    async fn reconcile(&self) -> Result<CycleReport> {
        let cursor = self.read_cursor().await?;

        let transactions = self
            .retry
            .execute("list_transactions_since", || {
                let ledger = Arc::clone(&self.ledger);
                async move { ledger.list_transactions_since(cursor).await }
            })
            .await?;

        if transactions.is_empty() {
            debug!(cursor, "No new transactions");
            return Ok(CycleReport {
                previous_cursor: cursor,
                cursor,
                ..Default::default()
            });
        }

        let providers = self.list_providers().await?;

        // Starting balances are folded in exactly once, on the very first sync
        let initial_values = (cursor == 0).then(|| aggregator::initial_values(&providers));
        let batch = aggregator::aggregate(&transactions, initial_values.as_ref())?;

        let by_id: HashMap<i64, &Provider> = providers.iter().map(|p| (p.id, p)).collect();

        let mut current = BTreeMap::new();
        for provider_id in batch.deltas.keys() {
            let provider = by_id
                .get(provider_id)
                .ok_or(SyncError::ProviderNotFound(*provider_id))?;
            if let Some(balance) = self.read_balance(provider).await? {
                current.insert(*provider_id, balance);
            }
        }

        let updated = aggregator::apply_deltas(&current, &batch.deltas)?;
        let balances = keyed_balances(&by_id, &updated)?;
        let new_cursor = batch.last_transaction_id.max(cursor);

        self.commit(&balances, new_cursor).await?;

        info!(
            previous_cursor = cursor,
            cursor = new_cursor,
            transactions = batch.transaction_count,
            providers = balances.len(),
            "Sync cycle applied"
        );

        Ok(CycleReport {
            previous_cursor: cursor,
            cursor: new_cursor,
            transactions: batch.transaction_count,
            balances,
        })
    }

    /// Seed the cache from every historical transaction.
    ///
    /// Does nothing on an empty ledger. Refuses to run when the cache cursor
    /// is ahead of the ledger, which means the cache belongs to another
    /// ledger.
    pub async fn fill_cache(&self) -> Result<Option<FillReport>> {
        let _guard = self.cycle_lock.lock().await;

        let totals = self
            .retry
            .execute("transaction_totals_by_provider", || {
                let ledger = Arc::clone(&self.ledger);
                async move { ledger.transaction_totals_by_provider().await }
            })
            .await?;

        if totals.last_transaction_id == 0 {
            info!("Ledger has no transactions, skipping cache fill");
            return Ok(None);
        }

        let cursor = self.read_cursor().await?;
        if cursor > totals.last_transaction_id {
            return Err(SyncError::CursorAhead {
                cache_cursor: cursor,
                ledger_head: totals.last_transaction_id,
            });
        }

        let providers = self.list_providers().await?;
        let by_id: HashMap<i64, &Provider> = providers.iter().map(|p| (p.id, p)).collect();

        if let Some(unknown) = totals.totals.keys().find(|id| !by_id.contains_key(id)) {
            return Err(SyncError::ProviderNotFound(*unknown));
        }

        let seeded = aggregator::seed_balances(&providers, &totals.totals)?;
        let balances = keyed_balances(&by_id, &seeded)?;

        self.commit(&balances, totals.last_transaction_id).await?;

        info!(
            cursor = totals.last_transaction_id,
            providers = balances.len(),
            "Cache filled from ledger"
        );

        Ok(Some(FillReport {
            cursor: totals.last_transaction_id,
            balances,
        }))
    }

    async fn read_cursor(&self) -> Result<i64> {
        self.retry
            .execute("read_cursor", || {
                let cache = Arc::clone(&self.cache);
                async move { cache.last_processed_id().await }
            })
            .await
    }

    async fn list_providers(&self) -> Result<Vec<Provider>> {
        self.retry
            .execute("list_providers", || {
                let ledger = Arc::clone(&self.ledger);
                async move { ledger.list_providers().await }
            })
            .await
    }

    async fn read_balance(&self, provider: &Provider) -> Result<Option<Decimal>> {
        let key = provider.cache_key();
        self.retry
            .execute("read_balance", || {
                let cache = Arc::clone(&self.cache);
                let key = key.clone();
                async move { cache.get(&key).await }
            })
            .await
    }

    async fn commit(&self, balances: &BTreeMap<String, Decimal>, cursor: i64) -> Result<()> {
        self.retry
            .execute("commit_balances", || {
                let cache = Arc::clone(&self.cache);
                async move { cache.commit(balances, cursor).await }
            })
            .await?;

        SYNC_CURSOR.set(cursor);
        Ok(())
    }
}

fn keyed_balances(
    providers: &HashMap<i64, &Provider>,
    balances: &BTreeMap<i64, Decimal>,
) -> Result<BTreeMap<String, Decimal>> {
    balances
        .iter()
        .map(|(provider_id, balance)| {
            let provider = providers
                .get(provider_id)
                .ok_or(SyncError::ProviderNotFound(*provider_id))?;
            Ok((provider.cache_key(), *balance))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCacheStore;
    use crate::ledger::InMemoryLedgerStore;
    use crate::retry::{ExhaustionPolicy, RetryConfig};
    use rust_decimal_macros::dec;

    fn strict_retry() -> RetryExecutor {
        RetryExecutor::new(
            RetryConfig {
                max_attempts: 3,
                delay: Duration::from_millis(10),
                policy: ExhaustionPolicy::Propagate,
                ..Default::default()
            },
            CancellationToken::new(),
        )
    }

    async fn setup() -> (Arc<InMemoryLedgerStore>, Arc<InMemoryCacheStore>, SyncScheduler) {
        let ledger = Arc::new(InMemoryLedgerStore::new());
        ledger.create_provider("Visa", dec!(1000.00)).await.unwrap();
        ledger.create_provider("Mastercard", dec!(2000.00)).await.unwrap();

        let cache = Arc::new(InMemoryCacheStore::new());
        let scheduler = SyncScheduler::new(
            ledger.clone(),
            cache.clone(),
            strict_retry(),
            Duration::from_secs(60),
        );
        (ledger, cache, scheduler)
    }

    #[tokio::test]
    async fn test_empty_cycle_writes_nothing() {
        let (_ledger, cache, scheduler) = setup().await;

        let report = scheduler.run_cycle().await.unwrap();

        assert!(report.is_empty());
        assert_eq!(cache.cursor_writes(), 0);
        assert!(cache.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_first_cycle_seeds_idle_providers() {
        let (ledger, cache, scheduler) = setup().await;
        ledger.append_transaction(1, dec!(10.00), None).await.unwrap();

        scheduler.run_cycle().await.unwrap();

        assert_eq!(cache.get("1_Visa").await.unwrap(), Some(dec!(1010.00)));
        assert_eq!(cache.get("2_Mastercard").await.unwrap(), Some(dec!(2000.00)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_commit_keeps_cursor_and_retries_cleanly() {
        let (ledger, cache, scheduler) = setup().await;
        ledger.append_transaction(1, dec!(100.00), None).await.unwrap();
        cache.fail_commits(3);

        assert!(scheduler.run_cycle().await.is_err());
        assert_eq!(cache.last_processed_id().await.unwrap(), 0);
        assert!(cache.snapshot().is_empty());

        let report = scheduler.run_cycle().await.unwrap();
        assert_eq!(report.cursor, 1);
        assert_eq!(cache.get("1_Visa").await.unwrap(), Some(dec!(1100.00)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_read_failure_is_retried() {
        let (ledger, cache, scheduler) = setup().await;
        ledger.append_transaction(2, dec!(-5.00), None).await.unwrap();
        cache.fail_reads(2);

        let report = scheduler.run_cycle().await.unwrap();

        assert_eq!(report.cursor, 1);
        assert_eq!(cache.get("2_Mastercard").await.unwrap(), Some(dec!(1995.00)));
    }

    #[tokio::test]
    async fn test_concurrent_cycles_do_not_double_count() {
        let (ledger, cache, scheduler) = setup().await;
        ledger.append_transaction(1, dec!(100.00), None).await.unwrap();

        let (first, second) = tokio::join!(scheduler.run_cycle(), scheduler.run_cycle());
        first.unwrap();
        second.unwrap();

        assert_eq!(cache.get("1_Visa").await.unwrap(), Some(dec!(1100.00)));
        assert_eq!(cache.cursor_writes(), 1);
    }

    #[tokio::test]
    async fn test_fill_on_empty_ledger_is_noop() {
        let (_ledger, cache, scheduler) = setup().await;

        assert_eq!(scheduler.fill_cache().await.unwrap(), None);
        assert_eq!(cache.cursor_writes(), 0);
    }

    #[tokio::test]
    async fn test_fill_refuses_cursor_ahead_of_ledger() {
        let (ledger, cache, scheduler) = setup().await;
        ledger.append_transaction(1, dec!(1.00), None).await.unwrap();
        cache.commit(&BTreeMap::new(), 10).await.unwrap();

        let err = scheduler.fill_cache().await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::CursorAhead {
                cache_cursor: 10,
                ledger_head: 1
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_fires_after_one_interval() {
        let (ledger, cache, scheduler) = setup().await;
        ledger.append_transaction(1, dec!(100.00), None).await.unwrap();

        let scheduler = Arc::new(scheduler);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let scheduler = Arc::clone(&scheduler);
            let cancel = cancel.clone();
            async move { scheduler.run(cancel).await }
        });

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(cache.cursor_writes(), 0);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(cache.last_processed_id().await.unwrap(), 1);

        cancel.cancel();
        handle.await.unwrap();
    }
}
