// Synthetic publisher - feeds the queue with random transaction events for
// demo and load purposes. Best effort: failed publishes are skipped.

use crate::config::PublisherConfig;
use crate::error::{Result, SyncError};
use crate::ledger::LedgerStore;
use crate::metrics::PUBLISHED_TOTAL;
use crate::models::TransactionEvent;
use crate::queue::EventPublisher;
use crate::retry::RetryExecutor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct SyntheticPublisher {
    publisher: Arc<dyn EventPublisher>,
    ledger: Arc<dyn LedgerStore>,
    retry: RetryExecutor,
    interval_ms: (u64, u64),
    value_cents: (i64, i64),
}

impl SyntheticPublisher {
    pub fn new(
        publisher: Arc<dyn EventPublisher>,
        ledger: Arc<dyn LedgerStore>,
        retry: RetryExecutor,
        config: &PublisherConfig,
    ) -> Result<Self> {
        let (min_value, max_value) = config.value_range().map_err(SyncError::Config)?;

        Ok(Self {
            publisher,
            ledger,
            retry,
            interval_ms: (config.min_interval_ms, config.max_interval_ms),
            value_cents: (to_cents(min_value)?, to_cents(max_value)?),
        })
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut rng = StdRng::from_entropy();
        info!(
            min_interval_ms = self.interval_ms.0,
            max_interval_ms = self.interval_ms.1,
            "Synthetic publisher started"
        );

        loop {
            let pause = Duration::from_millis(rng.gen_range(self.interval_ms.0..=self.interval_ms.1));

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Synthetic publisher stopping");
                    break;
                }
                _ = tokio::time::sleep(pause) => {}
            }

            if let Err(e) = self.publish_one(&mut rng).await {
                warn!("Synthetic publish aborted: {}", e);
            }
        }
    }

    /// Publish one random event; `None` when nothing was published
    pub async fn publish_one<R: Rng + Send>(&self, rng: &mut R) -> Result<Option<TransactionEvent>> {
        let providers = self
            .retry
            .execute("list_providers", || {
                let ledger = Arc::clone(&self.ledger);
                async move { ledger.list_providers().await }
            })
            .await?;

        if providers.is_empty() {
            debug!("No providers to publish for");
            return Ok(None);
        }

        let provider = &providers[rng.gen_range(0..providers.len())];
        let cents = rng.gen_range(self.value_cents.0..=self.value_cents.1);
        let event = TransactionEvent::new(provider.id, Decimal::new(cents, 2));

        let published = self
            .retry
            .execute("publish_event", || {
                let publisher = Arc::clone(&self.publisher);
                let event = event.clone();
                async move { publisher.publish(&event).await.map(|_| true) }
            })
            .await?;

        if !published {
            PUBLISHED_TOTAL.with_label_values(&["skipped"]).inc();
            return Ok(None);
        }

        PUBLISHED_TOTAL.with_label_values(&["published"]).inc();
        debug!(provider_id = event.id, value = %event.value, "Synthetic event published");
        Ok(Some(event))
    }
}

fn to_cents(value: Decimal) -> Result<i64> {
    value
        .checked_mul(Decimal::ONE_HUNDRED)
        .and_then(|cents| cents.round().to_i64())
        .ok_or_else(|| SyncError::Config(format!("Publisher value out of range: {}", value)))
}
