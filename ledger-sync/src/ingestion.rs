// Ingestion worker - appends queued transaction events to the ledger
//
// Messages are processed strictly one at a time. A message is acked only
// after its ledger row is durable; malformed or permanently invalid messages
// are rejected; anything else stays unacked for broker redelivery.

use crate::error::{ErrorKind, Result};
use crate::ledger::LedgerStore;
use crate::metrics::EVENTS_TOTAL;
use crate::models::TransactionEvent;
use crate::queue::Delivery;
use crate::retry::RetryExecutor;
use futures::{Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Terminal state of one delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Appended to the ledger and acknowledged
    Acknowledged { transaction_id: i64 },
    /// Dropped without a ledger write
    Rejected { reason: String },
    /// Left unacknowledged for redelivery
    Failed { error: String },
}

impl IngestOutcome {
    fn label(&self) -> &'static str {
        match self {
            IngestOutcome::Acknowledged { .. } => "acknowledged",
            IngestOutcome::Rejected { .. } => "rejected",
            IngestOutcome::Failed { .. } => "failed",
        }
    }
}

/// Pause after a failed receive before polling the stream again
const RECEIVE_ERROR_PAUSE: Duration = Duration::from_secs(1);

pub struct IngestionWorker {
    ledger: Arc<dyn LedgerStore>,
    retry: RetryExecutor,
}

impl IngestionWorker {
    pub fn new(ledger: Arc<dyn LedgerStore>, retry: RetryExecutor) -> Self {
        Self { ledger, retry }
    }

    /// Take deliveries until the stream ends or shutdown is requested
    pub async fn run<S, D>(&self, deliveries: S, cancel: CancellationToken)
    where
        S: Stream<Item = Result<D>>,
        D: Delivery,
    {
        futures::pin_mut!(deliveries);
        info!("Ingestion worker started");

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Ingestion worker stopping");
                    break;
                }
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    self.process(&delivery).await;
                }
                Some(Err(e)) => {
                    error!("Error receiving delivery: {}", e);
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            info!("Ingestion worker stopping");
                            break;
                        }
                        _ = tokio::time::sleep(RECEIVE_ERROR_PAUSE) => {}
                    }
                }
                None => {
                    warn!("Delivery stream closed");
                    break;
                }
            }
        }
    }

    /// Validate, append and settle a single delivery
    pub async fn process<D: Delivery + ?Sized>(&self, delivery: &D) -> IngestOutcome {
        let outcome = self.handle(delivery).await;
        EVENTS_TOTAL.with_label_values(&[outcome.label()]).inc();
        outcome
    }

    async fn handle<D: Delivery + ?Sized>(&self, delivery: &D) -> IngestOutcome {
        let event = match TransactionEvent::from_slice(delivery.payload()) {
            Ok(event) => event,
            Err(e) => {
                error!(
                    key = ?delivery.delivery_key(),
                    "Rejecting malformed message: {}", e
                );
                return self.reject(delivery, e.to_string()).await;
            }
        };

        let idempotency_key = event
            .event_id
            .map(|id| id.to_string())
            .or_else(|| delivery.delivery_key());

        let result = self
            .retry
            .execute("append_transaction", || {
                let ledger = Arc::clone(&self.ledger);
                let key = idempotency_key.clone();
                async move {
                    ledger
                        .append_transaction(event.id, event.value, key.as_deref())
                        .await
                }
            })
            .await;

        match result {
            Ok(transaction_id) => {
                info!(
                    transaction_id,
                    provider_id = event.id,
                    value = %event.value,
                    "Transaction appended"
                );
                // A failed ack means redelivery; the idempotency key absorbs it
                if let Err(e) = delivery.ack().await {
                    warn!(transaction_id, "Failed to ack message: {}", e);
                }
                IngestOutcome::Acknowledged { transaction_id }
            }
            Err(e) => match e.kind() {
                ErrorKind::Permanent | ErrorKind::NotFound => {
                    error!(provider_id = event.id, "Rejecting transaction: {}", e);
                    self.reject(delivery, e.to_string()).await
                }
                ErrorKind::Transient | ErrorKind::Cancelled => {
                    error!(
                        provider_id = event.id,
                        key = ?idempotency_key,
                        "Failed to append transaction, leaving unacked: {}", e
                    );
                    IngestOutcome::Failed {
                        error: e.to_string(),
                    }
                }
            },
        }
    }

    async fn reject<D: Delivery + ?Sized>(&self, delivery: &D, reason: String) -> IngestOutcome {
        if let Err(e) = delivery.reject().await {
            warn!("Failed to reject message: {}", e);
        }
        IngestOutcome::Rejected { reason }
    }
}
