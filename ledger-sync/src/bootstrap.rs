use crate::config::ProviderSeed;
use crate::error::Result;
use crate::ledger::LedgerStore;
use crate::models::Provider;
use crate::retry::RetryExecutor;
use std::sync::Arc;
use tracing::info;

/// Create every configured provider that does not exist yet, matched by
/// name, and return the full provider list.
pub async fn seed_providers(
    ledger: Arc<dyn LedgerStore>,
    seeds: &[ProviderSeed],
    retry: &RetryExecutor,
) -> Result<Vec<Provider>> {
    let existing = list_providers(&ledger, retry).await?;

    for seed in seeds {
        if existing.iter().any(|p| p.name == seed.name) {
            continue;
        }

        let id = retry
            .execute("create_provider", || {
                let ledger = Arc::clone(&ledger);
                async move { ledger.create_provider(&seed.name, seed.initial_value).await }
            })
            .await?;

        info!(
            provider_id = id,
            name = %seed.name,
            initial_value = %seed.initial_value,
            "Provider created"
        );
    }

    list_providers(&ledger, retry).await
}

async fn list_providers(
    ledger: &Arc<dyn LedgerStore>,
    retry: &RetryExecutor,
) -> Result<Vec<Provider>> {
    retry
        .execute("list_providers", || {
            let ledger = Arc::clone(ledger);
            async move { ledger.list_providers().await }
        })
        .await
}
