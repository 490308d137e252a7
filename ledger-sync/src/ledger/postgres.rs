use super::LedgerStore;
use crate::config::DatabaseConfig;
use crate::error::{Result, SyncError};
use crate::models::{LedgerTransaction, Provider, ProviderTotals};
use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::time::Duration;
use tracing::{debug, info};

const FOREIGN_KEY_VIOLATION: &str = "23503";

pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        info!("Connecting to database...");

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(&config.url)
            .await?;

        sqlx::query("SELECT 1").fetch_one(&pool).await?;

        info!("Database connection verified");

        Ok(Self { pool })
    }

    /// Create the ledger tables if they do not exist yet
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS providers (
                id BIGSERIAL PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                initial_value NUMERIC(18, 2) NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transactions (
                id BIGSERIAL PRIMARY KEY,
                provider_id BIGINT NOT NULL REFERENCES providers (id),
                value NUMERIC(18, 2) NOT NULL,
                idempotency_key TEXT UNIQUE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Ledger schema ready");
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn create_provider(&self, name: &str, initial_value: Decimal) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO providers (name, initial_value)
            VALUES ($1, $2)
            RETURNING id
            "#,
        )
        .bind(name)
        .bind(initial_value)
        .fetch_one(&self.pool)
        .await?;

        info!(provider_id = id, name, %initial_value, "Provider created");
        Ok(id)
    }

    async fn append_transaction(
        &self,
        provider_id: i64,
        value: Decimal,
        idempotency_key: Option<&str>,
    ) -> Result<i64> {
        let inserted: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO transactions (provider_id, value, idempotency_key)
            VALUES ($1, $2, $3)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(provider_id)
        .bind(value)
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            let unknown_provider = matches!(
                &e,
                sqlx::Error::Database(db) if db.code().as_deref() == Some(FOREIGN_KEY_VIOLATION)
            );
            if unknown_provider {
                SyncError::ProviderNotFound(provider_id)
            } else {
                SyncError::Database(e)
            }
        })?;

        if let Some(id) = inserted {
            debug!(transaction_id = id, provider_id, %value, "Transaction appended");
            return Ok(id);
        }

        // Conflict on the idempotency key: the event was stored by an earlier delivery
        let existing = sqlx::query(
            r#"
            SELECT id, provider_id, value FROM transactions WHERE idempotency_key = $1
            "#,
        )
        .bind(idempotency_key)
        .fetch_one(&self.pool)
        .await?;

        let existing_id: i64 = existing.try_get("id")?;
        let existing_provider: i64 = existing.try_get("provider_id")?;
        let existing_value: Decimal = existing.try_get("value")?;

        if existing_provider != provider_id || existing_value != value {
            return Err(SyncError::IdempotencyConflict {
                key: idempotency_key.unwrap_or_default().to_string(),
                existing_id,
            });
        }

        info!(
            transaction_id = existing_id,
            provider_id,
            idempotency_key,
            "Duplicate delivery, transaction already stored"
        );
        Ok(existing_id)
    }

    async fn list_providers(&self) -> Result<Vec<Provider>> {
        let providers = sqlx::query_as::<_, Provider>(
            r#"
            SELECT id, name, initial_value FROM providers ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(providers)
    }

    async fn list_transactions_since(&self, cursor_id: i64) -> Result<Vec<LedgerTransaction>> {
        let transactions = sqlx::query_as::<_, LedgerTransaction>(
            r#"
            SELECT id, provider_id, value
            FROM transactions
            WHERE id > $1
            ORDER BY id
            "#,
        )
        .bind(cursor_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(transactions)
    }

    async fn transaction_totals_by_provider(&self) -> Result<ProviderTotals> {
        let rows = sqlx::query(
            r#"
            SELECT provider_id, SUM(value) AS total, MAX(id) AS last_id
            FROM transactions
            GROUP BY provider_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut totals = ProviderTotals::default();
        for row in rows {
            let provider_id: i64 = row.try_get("provider_id")?;
            let total: Decimal = row.try_get("total")?;
            let last_id: i64 = row.try_get("last_id")?;

            totals.totals.insert(provider_id, total);
            totals.last_transaction_id = totals.last_transaction_id.max(last_id);
        }

        Ok(totals)
    }
}
