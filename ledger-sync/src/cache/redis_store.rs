use super::CacheStore;
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::{debug, info};

/// Balance cache backed by Redis (or any RESP-compatible store such as KeyDB)
#[derive(Clone)]
pub struct RedisCacheStore {
    redis: ConnectionManager,
    cursor_key: String,
}

impl RedisCacheStore {
    pub async fn connect(url: &str, cursor_key: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let redis = ConnectionManager::new(client).await?;

        info!("Connected to Redis at {}", url);
        Ok(Self::new(redis, cursor_key))
    }

    pub fn new(redis: ConnectionManager, cursor_key: &str) -> Self {
        Self {
            redis,
            cursor_key: cursor_key.to_string(),
        }
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Decimal>> {
        let raw: Option<String> = self.redis.clone().get(key).await?;

        raw.map(|value| {
            Decimal::from_str(&value).map_err(|_| SyncError::CorruptCacheValue {
                key: key.to_string(),
                value,
            })
        })
        .transpose()
    }

    async fn set(&self, key: &str, value: Decimal) -> Result<()> {
        let _: () = self.redis.clone().set(key, value.to_string()).await?;
        debug!(key, %value, "Cache value set");
        Ok(())
    }

    async fn last_processed_id(&self) -> Result<i64> {
        let raw: Option<String> = self.redis.clone().get(&self.cursor_key).await?;

        match raw {
            None => Ok(0),
            Some(value) => value
                .parse::<i64>()
                .map_err(|_| SyncError::CorruptCacheValue {
                    key: self.cursor_key.clone(),
                    value,
                }),
        }
    }

    async fn commit(&self, balances: &BTreeMap<String, Decimal>, cursor: i64) -> Result<()> {
        let mut pipe = redis::pipe();
        pipe.atomic();

        for (key, value) in balances {
            pipe.set(key, value.to_string()).ignore();
        }
        pipe.set(&self.cursor_key, cursor).ignore();

        let _: () = pipe.query_async(&mut self.redis.clone()).await?;

        debug!(keys = balances.len(), cursor, "Committed balances and cursor");
        Ok(())
    }
}
