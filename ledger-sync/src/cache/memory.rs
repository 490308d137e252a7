use super::CacheStore;
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};

/// Cache kept in process memory, with injectable transient failures
#[derive(Debug, Default)]
pub struct InMemoryCacheStore {
    state: Mutex<CacheState>,
}

#[derive(Debug, Default)]
struct CacheState {
    values: HashMap<String, Decimal>,
    cursor: Option<i64>,
    cursor_writes: u32,
    commit_failures_remaining: u32,
    read_failures_remaining: u32,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` commits fail with a transient error
    pub fn fail_commits(&self, count: u32) {
        self.state.lock().commit_failures_remaining = count;
    }

    /// Make the next `count` reads fail with a transient error
    pub fn fail_reads(&self, count: u32) {
        self.state.lock().read_failures_remaining = count;
    }

    /// Number of times the cursor key has been written
    pub fn cursor_writes(&self) -> u32 {
        self.state.lock().cursor_writes
    }

    pub fn snapshot(&self) -> HashMap<String, Decimal> {
        self.state.lock().values.clone()
    }
}

impl CacheState {
    fn take_read_failure(&mut self) -> Result<()> {
        if self.read_failures_remaining > 0 {
            self.read_failures_remaining -= 1;
            return Err(SyncError::Unavailable("injected cache read failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Decimal>> {
        let mut state = self.state.lock();
        state.take_read_failure()?;
        Ok(state.values.get(key).copied())
    }

    async fn set(&self, key: &str, value: Decimal) -> Result<()> {
        self.state.lock().values.insert(key.to_string(), value);
        Ok(())
    }

    async fn last_processed_id(&self) -> Result<i64> {
        let mut state = self.state.lock();
        state.take_read_failure()?;
        Ok(state.cursor.unwrap_or(0))
    }

    async fn commit(&self, balances: &BTreeMap<String, Decimal>, cursor: i64) -> Result<()> {
        let mut state = self.state.lock();

        if state.commit_failures_remaining > 0 {
            state.commit_failures_remaining -= 1;
            return Err(SyncError::Unavailable("injected cache commit failure".to_string()));
        }

        for (key, value) in balances {
            state.values.insert(key.clone(), *value);
        }
        state.cursor = Some(cursor);
        state.cursor_writes += 1;
        Ok(())
    }
}
