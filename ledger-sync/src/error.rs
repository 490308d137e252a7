//! Error types for the ledger sync pipeline

use thiserror::Error;

/// Result type for ledger sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Retry eligibility of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connection drops, timeouts and similar; worth another attempt
    Transient,
    /// Malformed input or a broken invariant; retrying cannot help
    Permanent,
    /// A referenced entity does not exist
    NotFound,
    /// Shutdown was requested while the operation was in flight
    Cancelled,
}

impl ErrorKind {
    /// Whether the retry executor may attempt the operation again
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient)
    }
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("NATS error: {0}")]
    Nats(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Decimal parse error: {0}")]
    DecimalParse(#[from] rust_decimal::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Provider not found: {0}")]
    ProviderNotFound(i64),

    #[error("Corrupt cache value for key {key}: {value}")]
    CorruptCacheValue { key: String, value: String },

    #[error("Cache cursor {cache_cursor} is ahead of ledger head {ledger_head}")]
    CursorAhead { cache_cursor: i64, ledger_head: i64 },

    #[error("Idempotency key {key} already stores a different transaction ({existing_id})")]
    IdempotencyConflict { key: String, existing_id: i64 },

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Classify the failure for the retry executor
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Database(e) => classify_sqlx(e),
            SyncError::Redis(e) => classify_redis(e),
            SyncError::Nats(_) => ErrorKind::Transient,
            SyncError::Unavailable(_) => ErrorKind::Transient,
            SyncError::ProviderNotFound(_) => ErrorKind::NotFound,
            SyncError::Cancelled(_) => ErrorKind::Cancelled,
            SyncError::Serialization(_)
            | SyncError::DecimalParse(_)
            | SyncError::Validation(_)
            | SyncError::CorruptCacheValue { .. }
            | SyncError::CursorAhead { .. }
            | SyncError::IdempotencyConflict { .. }
            | SyncError::Config(_)
            | SyncError::Internal(_) => ErrorKind::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

fn classify_sqlx(err: &sqlx::Error) -> ErrorKind {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => ErrorKind::Transient,
        sqlx::Error::RowNotFound => ErrorKind::NotFound,
        sqlx::Error::Database(db) => match db.code().as_deref() {
            // foreign_key_violation
            Some("23503") => ErrorKind::NotFound,
            // serialization_failure, deadlock_detected, admin_shutdown, cannot_connect_now
            Some("40001") | Some("40P01") | Some("57P01") | Some("57P03") => {
                ErrorKind::Transient
            }
            _ => ErrorKind::Permanent,
        },
        _ => ErrorKind::Permanent,
    }
}

fn classify_redis(err: &redis::RedisError) -> ErrorKind {
    if err.is_io_error()
        || err.is_timeout()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
    {
        return ErrorKind::Transient;
    }

    match err.kind() {
        redis::ErrorKind::BusyLoadingError | redis::ErrorKind::TryAgain => ErrorKind::Transient,
        _ => ErrorKind::Permanent,
    }
}

impl From<async_nats::Error> for SyncError {
    fn from(err: async_nats::Error) -> Self {
        SyncError::Nats(err.to_string())
    }
}

impl From<async_nats::jetstream::context::PublishError> for SyncError {
    fn from(err: async_nats::jetstream::context::PublishError) -> Self {
        SyncError::Nats(err.to_string())
    }
}
