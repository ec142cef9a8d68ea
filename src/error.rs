//! # Structured Error Handling
//!
//! Error taxonomy for the resilience core. Only three variants are ever
//! surfaced to query callers: [`DbAccessError::PoolExhausted`],
//! [`DbAccessError::CircuitOpen`], and [`DbAccessError::RateLimited`].
//! Everything else is recovered internally (replica fallback, cache
//! fail-open, limiter fail-open) and shows up only in logs.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum DbAccessError {
    /// No connection became available within the acquire timeout while the
    /// pool was at its maximum size. Surfaced to the caller, never retried
    /// internally.
    #[error("connection pool exhausted for {role} after {waited_ms}ms")]
    PoolExhausted { role: String, waited_ms: u64 },

    /// The circuit breaker for the target role is open and the call was
    /// rejected without touching the database.
    #[error("circuit breaker is open for {role}")]
    CircuitOpen { role: String },

    /// The sliding-window limit for the scope was exceeded.
    #[error("rate limit exceeded for scope {scope}, retry in {retry_after:?}")]
    RateLimited { scope: String, retry_after: Duration },

    /// No replica is currently selectable. Recovered by the workload
    /// isolator via fallback to the primary; never reaches callers.
    #[error("no healthy replica available")]
    NoHealthyReplica,

    /// The distributed cache tier could not be reached. Always handled
    /// fail-open by the cache manager.
    #[error("cache tier unavailable: {0}")]
    CacheUnavailable(String),

    /// The distributed store backing the rate limiter or cache is down.
    /// Handled fail-open.
    #[error("distributed store unavailable: {0}")]
    StoreUnavailable(String),

    /// A database operation failed at the connection level.
    #[error("database error: {0}")]
    Database(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl DbAccessError {
    /// Whether this error is part of the caller-visible contract, as opposed
    /// to an internal signal that must be absorbed by a fallback policy.
    pub fn is_caller_visible(&self) -> bool {
        matches!(
            self,
            DbAccessError::PoolExhausted { .. }
                | DbAccessError::CircuitOpen { .. }
                | DbAccessError::RateLimited { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, DbAccessError>;
