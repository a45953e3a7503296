use thiserror::Error;

/// Engine-wide error taxonomy.
///
/// Per-tick failures are isolated to the position or entry attempt that
/// produced them: `DataUnavailable` means "no action this tick", order
/// failures are surfaced as failed transitions and retried on the next
/// scheduled tick, and only `InvalidConfiguration` is fatal (at startup).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("insufficient market data: need {needed} candles, have {have}")]
    DataUnavailable { needed: usize, have: usize },

    #[error("order rejected: {0}")]
    OrderRejected(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Venue rate limit (HTTP 429 or API throttle code). retry_after in seconds.
    #[error("rate limited by venue (retry after {retry_after}s)")]
    RateLimited { retry_after: u64 },

    /// Network failures, HTTP 5xx, venue overload. Safe to retry.
    #[error("transient venue error: {0}")]
    Transient(String),

    /// Invalid parameters, insufficient balance, HTTP 4xx. Retrying cannot help.
    #[error("permanent venue error: {0}")]
    Permanent(String),
}

impl EngineError {
    /// Whether the execution layer may retry the operation that produced this.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Transient(_) | EngineError::RateLimited { .. }
        )
    }
}
