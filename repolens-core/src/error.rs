//! Error types for repolens-core

use thiserror::Error;

/// Main error type for the repolens-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Caller-supplied input is missing or invalid
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Entity not found (project, queue item, analyses for a type, ...)
    #[error("{0} not found")]
    NotFound(String),

    /// Caller is not authenticated
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Caller is authenticated but does not own the resource
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Monthly token quota exhausted for the user's plan
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Per-endpoint invocation quota rejected the call
    #[error("rate limited: retry in {retry_after_secs}s")]
    RateLimited {
        /// Seconds until the rolling window admits another call
        retry_after_secs: u64,
        /// Window size for `X-RateLimit-Limit`
        limit: u32,
    },

    /// AI backend returned HTTP 429; retried internally with backoff
    #[error("provider rate limited: {0}")]
    ProviderRateLimited(String),

    /// AI backend reported insufficient billing credits; never retried
    #[error("provider payment required: {0}")]
    PaymentRequired(String),

    /// AI backend rejected the request as malformed; never retried
    #[error("malformed provider request: {0}")]
    MalformedRequest(String),

    /// Transient AI backend failure (5xx, transport error)
    #[error("provider error: {message}")]
    Provider {
        /// HTTP status if the backend responded at all
        status: Option<u16>,
        /// Backend-supplied or transport error detail
        message: String,
    },
}

impl Error {
    /// Whether the retry combinator may re-attempt the failed call.
    ///
    /// Rate-limit and transient backend failures retry; payment-required and
    /// malformed-request errors surface immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ProviderRateLimited(_) | Error::Provider { .. }
        )
    }
}

/// Result type alias for repolens-core
pub type Result<T> = std::result::Result<T, Error>;
