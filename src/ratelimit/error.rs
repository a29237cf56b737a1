//! Error types for rate limiter construction and enforcement.

use std::time::Duration;
use thiserror::Error;

/// Invalid descriptor registry or quota configuration.
///
/// Raised while building the registry at startup. Never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    /// A config carries a non-positive bucket size or interval
    #[error("invalid rate limiter config: {0}")]
    InvalidConfig(String),

    /// A descriptor's config failed validation
    #[error("invalid config for rate limiter {id}: {reason}")]
    InvalidDescriptorConfig { id: String, reason: String },

    /// Two descriptors share an id
    #[error("duplicate rate limiter id: {0}")]
    DuplicateId(String),

    /// A descriptor id cannot be embedded in a bucket key
    #[error("malformed rate limiter id {0:?}: ids must be non-empty with no ':' or whitespace")]
    MalformedId(String),

    /// A static override names no known descriptor
    #[error("static config given for unknown rate limiter id: {0}")]
    UnknownDescriptor(String),

    /// A configuration document could not be parsed
    #[error("failed to parse rate limiter configuration: {0}")]
    Parse(String),
}

/// Failure talking to the bucket store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store returned an error or could not be reached
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The store did not answer in time
    #[error("bucket store timed out after {0:?}")]
    Timeout(Duration),

    /// The store answered with something other than a bucket outcome
    #[error("malformed bucket store response: {0}")]
    MalformedResponse(String),
}

/// Outcome of a rejected or failed admission check.
#[derive(Error, Debug)]
pub enum RateLimitError {
    /// Not enough permits; the caller may retry after the given delay
    #[error("rate limit exceeded, retry after {retry_after:?}")]
    Exceeded { retry_after: Duration },

    /// The bucket store could not decide; callers choose to fail open or closed
    #[error("rate limiter {descriptor} unavailable: {source}")]
    Unavailable {
        descriptor: &'static str,
        #[source]
        source: StoreError,
    },

    /// Permit counts must be finite and positive
    #[error("invalid permit count: {0}")]
    InvalidPermits(f64),
}

impl RateLimitError {
    /// Retry-after hint when the request was denied.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RateLimitError::Exceeded { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// Whether the store, rather than the quota, caused the failure.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, RateLimitError::Unavailable { .. })
    }
}
