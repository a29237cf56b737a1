//! Bucket storage shared by every service instance.
//!
//! A store evaluates one leaky bucket per [`BucketKey`]. The whole
//! read-replenish-compare-write step runs atomically inside the store, so
//! concurrent callers on different processes cannot both take the last permit.

mod bucket;
mod key;
mod memory;
mod redis_store;

pub use bucket::BucketState;
pub use key::BucketKey;
pub use memory::InMemoryBucketStore;
pub use redis_store::RedisBucketStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use super::config::RateLimiterConfig;
use super::error::StoreError;

/// Whether an evaluation debits the bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketMode {
    /// Take the permits when they are available
    Consume,
    /// Only report whether the permits are available
    Peek,
}

/// Parameters for a single bucket evaluation.
#[derive(Debug, Clone, Copy)]
pub struct BucketRequest {
    pub config: RateLimiterConfig,
    pub permits: f64,
    pub now: DateTime<Utc>,
    pub mode: BucketMode,
}

/// Result of a bucket evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketOutcome {
    /// Whether the requested permits were (or would be) granted
    pub allowed: bool,
    /// Permits left after the evaluation
    pub permits_remaining: f64,
    /// Time until the requested permits are available; zero when allowed
    pub retry_after: Duration,
}

/// Storage backend for leaky buckets.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Replenish, compare and optionally debit a bucket as one atomic step.
    async fn evaluate(
        &self,
        key: &BucketKey,
        request: &BucketRequest,
    ) -> Result<BucketOutcome, StoreError>;

    /// Drop a bucket so its next use starts full.
    async fn clear(&self, key: &BucketKey) -> Result<(), StoreError>;
}
