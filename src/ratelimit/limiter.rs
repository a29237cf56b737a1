//! Per-descriptor rate limiter facade.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::clock::Clock;
use super::config::RateLimiterConfig;
use super::dynamic::{DynamicConfiguration, DynamicConfigurationManager};
use super::error::{RateLimitError, StoreError};
use super::store::{BucketKey, BucketMode, BucketOutcome, BucketRequest, BucketStore};

/// Resolve the config to enforce for a descriptor.
///
/// A dynamic-eligible descriptor takes the snapshot's override when one is
/// present. Everything else enforces `base`, which is the static override
/// or the descriptor default fixed at startup.
pub fn effective_config(
    id: &str,
    dynamic: bool,
    base: &RateLimiterConfig,
    snapshot: &DynamicConfiguration,
) -> RateLimiterConfig {
    if dynamic {
        if let Some(config) = snapshot.limit(id) {
            return *config;
        }
    }
    *base
}

/// Enforces one descriptor's quota against the shared bucket store.
///
/// Holds no caller state; every call goes to the store.
pub struct RateLimiter {
    id: &'static str,
    dynamic: bool,
    base_config: RateLimiterConfig,
    dynamic_configuration: DynamicConfigurationManager,
    store: Arc<dyn BucketStore>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("id", &self.id)
            .field("dynamic", &self.dynamic)
            .field("base_config", &self.base_config)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RateLimiter {
    pub(crate) fn new(
        id: &'static str,
        dynamic: bool,
        base_config: RateLimiterConfig,
        dynamic_configuration: DynamicConfigurationManager,
        store: Arc<dyn BucketStore>,
        clock: Arc<dyn Clock>,
        timeout: Duration,
    ) -> Self {
        Self {
            id,
            dynamic,
            base_config,
            dynamic_configuration,
            store,
            clock,
            timeout,
        }
    }

    /// The descriptor id this limiter enforces.
    pub fn id(&self) -> &'static str {
        self.id
    }

    /// The config currently in force.
    pub fn config(&self) -> RateLimiterConfig {
        self.dynamic_configuration
            .with_current(|snapshot| effective_config(self.id, self.dynamic, &self.base_config, snapshot))
    }

    /// Consume a single permit.
    pub async fn validate(&self, key: &str) -> Result<(), RateLimitError> {
        self.validate_permits(key, 1.0).await
    }

    /// Consume `permits` permits, failing with [`RateLimitError::Exceeded`]
    /// when the bucket cannot cover them.
    pub async fn validate_permits(&self, key: &str, permits: f64) -> Result<(), RateLimitError> {
        let outcome = self.evaluate(key, permits, BucketMode::Consume).await?;
        if outcome.allowed {
            return Ok(());
        }

        debug!(
            descriptor = self.id,
            key = %key,
            permits = permits,
            retry_after = ?outcome.retry_after,
            "Rate limit exceeded"
        );
        Err(RateLimitError::Exceeded {
            retry_after: outcome.retry_after,
        })
    }

    /// Whether `permits` permits are available right now, without taking them.
    pub async fn has_available_permits(&self, key: &str, permits: f64) -> Result<bool, RateLimitError> {
        let outcome = self.evaluate(key, permits, BucketMode::Peek).await?;
        Ok(outcome.allowed)
    }

    /// Reset a caller's bucket to full.
    pub async fn clear(&self, key: &str) -> Result<(), RateLimitError> {
        let bucket = BucketKey::new(self.id, key);
        debug!(descriptor = self.id, key = %key, "Clearing rate limit bucket");

        self.with_timeout(self.store.clear(&bucket)).await
    }

    async fn evaluate(
        &self,
        key: &str,
        permits: f64,
        mode: BucketMode,
    ) -> Result<BucketOutcome, RateLimitError> {
        if !permits.is_finite() || permits <= 0.0 {
            return Err(RateLimitError::InvalidPermits(permits));
        }

        let bucket = BucketKey::new(self.id, key);
        let request = BucketRequest {
            config: self.config(),
            permits,
            now: self.clock.now(),
            mode,
        };

        trace!(
            key = %bucket,
            permits = permits,
            mode = ?mode,
            bucket_size = request.config.bucket_size(),
            interval = ?request.config.permit_regeneration_interval(),
            "Evaluating rate limit"
        );

        self.with_timeout(self.store.evaluate(&bucket, &request)).await
    }

    /// Bound a store call by the configured timeout.
    async fn with_timeout<T>(
        &self,
        call: impl std::future::Future<Output = Result<T, StoreError>>,
    ) -> Result<T, RateLimitError> {
        let result = match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        };

        result.map_err(|source| {
            warn!(
                descriptor = self.id,
                error = %source,
                "Rate limiter store unavailable"
            );
            RateLimitError::Unavailable {
                descriptor: self.id,
                source,
            }
        })
    }
}
