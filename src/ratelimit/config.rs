//! Quota parameters for a single rate limiter.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::error::ConfigurationError;

/// Bucket capacity and refill cadence for a rate limiter.
///
/// A bucket holds at most `bucket_size` permits and regains one permit every
/// `permit_regeneration_interval`. Values built with [`RateLimiterConfig::new`]
/// are not checked; startup runs [`RateLimiterConfig::validate`] over every
/// config it will enforce. Deserialized values are always valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawRateLimiterConfig")]
pub struct RateLimiterConfig {
    bucket_size: u64,
    #[serde(serialize_with = "humantime_serde::serialize")]
    permit_regeneration_interval: Duration,
}

impl RateLimiterConfig {
    /// Create a config. Usable in `const` descriptor tables.
    pub const fn new(bucket_size: u64, permit_regeneration_interval: Duration) -> Self {
        Self {
            bucket_size,
            permit_regeneration_interval,
        }
    }

    /// Create a config, rejecting non-positive values.
    pub fn try_new(
        bucket_size: u64,
        permit_regeneration_interval: Duration,
    ) -> Result<Self, ConfigurationError> {
        let config = Self::new(bucket_size, permit_regeneration_interval);
        config.validate()?;
        Ok(config)
    }

    /// Maximum permits the bucket holds.
    pub fn bucket_size(&self) -> u64 {
        self.bucket_size
    }

    /// Time to regenerate a single permit.
    pub fn permit_regeneration_interval(&self) -> Duration {
        self.permit_regeneration_interval
    }

    /// Time for an empty bucket to refill completely.
    ///
    /// Saturates at `u64::MAX` microseconds.
    pub fn refill_horizon(&self) -> Duration {
        let micros =
            u128::from(self.bucket_size).saturating_mul(self.permit_regeneration_interval.as_micros());
        Duration::from_micros(u64::try_from(micros).unwrap_or(u64::MAX))
    }

    /// Check that both fields are strictly positive.
    ///
    /// Buckets are evaluated with microsecond resolution, so an interval
    /// shorter than one microsecond counts as zero.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.bucket_size == 0 {
            return Err(ConfigurationError::InvalidConfig(
                "bucket_size must be greater than zero".to_string(),
            ));
        }
        if self.permit_regeneration_interval.as_micros() == 0 {
            return Err(ConfigurationError::InvalidConfig(format!(
                "permit_regeneration_interval must be at least 1µs, got {:?}",
                self.permit_regeneration_interval
            )));
        }
        Ok(())
    }
}

/// Unchecked wire form, validated on the way in.
#[derive(Deserialize)]
struct RawRateLimiterConfig {
    bucket_size: u64,
    #[serde(with = "humantime_serde")]
    permit_regeneration_interval: Duration,
}

impl TryFrom<RawRateLimiterConfig> for RateLimiterConfig {
    type Error = ConfigurationError;

    fn try_from(raw: RawRateLimiterConfig) -> Result<Self, Self::Error> {
        Self::try_new(raw.bucket_size, raw.permit_regeneration_interval)
    }
}
