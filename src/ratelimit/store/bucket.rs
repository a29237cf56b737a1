//! Leaky-bucket arithmetic.
//!
//! The in-memory store runs this directly; the Redis script performs the same
//! steps server-side. Time is measured in microseconds since the Unix epoch.

use std::time::Duration;

use super::{BucketMode, BucketOutcome, BucketRequest};

/// Largest retry-after reported, in µs: the largest integer a double holds
/// exactly. The Redis script clamps to the same value.
pub(crate) const MAX_RETRY_AFTER_MICROS: u64 = (1 << 53) - 1;

/// Persisted state of one bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    pub permits_remaining: f64,
    pub last_update_micros: i64,
}

impl BucketState {
    /// Evaluate a request against the current state.
    ///
    /// Returns the state to persist, if any, along with the outcome. A missing
    /// state is a full bucket. Denied requests and peeks persist nothing, and
    /// `last_update_micros` never moves backwards.
    pub fn evaluate(
        state: Option<BucketState>,
        request: &BucketRequest,
    ) -> (Option<BucketState>, BucketOutcome) {
        let bucket_size = request.config.bucket_size() as f64;
        let interval = request.config.permit_regeneration_interval().as_micros() as f64;
        let now = request.now.timestamp_micros();

        let BucketState {
            permits_remaining,
            last_update_micros,
        } = state.unwrap_or(BucketState {
            permits_remaining: bucket_size,
            last_update_micros: now,
        });

        let elapsed = now.saturating_sub(last_update_micros).max(0) as f64;
        let available = bucket_size.min(permits_remaining + elapsed / interval);
        let last_update_micros = last_update_micros.max(now);

        if available >= request.permits {
            return match request.mode {
                BucketMode::Consume => {
                    let remaining = available - request.permits;
                    (
                        Some(BucketState {
                            permits_remaining: remaining,
                            last_update_micros,
                        }),
                        BucketOutcome {
                            allowed: true,
                            permits_remaining: remaining,
                            retry_after: Duration::ZERO,
                        },
                    )
                }
                BucketMode::Peek => (
                    None,
                    BucketOutcome {
                        allowed: true,
                        permits_remaining: available,
                        retry_after: Duration::ZERO,
                    },
                ),
            };
        }

        let wait_micros = ((request.permits - available) * interval)
            .ceil()
            .min(MAX_RETRY_AFTER_MICROS as f64);
        (
            None,
            BucketOutcome {
                allowed: false,
                permits_remaining: available,
                retry_after: Duration::from_micros(wait_micros as u64),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::config::RateLimiterConfig;
    use chrono::{DateTime, TimeDelta, Utc};

    fn start() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn request(
        config: RateLimiterConfig,
        permits: f64,
        now: DateTime<Utc>,
        mode: BucketMode,
    ) -> BucketRequest {
        BucketRequest {
            config,
            permits,
            now,
            mode,
        }
    }

    /// Apply a request, keeping state the way a store would.
    fn apply(state: &mut Option<BucketState>, req: &BucketRequest) -> BucketOutcome {
        let (next, outcome) = BucketState::evaluate(*state, req);
        if let Some(next) = next {
            *state = Some(next);
        }
        outcome
    }

    #[test]
    fn test_fresh_bucket_admits_capacity_then_denies() {
        let config = RateLimiterConfig::new(6, Duration::from_millis(500));
        let mut state = None;

        for i in 0..6 {
            let outcome = apply(&mut state, &request(config, 1.0, start(), BucketMode::Consume));
            assert!(outcome.allowed, "request {} should be admitted", i + 1);
        }

        let outcome = apply(&mut state, &request(config, 1.0, start(), BucketMode::Consume));
        assert!(!outcome.allowed);
        assert_eq!(outcome.retry_after, Duration::from_millis(500));
    }

    #[test]
    fn test_replenishes_one_permit_per_interval() {
        let config = RateLimiterConfig::new(10, Duration::from_secs(1));
        let mut state = None;

        apply(&mut state, &request(config, 10.0, start(), BucketMode::Consume));
        assert!(!apply(&mut state, &request(config, 1.0, start(), BucketMode::Consume)).allowed);

        let later = start() + TimeDelta::seconds(3);
        for _ in 0..3 {
            assert!(apply(&mut state, &request(config, 1.0, later, BucketMode::Consume)).allowed);
        }
        assert!(!apply(&mut state, &request(config, 1.0, later, BucketMode::Consume)).allowed);
    }

    #[test]
    fn test_replenish_caps_at_bucket_size() {
        let config = RateLimiterConfig::new(3, Duration::from_secs(1));
        let mut state = None;

        apply(&mut state, &request(config, 3.0, start(), BucketMode::Consume));

        let much_later = start() + TimeDelta::hours(1);
        let outcome = apply(&mut state, &request(config, 1.0, much_later, BucketMode::Peek));
        assert!(outcome.allowed);
        assert_eq!(outcome.permits_remaining, 3.0);
    }

    #[test]
    fn test_denied_request_persists_nothing() {
        let config = RateLimiterConfig::new(2, Duration::from_secs(1));
        let state = Some(BucketState {
            permits_remaining: 0.5,
            last_update_micros: start().timestamp_micros(),
        });

        let (next, outcome) =
            BucketState::evaluate(state, &request(config, 1.0, start(), BucketMode::Consume));
        assert!(next.is_none());
        assert!(!outcome.allowed);
        assert_eq!(outcome.retry_after, Duration::from_millis(500));
    }

    #[test]
    fn test_peek_does_not_debit() {
        let config = RateLimiterConfig::new(1, Duration::from_secs(1));
        let mut state = None;

        assert!(apply(&mut state, &request(config, 1.0, start(), BucketMode::Peek)).allowed);
        assert!(state.is_none());
        assert!(apply(&mut state, &request(config, 1.0, start(), BucketMode::Consume)).allowed);
        assert!(!apply(&mut state, &request(config, 1.0, start(), BucketMode::Peek)).allowed);
    }

    #[test]
    fn test_fractional_permits() {
        let config = RateLimiterConfig::new(1024, Duration::from_micros(500));
        let mut state = None;

        let outcome = apply(&mut state, &request(config, 1000.5, start(), BucketMode::Consume));
        assert!(outcome.allowed);
        assert_eq!(outcome.permits_remaining, 23.5);

        let outcome = apply(&mut state, &request(config, 24.0, start(), BucketMode::Consume));
        assert!(!outcome.allowed);
        // half a permit short at 500µs per permit
        assert_eq!(outcome.retry_after, Duration::from_micros(250));
    }

    #[test]
    fn test_clock_skew_does_not_mint_permits() {
        let config = RateLimiterConfig::new(5, Duration::from_secs(1));
        let ahead = start() + TimeDelta::seconds(10);
        let mut state = Some(BucketState {
            permits_remaining: 0.0,
            last_update_micros: ahead.timestamp_micros(),
        });

        // An instance whose clock lags sees no elapsed time.
        assert!(!apply(&mut state, &request(config, 1.0, start(), BucketMode::Consume)).allowed);

        // Once the lagging clock passes the stored timestamp, refill resumes from it.
        let caught_up = ahead + TimeDelta::seconds(1);
        assert!(apply(&mut state, &request(config, 1.0, caught_up, BucketMode::Consume)).allowed);
        assert_eq!(state.unwrap().last_update_micros, caught_up.timestamp_micros());
    }

    #[test]
    fn test_retry_after_is_clamped() {
        let config = RateLimiterConfig::new(10, Duration::from_secs(24 * 60));
        let mut state = None;

        let outcome = apply(&mut state, &request(config, 1e10, start(), BucketMode::Consume));
        assert!(!outcome.allowed);
        assert_eq!(
            outcome.retry_after,
            Duration::from_micros(MAX_RETRY_AFTER_MICROS)
        );
    }

    #[test]
    fn test_request_larger_than_bucket_is_denied() {
        let config = RateLimiterConfig::new(5, Duration::from_secs(1));
        let mut state = None;

        let outcome = apply(&mut state, &request(config, 6.0, start(), BucketMode::Consume));
        assert!(!outcome.allowed);
        assert_eq!(outcome.retry_after, Duration::from_secs(1));
        assert!(state.is_none());
    }
}
