//! Redis-backed bucket store.
//!
//! Each evaluation is one Lua script invocation. Redis runs a script to
//! completion before serving any other command on that key's shard, which is
//! what makes read-replenish-compare-write atomic across service instances.

use async_trait::async_trait;
use redis::aio::{ConnectionLike, ConnectionManager};
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use redis::{AsyncCommands, Script};
use tracing::{info, trace};

use super::bucket::MAX_RETRY_AFTER_MICROS;
use super::{BucketKey, BucketMode, BucketOutcome, BucketRequest, BucketStore};
use crate::ratelimit::error::StoreError;

/// Leaky-bucket evaluation, mirroring `BucketState::evaluate`.
///
/// KEYS[1]  bucket key
/// ARGV[1]  bucket size
/// ARGV[2]  permit regeneration interval, µs
/// ARGV[3]  permits requested
/// ARGV[4]  now, µs since the epoch
/// ARGV[5]  "1" to debit, "0" to peek
/// ARGV[6]  expiry once written, ms
///
/// Returns {allowed, permits remaining, retry after in µs}. The retry-after is
/// clamped to 2^53 - 1 so it survives Redis' integer reply conversion. The
/// timestamp is stored as the caller's decimal string so it keeps full
/// precision.
const VALIDATE_SCRIPT: &str = r#"
local key = KEYS[1]
local bucket_size = tonumber(ARGV[1])
local interval = tonumber(ARGV[2])
local requested = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local consume = ARGV[5] == "1"

local stored = redis.call("HMGET", key, "s", "t")
local remaining = tonumber(stored[1])
local last_update = tonumber(stored[2])
local last_update_arg = stored[2]

if remaining == nil or last_update == nil then
  remaining = bucket_size
  last_update = now
  last_update_arg = ARGV[4]
end

local elapsed = math.max(0, now - last_update)
remaining = math.min(bucket_size, remaining + elapsed / interval)
if now > last_update then
  last_update_arg = ARGV[4]
end

if remaining >= requested then
  if consume then
    remaining = remaining - requested
    redis.call("HSET", key, "s", string.format("%.17g", remaining), "t", last_update_arg)
    redis.call("PEXPIRE", key, ARGV[6])
  end
  return {1, string.format("%.17g", remaining), 0}
end

local wait = math.min(math.ceil((requested - remaining) * interval), 9007199254740991)
return {0, string.format("%.17g", remaining), wait}
"#;

/// Bucket store backed by Redis or a Redis cluster.
///
/// Generic over the async connection so a single-node [`ConnectionManager`]
/// and a [`ClusterConnection`] share one implementation. Both reconnect on
/// their own; this store never retries a failed evaluation.
pub struct RedisBucketStore<C> {
    connection: C,
    script: Script,
}

impl<C> RedisBucketStore<C>
where
    C: ConnectionLike + Clone + Send + Sync + 'static,
{
    /// Wrap an established connection.
    pub fn new(connection: C) -> Self {
        Self {
            connection,
            script: Script::new(VALIDATE_SCRIPT),
        }
    }
}

impl RedisBucketStore<ConnectionManager> {
    /// Connect to a single Redis node.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        info!(url = %url, "Connecting to Redis bucket store");
        let client = redis::Client::open(url)?;
        let connection = client.get_connection_manager().await?;
        Ok(Self::new(connection))
    }
}

impl RedisBucketStore<ClusterConnection> {
    /// Connect to a Redis cluster through the given seed nodes.
    pub async fn connect_cluster(urls: &[String]) -> Result<Self, StoreError> {
        info!(seeds = ?urls, "Connecting to Redis cluster bucket store");
        let client = ClusterClient::new(urls.to_vec())?;
        let connection = client.get_async_connection().await?;
        Ok(Self::new(connection))
    }
}

/// Upper bound on `PEXPIRE`; Redis rejects expiries that overflow its clock.
const MAX_TTL_MILLIS: u64 = 1 << 53;

/// Parse the script reply into an outcome.
fn parse_reply(allowed: i64, remaining: &str, wait_micros: i64) -> Result<BucketOutcome, StoreError> {
    let permits_remaining: f64 = remaining.parse().map_err(|_| {
        StoreError::MalformedResponse(format!("permits remaining {:?} is not a number", remaining))
    })?;
    let retry_after = u64::try_from(wait_micros)
        .map_err(|_| StoreError::MalformedResponse(format!("negative retry-after {}", wait_micros)))?
        .min(MAX_RETRY_AFTER_MICROS);

    Ok(BucketOutcome {
        allowed: allowed == 1,
        permits_remaining,
        retry_after: std::time::Duration::from_micros(retry_after),
    })
}

#[async_trait]
impl<C> BucketStore for RedisBucketStore<C>
where
    C: ConnectionLike + Clone + Send + Sync + 'static,
{
    async fn evaluate(
        &self,
        key: &BucketKey,
        request: &BucketRequest,
    ) -> Result<BucketOutcome, StoreError> {
        let interval_micros =
            u64::try_from(request.config.permit_regeneration_interval().as_micros())
                .unwrap_or(u64::MAX);
        let ttl_millis = u64::try_from(request.config.refill_horizon().as_millis())
            .unwrap_or(u64::MAX)
            .clamp(1, MAX_TTL_MILLIS);
        let consume: u8 = match request.mode {
            BucketMode::Consume => 1,
            BucketMode::Peek => 0,
        };

        let mut connection = self.connection.clone();
        let (allowed, remaining, wait_micros): (i64, String, i64) = self
            .script
            .key(key.as_str())
            .arg(request.config.bucket_size())
            .arg(interval_micros)
            .arg(request.permits)
            .arg(request.now.timestamp_micros())
            .arg(consume)
            .arg(ttl_millis)
            .invoke_async(&mut connection)
            .await?;

        trace!(
            key = %key,
            allowed = allowed,
            permits_remaining = %remaining,
            "Evaluated Redis bucket"
        );

        parse_reply(allowed, &remaining, wait_micros)
    }

    async fn clear(&self, key: &BucketKey) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        connection.del::<_, ()>(key.as_str()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::config::RateLimiterConfig;
    use crate::ratelimit::store::BucketState;
    use chrono::{DateTime, TimeDelta, Utc};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_parse_reply() {
        let outcome = parse_reply(1, "4", 0).unwrap();
        assert!(outcome.allowed);
        assert_eq!(outcome.permits_remaining, 4.0);
        assert_eq!(outcome.retry_after, Duration::ZERO);

        let outcome = parse_reply(0, "0.25", 375_000).unwrap();
        assert!(!outcome.allowed);
        assert_eq!(outcome.permits_remaining, 0.25);
        assert_eq!(outcome.retry_after, Duration::from_millis(375));
    }

    #[test]
    fn test_parse_reply_saturates_retry_after() {
        let outcome = parse_reply(0, "3.5", 9_007_199_254_740_991).unwrap();
        assert!(!outcome.allowed);
        assert_eq!(outcome.retry_after, Duration::from_micros(MAX_RETRY_AFTER_MICROS));

        let outcome = parse_reply(0, "0", i64::MAX).unwrap();
        assert_eq!(outcome.retry_after, Duration::from_micros(MAX_RETRY_AFTER_MICROS));
    }

    #[test]
    fn test_script_clamps_retry_after() {
        assert!(VALIDATE_SCRIPT.contains(&MAX_RETRY_AFTER_MICROS.to_string()));
    }

    #[test]
    fn test_parse_reply_rejects_garbage() {
        assert!(matches!(
            parse_reply(1, "lots", 0),
            Err(StoreError::MalformedResponse(_))
        ));
        assert!(matches!(
            parse_reply(0, "1", -5),
            Err(StoreError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_script_reads_and_writes_single_key() {
        assert!(VALIDATE_SCRIPT.contains("KEYS[1]"));
        assert!(!VALIDATE_SCRIPT.contains("KEYS[2]"));
    }

    /// Redis-backed tests run only when a server is named.
    fn redis_url() -> Option<String> {
        std::env::var("TURNSTILE_TEST_REDIS_URL").ok()
    }

    fn consume(config: RateLimiterConfig, now: DateTime<Utc>) -> BucketRequest {
        BucketRequest {
            config,
            permits: 1.0,
            now,
            mode: BucketMode::Consume,
        }
    }

    #[tokio::test]
    async fn test_redis_bucket_lifecycle() {
        let store = match redis_url() {
            Some(url) => RedisBucketStore::connect(&url).await.unwrap(),
            None => return,
        };
        let key = BucketKey::new("verify", "redis-lifecycle");
        let config = RateLimiterConfig::new(6, Duration::from_millis(500));
        let start = Utc::now();

        store.clear(&key).await.unwrap();
        for _ in 0..6 {
            assert!(store.evaluate(&key, &consume(config, start)).await.unwrap().allowed);
        }

        let denied = store.evaluate(&key, &consume(config, start)).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Duration::from_millis(500));

        let later = start + TimeDelta::milliseconds(500);
        assert!(store.evaluate(&key, &consume(config, later)).await.unwrap().allowed);
        assert!(!store.evaluate(&key, &consume(config, later)).await.unwrap().allowed);

        store.clear(&key).await.unwrap();
    }

    fn step(
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

    /// The script and `BucketState::evaluate` agree on every step of a
    /// sequence covering denial, peek, refill, fractional permits, clock skew
    /// and oversized requests.
    #[tokio::test]
    async fn test_redis_script_matches_bucket_math() {
        let store = match redis_url() {
            Some(url) => RedisBucketStore::connect(&url).await.unwrap(),
            None => return,
        };
        let key = BucketKey::new("inboundMessageBytes", "redis-parity");
        let t0 = Utc::now();
        let small = RateLimiterConfig::new(6, Duration::from_millis(500));
        let fractional = RateLimiterConfig::new(1024, Duration::from_micros(500));
        let pin = RateLimiterConfig::new(10, Duration::from_secs(24 * 60));

        let sequences = vec![
            vec![
                step(small, 1.0, t0, BucketMode::Consume),
                step(small, 5.0, t0, BucketMode::Consume),
                step(small, 1.0, t0, BucketMode::Consume),
                step(small, 1.0, t0, BucketMode::Peek),
                step(small, 1.0, t0 + TimeDelta::microseconds(250_000), BucketMode::Peek),
                step(small, 1.0, t0 + TimeDelta::milliseconds(500), BucketMode::Peek),
                step(small, 1.0, t0 + TimeDelta::milliseconds(500), BucketMode::Consume),
                step(small, 1.0, t0 + TimeDelta::milliseconds(500), BucketMode::Consume),
                step(small, 6.0, t0 + TimeDelta::hours(1), BucketMode::Consume),
                step(small, 7.0, t0 + TimeDelta::hours(2), BucketMode::Consume),
            ],
            vec![
                step(fractional, 1000.5, t0, BucketMode::Consume),
                step(fractional, 24.0, t0, BucketMode::Consume),
                step(fractional, 24.0, t0 + TimeDelta::microseconds(250), BucketMode::Consume),
                step(fractional, 0.25, t0 + TimeDelta::microseconds(251), BucketMode::Consume),
            ],
            vec![
                step(small, 6.0, t0 + TimeDelta::seconds(10), BucketMode::Consume),
                // A lagging instance sees no elapsed time.
                step(small, 1.0, t0, BucketMode::Consume),
                step(small, 1.0, t0 + TimeDelta::seconds(9), BucketMode::Peek),
                step(small, 1.0, t0 + TimeDelta::milliseconds(10_500), BucketMode::Consume),
                step(small, 1.0, t0 + TimeDelta::milliseconds(10_500), BucketMode::Consume),
            ],
            vec![
                step(pin, 1e10, t0, BucketMode::Consume),
                step(pin, 10.0, t0, BucketMode::Consume),
                step(pin, 1.0, t0, BucketMode::Consume),
            ],
        ];

        for sequence in sequences {
            store.clear(&key).await.unwrap();
            let mut local: Option<BucketState> = None;

            for (i, request) in sequence.iter().enumerate() {
                let (next, expected) = BucketState::evaluate(local, request);
                if let Some(next) = next {
                    local = Some(next);
                }

                let actual = store.evaluate(&key, request).await.unwrap();
                assert_eq!(actual.allowed, expected.allowed, "step {}: {:?}", i, request);
                assert!(
                    (actual.permits_remaining - expected.permits_remaining).abs() < 1e-9,
                    "step {}: remaining {} != {}",
                    i,
                    actual.permits_remaining,
                    expected.permits_remaining
                );
                assert_eq!(actual.retry_after, expected.retry_after, "step {}", i);
            }
        }

        store.clear(&key).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_redis_concurrent_consumers_never_over_admit() {
        let store = match redis_url() {
            Some(url) => Arc::new(RedisBucketStore::connect(&url).await.unwrap()),
            None => return,
        };
        let key = BucketKey::new("messages", "redis-concurrency");
        let config = RateLimiterConfig::new(10, Duration::from_secs(60));
        let now = Utc::now();

        store.clear(&key).await.unwrap();
        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let store = store.clone();
                let key = key.clone();
                tokio::spawn(async move {
                    store.evaluate(&key, &consume(config, now)).await.unwrap().allowed
                })
            })
            .collect();

        let admitted = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();
        assert_eq!(admitted, 10);

        store.clear(&key).await.unwrap();
    }
}
