//! In-process bucket store.
//!
//! Buckets live in a [`DashMap`]; holding the map entry for a key serializes
//! every evaluation of that bucket. State is not shared across processes, so
//! this store suits tests and single-instance deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::trace;

use super::{BucketKey, BucketOutcome, BucketRequest, BucketState, BucketStore};
use crate::ratelimit::error::StoreError;

#[derive(Debug, Clone, Copy)]
struct StoredBucket {
    state: BucketState,
    /// After this instant the bucket is full again and may be dropped.
    expires_at_micros: i64,
}

/// Bucket store backed by a concurrent in-memory map.
#[derive(Debug, Default)]
pub struct InMemoryBucketStore {
    buckets: DashMap<String, StoredBucket>,
}

impl InMemoryBucketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buckets currently held.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Current state of a bucket, if one is stored.
    pub fn state(&self, key: &BucketKey) -> Option<BucketState> {
        self.buckets.get(key.as_str()).map(|b| b.state)
    }

    /// Drop buckets that have fully refilled by `now`.
    pub fn purge_expired(&self, now: DateTime<Utc>) {
        let now = now.timestamp_micros();
        self.buckets.retain(|_, bucket| bucket.expires_at_micros > now);
    }
}

#[async_trait]
impl BucketStore for InMemoryBucketStore {
    async fn evaluate(
        &self,
        key: &BucketKey,
        request: &BucketRequest,
    ) -> Result<BucketOutcome, StoreError> {
        let now = request.now.timestamp_micros();
        let horizon = i64::try_from(request.config.refill_horizon().as_micros()).unwrap_or(i64::MAX);

        let outcome = match self.buckets.entry(key.as_str().to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                let state = (current.expires_at_micros > now).then_some(current.state);
                let (next, outcome) = BucketState::evaluate(state, request);
                if let Some(state) = next {
                    occupied.insert(StoredBucket {
                        state,
                        expires_at_micros: state.last_update_micros.saturating_add(horizon),
                    });
                }
                outcome
            }
            Entry::Vacant(vacant) => {
                let (next, outcome) = BucketState::evaluate(None, request);
                if let Some(state) = next {
                    vacant.insert(StoredBucket {
                        state,
                        expires_at_micros: state.last_update_micros.saturating_add(horizon),
                    });
                }
                outcome
            }
        };

        trace!(
            key = %key,
            allowed = outcome.allowed,
            permits_remaining = outcome.permits_remaining,
            "Evaluated in-memory bucket"
        );

        Ok(outcome)
    }

    async fn clear(&self, key: &BucketKey) -> Result<(), StoreError> {
        self.buckets.remove(key.as_str());
        Ok(())
    }
}
