//! Per-workload token-bucket rate limiting, grounded on the teacher's
//! `governor`-based `RateLimitedAPIServerClient` (apiserver/src/client/ratelimited.rs)
//! but keyed per workload UID rather than wrapping a single outbound client, since
//! each workload's bucket refills at a rate derived from its own expected scale.
//!
//! Buckets are held in a `moka` TTL cache rather than a hand-rolled eviction
//! callback: the cache's own `time_to_idle` expiry is the "TTL cache whose
//! eviction callback removes the matching limiter entry" this subsystem needs,
//! without reimplementing what the crate already provides.
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use moka::sync::Cache;
use nonzero_ext::nonzero;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{event, Level};

type WorkloadBucket = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// One workload's rate-limiter state: the `governor` bucket that actually
/// enforces consumption, plus the instant of its last successful reservation,
/// tracked so `peek` can report availability without drawing a token itself.
struct Bucket {
    limiter: WorkloadBucket,
    interval: Duration,
    last_reserved: Mutex<Option<Instant>>,
}

/// Per-workload token buckets. A workload's quota is `max_migrating_replicas`
/// tokens per configured window; buckets idle out of the cache after `1.5 x`
/// that window, matching the documented limiter-lifetime invariant.
pub struct ObjectLimiters {
    window: Duration,
    buckets: Cache<String, Arc<Bucket>>,
}

impl ObjectLimiters {
    pub fn new(window: Duration) -> Self {
        let ttl = window.mul_f32(1.5);
        let buckets = Cache::builder()
            .time_to_idle(ttl)
            .eviction_listener(|workload_uid, _bucket, cause| {
                event!(
                    Level::DEBUG,
                    workload_uid = %workload_uid,
                    ?cause,
                    "Evicted idle workload rate limiter."
                );
            })
            .build();
        ObjectLimiters { window, buckets }
    }

    fn interval_for(&self, max_migrating_replicas: u32) -> Duration {
        let replicas_per_window: NonZeroU32 =
            NonZeroU32::new(max_migrating_replicas).unwrap_or(nonzero!(1u32));
        self.window / replicas_per_window.get()
    }

    /// Returns the bucket for `workload_uid`, creating one sized for
    /// `max_migrating_replicas` tokens per window if none exists yet.
    fn bucket_for(&self, workload_uid: &str, max_migrating_replicas: u32) -> Arc<Bucket> {
        self.buckets.get_with(workload_uid.to_string(), || {
            let interval = self.interval_for(max_migrating_replicas);
            let quota = Quota::with_period(interval)
                .unwrap_or_else(|| Quota::per_second(nonzero!(1u32)))
                .allow_burst(nonzero!(1u32));
            Arc::new(Bucket {
                limiter: RateLimiter::direct(quota),
                interval,
                last_reserved: Mutex::new(None),
            })
        })
    }

    /// `LimitedObjectFilter`: reports whether a token is currently available
    /// without drawing one. Safe to call every time a waiting job is
    /// re-evaluated, since unlike [`Self::reserve`] this never advances the
    /// bucket's state.
    pub fn peek(&self, workload_uid: &str, max_migrating_replicas: u32) -> bool {
        let bucket = self.bucket_for(workload_uid, max_migrating_replicas);
        match *bucket.last_reserved.lock().unwrap() {
            None => true,
            Some(last) => Instant::now().saturating_duration_since(last) >= bucket.interval,
        }
    }

    /// `TrackEvictedPod`'s consumption step: draws one token, to be called
    /// exactly once per job, at the point it is actually handed to the
    /// executor. Returns `false` (and logs, per the design) when the bucket
    /// has no token available; the caller does not block on this.
    pub fn reserve(&self, workload_uid: &str, max_migrating_replicas: u32) -> bool {
        let bucket = self.bucket_for(workload_uid, max_migrating_replicas);
        match bucket.limiter.check() {
            Ok(()) => {
                *bucket.last_reserved.lock().unwrap() = Some(Instant::now());
                true
            }
            Err(_not_until) => {
                event!(
                    Level::WARN,
                    workload_uid = %workload_uid,
                    "No token available to reserve for this workload; continuing anyway."
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_allows_once_then_denies_within_the_window() {
        let limiters = ObjectLimiters::new(Duration::from_secs(60));
        assert!(limiters.reserve("workload-a", 2));
        // Quota::with_period + allow_burst(1) means exactly one token is
        // available until the period elapses, regardless of the replica-derived
        // rate, matching `governor`'s direct-limiter semantics.
        assert!(!limiters.reserve("workload-a", 2));
    }

    #[test]
    fn peek_does_not_consume_a_token() {
        let limiters = ObjectLimiters::new(Duration::from_secs(60));
        for _ in 0..5 {
            assert!(limiters.peek("workload-a", 1));
        }
        assert!(limiters.reserve("workload-a", 1));
        assert!(!limiters.peek("workload-a", 1));
    }

    #[test]
    fn workloads_are_tracked_independently() {
        let limiters = ObjectLimiters::new(Duration::from_secs(60));
        assert!(limiters.reserve("workload-a", 1));
        assert!(limiters.reserve("workload-b", 1));
    }
}
