use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::interval;

use crate::metrics::ACTIVE_BUCKETS;

// Token bucket - tracks remaining tokens per client key
#[derive(Debug, Clone)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

// Limiter settings, fixed at construction
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimiterConfig {
    pub refill_rate_per_second: f64,
    pub burst_capacity: u32,
}

impl LimiterConfig {
    pub fn new(refill_rate_per_second: f64, burst_capacity: u32) -> Self {
        Self {
            refill_rate_per_second,
            burst_capacity,
        }
    }

    // rate <= 0 (or NaN) or burst == 0 turns limiting off
    pub fn is_enabled(&self) -> bool {
        self.refill_rate_per_second > 0.0
            && self.refill_rate_per_second.is_finite()
            && self.burst_capacity > 0
    }

    // Time for an empty bucket to fill up again; None when too large to represent
    fn full_refill(&self) -> Option<Duration> {
        Duration::try_from_secs_f64(f64::from(self.burst_capacity) / self.refill_rate_per_second).ok()
    }
}

/// Per-client token bucket rate limiter.
///
/// Buckets live in a sharded map; the entry guard is held only while a
/// bucket is refilled and debited, never across upstream I/O.
pub struct RateLimiter {
    buckets: DashMap<String, Bucket>,
    config: LimiterConfig,
}

impl RateLimiter {
    pub fn new(config: LimiterConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> LimiterConfig {
        self.config
    }

    pub fn allow(&self, key: &str) -> bool {
        self.allow_at(key, Instant::now())
    }

    /// Admission decision for `key` as of `now`.
    ///
    /// `now` values earlier than the bucket's last refill count as zero
    /// elapsed time, so the bucket never gains tokens from clock skew.
    pub fn allow_at(&self, key: &str, now: Instant) -> bool {
        if !self.config.is_enabled() {
            return true;
        }

        let burst = f64::from(self.config.burst_capacity);
        let rate = self.config.refill_rate_per_second;

        if let Some(mut bucket) = self.buckets.get_mut(key) {
            return Self::refill_and_take(&mut bucket, now, burst, rate);
        }

        match self.buckets.entry(key.to_string()) {
            // another request for the same key got here first
            Entry::Occupied(mut occupied) => {
                Self::refill_and_take(occupied.get_mut(), now, burst, rate)
            }
            // first request from this key pays for itself out of a full bucket
            Entry::Vacant(vacant) => {
                vacant.insert(Bucket {
                    tokens: burst - 1.0,
                    last_refill: now,
                });
                true
            }
        }
    }

    fn refill_and_take(bucket: &mut Bucket, now: Instant, burst: f64, rate: f64) -> bool {
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * rate).min(burst);
        if now > bucket.last_refill {
            bucket.last_refill = now;
        }

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Drops buckets that would already have refilled to capacity.
    ///
    /// A recreated bucket starts at `burst - 1` after admitting its first
    /// request, the same state a full bucket reaches, so removal never changes
    /// an admission decision. Returns the number of buckets removed.
    pub fn sweep_idle(&self, now: Instant) -> usize {
        if !self.config.is_enabled() {
            return 0;
        }
        // a bucket that never refills in representable time is never idle enough
        let Some(full_refill) = self.config.full_refill() else {
            return 0;
        };
        let before = self.buckets.len();

        self.buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_refill) < full_refill);

        before.saturating_sub(self.buckets.len())
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    #[cfg(test)]
    fn tokens(&self, key: &str) -> Option<f64> {
        self.buckets.get(key).map(|bucket| bucket.tokens)
    }
}

// Background sweeper - runs every `sweep_every`
pub async fn bucket_sweeper(limiter: Arc<RateLimiter>, sweep_every: Duration) {
    let mut interval = interval(sweep_every);

    tracing::info!(interval = ?sweep_every, "Bucket sweeper started");

    loop {
        interval.tick().await;

        let removed = limiter.sweep_idle(Instant::now());
        ACTIVE_BUCKETS.set(limiter.bucket_count() as f64);

        if removed > 0 {
            tracing::debug!(removed, remaining = limiter.bucket_count(), "Swept idle rate limit buckets");
        }
    }
}
