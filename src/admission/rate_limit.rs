//! Per-client token buckets.
//!
//! Each client identity gets a bucket on its first request. Buckets are
//! kept in one map owned by the limiter; a periodic sweep bounds how
//! many clients are tracked.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

/// A classic token bucket refilled continuously at `rate` tokens per second.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket.
    pub fn new(burst: u32, now: Instant) -> Self {
        Self {
            tokens: f64::from(burst),
            last_refill: now,
        }
    }

    /// Refill for the time elapsed since the last call, then try to take one token.
    pub fn try_take(&mut self, rate: f64, burst: u32, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * rate).min(f64::from(burst));
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Token-bucket limiter keyed by client identity.
pub struct ClientRateLimiter {
    buckets: Mutex<HashMap<String, TokenBucket>>,
    rate: f64,
    burst: u32,
    max_tracked: usize,
}

impl ClientRateLimiter {
    /// `rate` is tokens per second, `burst` the bucket capacity and
    /// `max_tracked` the client count the sweep shrinks the map back to.
    pub fn new(rate: f64, burst: u32, max_tracked: usize) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            rate,
            burst,
            max_tracked,
        }
    }

    /// Time for one token to accrue.
    pub fn refill_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.rate)
    }

    /// Check-and-consume one token for `client`. Never blocks on I/O.
    pub fn allow(&self, client: &str) -> bool {
        self.allow_at(client, Instant::now())
    }

    pub(crate) fn allow_at(&self, client: &str, now: Instant) -> bool {
        // A poisoned map still holds consistent buckets: every mutation
        // is a single field update.
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        let bucket = buckets
            .entry(client.to_string())
            .or_insert_with(|| TokenBucket::new(self.burst, now));
        bucket.try_take(self.rate, self.burst, now)
    }

    /// Number of clients currently tracked.
    pub fn tracked_clients(&self) -> usize {
        self.buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Shrink the map back to `max_tracked` clients.
    ///
    /// Victims are arbitrary (hash-map iteration order), not least recently
    /// used. Exactly `len - max_tracked` clients are removed when over the
    /// bound and none otherwise. A removed client simply starts again with a
    /// full bucket. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        let excess = buckets.len().saturating_sub(self.max_tracked);
        if excess == 0 {
            return 0;
        }
        let victims: Vec<String> = buckets.keys().take(excess).cloned().collect();
        for client in &victims {
            buckets.remove(client);
        }
        victims.len()
    }

    /// Run [`sweep`](Self::sweep) every `interval` until the limiter is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(limiter) = weak.upgrade() else {
                    break;
                };
                let removed = limiter.sweep();
                if removed > 0 {
                    tracing::info!(removed, "reclaimed rate limiter state");
                }
            }
        })
    }
}
