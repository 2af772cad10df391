//! Admission control: per-client rate limiting and a global concurrency cap.
//!
//! Both gates are non-blocking. A request is either admitted immediately,
//! receiving an [`AdmissionPermit`] that holds one global slot until it is
//! dropped, or rejected with a [`Rejection`] carrying a retry hint.

pub mod rate_limit;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::config::ConcurrencyConfig;
use crate::constants::{OVERLOAD_RETRY_AFTER, RATE_LIMIT_RETRY_AFTER};

pub use rate_limit::ClientRateLimiter;

/// Why a request was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    /// The client exhausted its token bucket.
    RateLimited,
    /// Every global slot is taken.
    Overloaded,
}

/// A first-class admission refusal. Always retryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejection {
    pub kind: RejectionKind,
    pub retry_after: Duration,
}

impl Rejection {
    fn rate_limited() -> Self {
        Self {
            kind: RejectionKind::RateLimited,
            retry_after: RATE_LIMIT_RETRY_AFTER,
        }
    }

    fn overloaded() -> Self {
        Self {
            kind: RejectionKind::Overloaded,
            retry_after: OVERLOAD_RETRY_AFTER,
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            RejectionKind::RateLimited => f.write_str("Rate limit exceeded"),
            RejectionKind::Overloaded => f.write_str("Server overloaded"),
        }
    }
}

/// One in-flight expensive operation.
///
/// The global slot is returned when the permit is dropped, so it is
/// released exactly once however the request ends.
#[derive(Debug)]
pub struct AdmissionPermit {
    _slot: OwnedSemaphorePermit,
}

/// Per-client gate followed by the global gate.
pub struct AdmissionController {
    limiter: Arc<ClientRateLimiter>,
    slots: Arc<Semaphore>,
    capacity: usize,
}

impl AdmissionController {
    pub fn new(limiter: ClientRateLimiter, max_concurrent: usize) -> Self {
        Self {
            limiter: Arc::new(limiter),
            slots: Arc::new(Semaphore::new(max_concurrent)),
            capacity: max_concurrent,
        }
    }

    pub fn from_config(config: &ConcurrencyConfig) -> Self {
        Self::new(
            ClientRateLimiter::new(
                config.rate_limit_per_ip,
                config.effective_burst(),
                config.max_tracked_clients,
            ),
            config.max_concurrent,
        )
    }

    /// Admit or reject `client` without waiting.
    ///
    /// The client's bucket is consulted first so an abusive client is
    /// stopped before it can occupy global slots.
    pub fn try_acquire(&self, client: &str) -> Result<AdmissionPermit, Rejection> {
        if !self.limiter.allow(client) {
            tracing::debug!(client, "admission rejected: rate limited");
            return Err(Rejection::rate_limited());
        }

        match Arc::clone(&self.slots).try_acquire_owned() {
            Ok(slot) => Ok(AdmissionPermit { _slot: slot }),
            Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => {
                tracing::debug!(client, "admission rejected: overloaded");
                Err(Rejection::overloaded())
            }
        }
    }

    pub fn limiter(&self) -> &Arc<ClientRateLimiter> {
        &self.limiter
    }

    /// Global slots currently free.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Periodically reclaim per-client state; see [`ClientRateLimiter::sweep`].
    pub fn spawn_sweeper(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        self.limiter.spawn_sweeper(interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(rate: f64, burst: u32, slots: usize) -> AdmissionController {
        AdmissionController::new(ClientRateLimiter::new(rate, burst, 1000), slots)
    }

    #[test]
    fn burst_plus_one_is_rate_limited() {
        let admission = controller(0.001, 3, 100);
        let mut permits = Vec::new();
        for _ in 0..3 {
            permits.push(admission.try_acquire("1.2.3.4").unwrap());
        }
        let rejection = admission.try_acquire("1.2.3.4").unwrap_err();
        assert_eq!(rejection.kind, RejectionKind::RateLimited);
        assert_eq!(rejection.retry_after, Duration::from_secs(1));
    }

    #[test]
    fn capacity_plus_one_is_overloaded_until_release() {
        let admission = controller(1000.0, 1000, 2);
        let first = admission.try_acquire("a").unwrap();
        let _second = admission.try_acquire("b").unwrap();
        assert_eq!(admission.available_slots(), 0);

        let rejection = admission.try_acquire("c").unwrap_err();
        assert_eq!(rejection.kind, RejectionKind::Overloaded);
        assert_eq!(rejection.retry_after, Duration::from_secs(5));

        drop(first);
        assert_eq!(admission.available_slots(), 1);
        assert!(admission.try_acquire("c").is_ok());
    }

    #[test]
    fn rate_limited_client_does_not_take_a_slot() {
        let admission = controller(0.001, 1, 1);
        let permit = admission.try_acquire("abuser").unwrap();
        drop(permit);

        assert_eq!(
            admission.try_acquire("abuser").unwrap_err().kind,
            RejectionKind::RateLimited
        );
        assert_eq!(admission.available_slots(), 1);
        assert!(admission.try_acquire("polite").is_ok());
    }

    #[test]
    fn permit_released_on_panic() {
        let admission = Arc::new(controller(1000.0, 1000, 1));
        let inner = Arc::clone(&admission);
        let result = std::thread::spawn(move || {
            let _permit = inner.try_acquire("a").unwrap();
            panic!("handler blew up");
        })
        .join();
        assert!(result.is_err());
        assert_eq!(admission.available_slots(), 1);
    }

    #[test]
    fn from_config_uses_effective_burst() {
        let config = ConcurrencyConfig {
            rate_limit_per_ip: 0.001,
            burst: None,
            max_concurrent: 10,
            ..ConcurrencyConfig::default()
        };
        let admission = AdmissionController::from_config(&config);
        assert_eq!(admission.capacity(), 10);
        assert!(admission.try_acquire("x").is_ok());
        assert_eq!(
            admission.try_acquire("x").unwrap_err().kind,
            RejectionKind::RateLimited
        );
    }

    #[test]
    fn rejection_messages() {
        assert_eq!(Rejection::rate_limited().to_string(), "Rate limit exceeded");
        assert_eq!(Rejection::overloaded().to_string(), "Server overloaded");
    }
}
