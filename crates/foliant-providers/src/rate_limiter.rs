use std::num::NonZeroU32;
use std::sync::Arc;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovernorLimiter};
use nonzero_ext::nonzero;

/// Token-bucket rate limiter applied *before* concurrency admission, so
/// transient bursts never exceed the provider's posted request rate.
///
/// Thin wrapper around `governor`'s in-memory, unkeyed limiter.
pub struct RateLimiter {
    inner: GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl RateLimiter {
    /// `requests_per_second == 0` is treated as "unlimited" (burst of 1
    /// req/s floor is meaningless for a disabled limiter).
    pub fn new(requests_per_second: u32) -> Self {
        let rps = NonZeroU32::new(requests_per_second).unwrap_or(nonzero!(1_000_000u32));
        // Cap burst at a single cell so a pool never admits more than the
        // posted rate in one instant — strict pacing rather than
        // allow-then-throttle.
        let quota = Quota::per_second(rps).allow_burst(nonzero!(1u32));
        Self {
            inner: GovernorLimiter::direct(quota),
        }
    }

    /// Block until a request is admitted under the configured rate.
    pub async fn acquire(&self) {
        self.inner.until_ready().await;
    }
}

/// Shared handle, cheap to clone across pool worker tasks.
pub type SharedRateLimiter = Arc<RateLimiter>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn enforces_approximate_rate() {
        let limiter = RateLimiter::new(5);
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire().await;
        }
        // Five permits at 5rps with a burst-of-one quota should take
        // roughly 4 * 200ms; assert it's not instantaneous.
        assert!(start.elapsed().as_millis() >= 300);
    }
}
