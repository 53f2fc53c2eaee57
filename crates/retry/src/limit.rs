//! Client-side pace regulation for upstream RPC endpoints.

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::{future::Future, num::NonZeroU32, time::Duration};

/// Wraps calls to an upstream service so that at most `max_requests` begin
/// per `interval`, with bursting up to `max_requests`.
///
/// This regulates a client's outbound rate; the pool-side
/// `Throttler` regulates how fast workers dequeue.
pub struct RateLimitedClient {
    limiter: DefaultDirectRateLimiter,
}

impl RateLimitedClient {
    /// Build a limiter replenishing one permit per `interval` with a burst
    /// allowance of `max_requests`. Fails when `interval` is zero or too
    /// large for the clock.
    pub fn new(max_requests: NonZeroU32, interval: Duration) -> eyre::Result<Self> {
        let quota = Quota::with_period(interval)
            .ok_or_else(|| eyre::eyre!("rate limit interval must be a positive duration"))?
            .allow_burst(max_requests);
        Ok(Self { limiter: RateLimiter::direct(quota) })
    }

    /// Wait for rate-limit clearance, then run `op` once, returning its
    /// result unchanged.
    pub async fn exec<T, E, F, Fut>(&self, op: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.limiter.until_ready().await;
        op().await
    }
}

impl std::fmt::Debug for RateLimitedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitedClient").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn zero_interval_is_rejected() {
        let max = NonZeroU32::new(5).expect("non-zero");
        assert!(RateLimitedClient::new(max, Duration::ZERO).is_err());
    }

    #[tokio::test]
    async fn calls_beyond_the_burst_are_paced() {
        let max = NonZeroU32::new(2).expect("non-zero");
        let client = RateLimitedClient::new(max, Duration::from_millis(50)).expect("limiter");

        let started = Instant::now();
        for _ in 0..4 {
            client
                .exec(|| async { Ok::<_, eyre::Report>(()) })
                .await
                .expect("op never fails");
        }

        // Two calls burst through, the next two each wait one replenish
        // interval.
        assert!(started.elapsed() >= Duration::from_millis(80));
    }
}
