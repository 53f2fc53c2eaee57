//! Token-bucket pace regulation for pool workers.

use crate::ThrottleError;
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tokio::{sync::Notify, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Token-bucket pace regulator shared by a pool's workers.
///
/// Every `period` the bucket is reset to `bandwidth` tokens — reset, not
/// topped up, so unused capacity never accumulates beyond one window. At
/// most `bandwidth` calls to [`wait_for_go`](Self::wait_for_go) return per
/// period, with bursting up to `bandwidth`.
///
/// The throttler is started by whoever owns the pool wiring, not by the
/// pool itself; one throttler may pace several pools.
#[derive(Clone)]
pub struct Throttler {
    inner: Arc<Inner>,
}

struct Inner {
    bandwidth: usize,
    period: Duration,
    tokens: Mutex<usize>,
    refilled: Notify,
    runtime: Mutex<Option<CancellationToken>>,
}

impl Throttler {
    /// A throttler admitting `bandwidth` calls per `period`. Bandwidth is
    /// clamped to at least 1.
    pub fn new(bandwidth: usize, period: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                bandwidth: bandwidth.max(1),
                period,
                tokens: Mutex::new(0),
                refilled: Notify::new(),
                runtime: Mutex::new(None),
            }),
        }
    }

    /// Fill the bucket and spawn the refill task. Must be called before
    /// [`wait_for_go`](Self::wait_for_go). Restarting after
    /// [`stop`](Self::stop) is not supported.
    pub fn start(&self, parent: &CancellationToken) {
        let mut runtime = self.inner.runtime.lock();
        if runtime.is_some() {
            warn!(target: "throttler", "start called on a running throttler; ignoring");
            return;
        }

        let cancel = parent.child_token();
        *self.inner.tokens.lock() = self.inner.bandwidth;

        let inner = Arc::clone(&self.inner);
        let token = cancel.clone();
        tokio::spawn(async move {
            let mut ticks =
                time::interval_at(time::Instant::now() + inner.period, inner.period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!(target: "throttler", "refill task stopping");
                        break;
                    }
                    _ = ticks.tick() => {
                        *inner.tokens.lock() = inner.bandwidth;
                        inner.refilled.notify_waiters();
                    }
                }
            }
        });

        *runtime = Some(cancel);
    }

    /// Suspend until a token is available, then take it.
    ///
    /// Fails with [`ThrottleError::NotStarted`] before [`start`](Self::start)
    /// and unblocks with [`ThrottleError::Stopped`] when the throttler or
    /// its parent context is cancelled.
    pub async fn wait_for_go(&self) -> Result<(), ThrottleError> {
        let cancel = self
            .inner
            .runtime
            .lock()
            .as_ref()
            .cloned()
            .ok_or(ThrottleError::NotStarted)?;

        loop {
            // Register for the next refill before checking the bucket, so a
            // refill between the check and the await cannot be missed.
            let notified = self.inner.refilled.notified();
            tokio::pin!(notified);
            let _ = notified.as_mut().enable();

            {
                let mut tokens = self.inner.tokens.lock();
                if *tokens > 0 {
                    *tokens -= 1;
                    return Ok(());
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(ThrottleError::Stopped),
                _ = &mut notified => {}
            }
        }
    }

    /// Cancel the refill task; pending waiters unblock with
    /// [`ThrottleError::Stopped`].
    pub fn stop(&self) {
        if let Some(cancel) = self.inner.runtime.lock().as_ref() {
            cancel.cancel();
        }
    }
}

impl std::fmt::Debug for Throttler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Throttler")
            .field("bandwidth", &self.inner.bandwidth)
            .field("period", &self.inner.period)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn wait_before_start_is_a_setup_error() {
        let throttler = Throttler::new(5, Duration::from_secs(1));
        assert_eq!(throttler.wait_for_go().await, Err(ThrottleError::NotStarted));
    }

    #[tokio::test]
    async fn bucket_paces_beyond_the_burst() {
        let parent = CancellationToken::new();
        let throttler = Throttler::new(2, Duration::from_millis(100));
        throttler.start(&parent);

        let started = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..6 {
            let throttler = throttler.clone();
            handles.push(tokio::spawn(async move { throttler.wait_for_go().await }));
        }
        for handle in handles {
            handle.await.expect("task").expect("token");
        }

        // 2 tokens burst at start, then 2 per refill: two refills minimum.
        assert!(started.elapsed() >= Duration::from_millis(180));
        throttler.stop();
    }

    #[tokio::test]
    async fn unused_capacity_does_not_accumulate() {
        let parent = CancellationToken::new();
        let throttler = Throttler::new(3, Duration::from_millis(200));
        throttler.start(&parent);

        // Let several refill windows pass untouched: the bucket still holds
        // only one window's worth.
        tokio::time::sleep(Duration::from_millis(700)).await;
        for _ in 0..3 {
            throttler.wait_for_go().await.expect("burst token");
        }

        // The fourth call has to wait out the rest of the current window.
        let started = Instant::now();
        throttler.wait_for_go().await.expect("refilled token");
        assert!(started.elapsed() >= Duration::from_millis(50));
        throttler.stop();
    }

    #[tokio::test]
    async fn stop_unblocks_pending_waiters() {
        let parent = CancellationToken::new();
        let throttler = Throttler::new(1, Duration::from_secs(60));
        throttler.start(&parent);

        throttler.wait_for_go().await.expect("burst token");

        let waiter = {
            let throttler = throttler.clone();
            tokio::spawn(async move { throttler.wait_for_go().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        throttler.stop();

        assert_eq!(waiter.await.expect("task"), Err(ThrottleError::Stopped));
    }
}
