//! Bounded-attempt execution with a pluggable sleep policy, plus a
//! rate-limited client wrapper for upstream RPC endpoints.
//!
//! Two flavors cover the two call sites in the poller: [`exec`] retries a
//! plain failable operation and sleeps between attempts, while
//! [`exec_with_control`] lets the operation decide per-attempt whether a
//! retry is worthwhile (and do its own pacing).

#![warn(missing_debug_implementations, unreachable_pub, rustdoc::all)]
#![deny(unused_must_use, rust_2018_idioms)]

mod limit;

pub use limit::RateLimitedClient;

use std::{future::Future, time::Duration};
use thiserror::Error;

/// Sleep policy invoked between attempts; receives the 1-based index of the
/// attempt about to run.
pub type Sleeper = fn(attempt: u32) -> Duration;

const MAX_BACKOFF: Duration = Duration::from_secs(64);

/// Default sleep policy: exponential backoff on the attempt index, capped
/// at [`MAX_BACKOFF`].
pub fn default_backoff(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(6);
    Duration::from_secs(1u64 << exp).min(MAX_BACKOFF)
}

/// Failure modes of [`exec`] and [`exec_with_control`].
#[derive(Debug, Error)]
pub enum RetryError {
    /// The attempt budget ran out. Carries the final attempt's failure.
    #[error("exceeded retry limit after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: eyre::Report },
    /// The operation reported a non-retryable failure.
    #[error("aborted after {attempts} attempts: {last}")]
    Aborted { attempts: u32, last: eyre::Report },
}

impl RetryError {
    /// The failure reported by the final attempt.
    pub fn last(&self) -> &eyre::Report {
        match self {
            Self::Exhausted { last, .. } | Self::Aborted { last, .. } => last,
        }
    }
}

/// Run `op` up to `max_retries` times, stopping on the first success.
///
/// Between attempts the sleep policy decides how long to pause; `None`
/// selects [`default_backoff`]. Exhausting the budget yields
/// [`RetryError::Exhausted`] wrapping the final failure.
pub async fn exec<T, E, F, Fut>(
    max_retries: u32,
    mut op: F,
    sleeper: Option<Sleeper>,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Into<eyre::Report>,
{
    let sleeper = sleeper.unwrap_or(default_backoff);
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= max_retries {
                    return Err(RetryError::Exhausted { attempts: attempt, last: err.into() });
                }
                attempt += 1;
                tokio::time::sleep(sleeper(attempt)).await;
            }
        }
    }
}

/// Run `op` up to `max_retries` times, letting the operation steer.
///
/// Each attempt returns `(may_retry, result)`. The loop stops on success,
/// on `may_retry == false` (yielding [`RetryError::Aborted`]), or when the
/// budget runs out (yielding [`RetryError::Exhausted`]). Pacing between
/// attempts is the operation's own business.
pub async fn exec_with_control<T, E, F, Fut>(max_retries: u32, mut op: F) -> Result<T, RetryError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = (bool, Result<T, E>)>,
    E: Into<eyre::Report>,
{
    let mut attempt = 1u32;
    loop {
        let (may_retry, result) = op(attempt).await;
        match result {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !may_retry {
                    return Err(RetryError::Aborted { attempts: attempt, last: err.into() });
                }
                if attempt >= max_retries {
                    return Err(RetryError::Exhausted { attempts: attempt, last: err.into() });
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_sleep(_attempt: u32) -> Duration {
        Duration::ZERO
    }

    #[tokio::test]
    async fn exec_returns_first_success() {
        let calls = AtomicU32::new(0);
        let out = exec::<_, eyre::Report, _, _>(
            5,
            || {
                let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if attempt < 3 {
                        Err(eyre::eyre!("transient"))
                    } else {
                        Ok(attempt)
                    }
                }
            },
            Some(no_sleep),
        )
        .await;

        assert_eq!(out.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exec_reports_the_sentinel_on_exhaustion() {
        let out = exec::<u32, _, _, _>(
            3,
            || async { Err(eyre::eyre!("still down")) },
            Some(no_sleep),
        )
        .await;

        let err = out.unwrap_err();
        assert_matches!(err, RetryError::Exhausted { attempts: 3, .. });
        assert!(err.to_string().starts_with("exceeded retry limit"));
    }

    #[tokio::test]
    async fn control_variant_exhausts_after_three_attempts() {
        let out = exec_with_control::<u32, _, _, _>(3, |_attempt| async {
            (true, Err(eyre::eyre!("nope")))
        })
        .await;

        assert_matches!(out.unwrap_err(), RetryError::Exhausted { attempts: 3, .. });
    }

    #[tokio::test]
    async fn control_variant_succeeds_on_the_fourth_attempt() {
        let out = exec_with_control::<u32, eyre::Report, _, _>(4, |attempt| async move {
            if attempt < 4 {
                (true, Err(eyre::eyre!("nope")))
            } else {
                (true, Ok(attempt))
            }
        })
        .await;

        assert_eq!(out.unwrap(), 4);
    }

    #[tokio::test]
    async fn control_variant_stops_when_told_not_to_retry() {
        let calls = AtomicU32::new(0);
        let out = exec_with_control::<u32, _, _, _>(10, |_attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { (false, Err(eyre::eyre!("fatal"))) }
        })
        .await;

        assert_matches!(out.unwrap_err(), RetryError::Aborted { attempts: 1, .. });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(default_backoff(1), Duration::from_secs(1));
        assert_eq!(default_backoff(2), Duration::from_secs(2));
        assert_eq!(default_backoff(4), Duration::from_secs(8));
        assert_eq!(default_backoff(40), MAX_BACKOFF);
    }
}
