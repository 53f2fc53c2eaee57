//! Mode selection and cursor management.

use crate::{Driver, Mode, PollerInner};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

impl<D: Driver> PollerInner<D> {
    /// Deduce the next mode from the distance between the local cursor and
    /// the remote chain tip, and return the cursor.
    ///
    /// Runs under the mode mutex. Paused and Sleep are sticky: the remote
    /// tip is not consulted until something else flips the mode back to
    /// Ready.
    pub(crate) async fn set_mode_and_get_cursor(
        &self,
        run: &CancellationToken,
    ) -> eyre::Result<u64> {
        let _guard = self.mode_mu.lock().await;

        let cursor = self.current_cursor().await?;

        let mode = *self.mode.borrow();
        if mode == Mode::Paused || mode == Mode::Sleep {
            return Ok(cursor);
        }

        let chain_tip = self.remote_chain_tip().await?;
        let max_block = chain_tip.saturating_sub(self.cfg.reorg_depth);

        if cursor >= max_block {
            warn!(
                target: "poller",
                cursor,
                max_block,
                "cursor is within reorg range; poller going to sleep"
            );
            self.enter_sleep(run);
        } else if max_block - cursor < self.cfg.batch_size {
            self.mode.send_replace(Mode::Chaintip);
        } else {
            self.mode.send_replace(Mode::Backfill);
        }

        Ok(cursor)
    }

    /// Read the local cursor from the cache, with bounded retries.
    pub(crate) async fn current_cursor(&self) -> eyre::Result<u64> {
        let key = self.cursor_key();
        chainflow_retry::exec(
            self.cfg.http_retries,
            || self.cache.current_block_number(&key),
            None,
        )
        .await
        .map_err(eyre::Report::new)
    }

    /// Read the remote chain tip through the driver, with bounded retries.
    /// A final failure is surfaced so the iteration can be skipped.
    pub(crate) async fn remote_chain_tip(&self) -> eyre::Result<u64> {
        chainflow_retry::exec(self.cfg.http_retries, || self.driver.chain_tip_number(), None)
            .await
            .map_err(eyre::Report::new)
    }

    /// Overwrite the cached cursor, with bounded retries.
    pub(crate) async fn persist_cursor(&self, value: u64) -> eyre::Result<()> {
        let key = self.cursor_key();
        chainflow_retry::exec(
            self.cfg.http_retries,
            || self.cache.set_current_block_number(&key, value),
            None,
        )
        .await
        .map_err(eyre::Report::new)
    }

    pub(crate) fn cursor_key(&self) -> String {
        match &self.cfg.cursor_key {
            Some(key) if !key.is_empty() => key.clone(),
            _ => format!("{}-block", self.driver.blockchain()),
        }
    }

    /// Enter Sleep and spawn a one-shot waiter that flips back to Ready
    /// after `sleep_time`, unless the run context is cancelled first.
    ///
    /// Callers hold the mode mutex. The waiter re-acquires it and only
    /// flips if the mode is still Sleep, so a pause issued while sleeping
    /// wins over the wake-up.
    fn enter_sleep(&self, run: &CancellationToken) {
        self.mode.send_replace(Mode::Sleep);

        let mode = Arc::clone(&self.mode);
        let mode_mu = Arc::clone(&self.mode_mu);
        let sleep_time = self.cfg.sleep_time;
        let run = run.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = run.cancelled() => {}
                _ = tokio::time::sleep(sleep_time) => {
                    let _guard = mode_mu.lock().await;
                    if *mode.borrow() == Mode::Sleep {
                        mode.send_replace(Mode::Ready);
                    }
                }
            }
        });
    }
}
