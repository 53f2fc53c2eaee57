//! Mode-driven poller over a remote index space.
//!
//! A [`Poller`] walks a monotonically increasing cursor (a block number)
//! against a moving chain tip, staying `reorg_depth` behind it, and feeds
//! per-index job groups into the head of a worker-pool pipeline:
//! `fetch → [group] → accumulate → write`. The cursor is persisted through
//! an injected [`Cache`] only after the whole pipeline has drained the
//! indexes of an iteration, so the persisted cursor never runs ahead of
//! fully-processed work.

#![deny(unused_must_use, rust_2018_idioms)]

mod config;
mod mode;
mod sequencing;
mod traits;

pub use config::PollerConfig;
pub use mode::Mode;
pub use traits::{Cache, Driver};

use chainflow_pool::{FeedTransformer, PoolInsights, WorkerPool};
use chainflow_types::{Metrics, NoopMetrics, Receipt};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc, time::Instant};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// The pipeline stages a poller drives, leaf last.
///
/// `fetch` receives the per-index job groups; `group` is the optional
/// fan-out stage for drivers that declare fetchers; `accumulate` reduces
/// each upstream result to one unit; `write` persists. Every stage except
/// `write` needs its output channel enabled so the next stage can feed
/// from it.
#[derive(Debug)]
pub struct Pipeline<P> {
    pub fetch: WorkerPool<P>,
    pub group: Option<WorkerPool<P>>,
    pub accumulate: WorkerPool<P>,
    pub write: WorkerPool<P>,
}

/// Chain-agnostic ETL driver: owns the main loop, the mode machine, and the
/// cursor, and pushes work into the pipeline at whatever rate the
/// downstream pools sustain.
pub struct Poller<D: Driver> {
    inner: Arc<PollerInner<D>>,
}

pub(crate) struct PollerInner<D: Driver> {
    pub(crate) cfg: PollerConfig,
    pub(crate) driver: Arc<D>,
    pub(crate) cache: Arc<dyn Cache>,
    pub(crate) metrics: Arc<dyn Metrics>,
    /// Current mode; transitions happen under `mode_mu`.
    pub(crate) mode: Arc<watch::Sender<Mode>>,
    pub(crate) mode_mu: Arc<AsyncMutex<()>>,
    pub(crate) pipeline: Pipeline<D::Payload>,
    /// Jobs queued per index across every stage; sized once at
    /// construction.
    pub(crate) task_load: usize,
    run: Mutex<Option<CancellationToken>>,
}

/// Outcome of one push-and-drain cycle.
enum Drained {
    /// Every receipt resolved; advance the cursor.
    Complete,
    /// Paused mid-iteration or the pipeline rejected work; the cursor
    /// stays put.
    Abandoned,
    /// The run context was cancelled.
    Shutdown,
}

impl<D: Driver> Poller<D> {
    /// Wire a poller to its pipeline.
    ///
    /// The driver's fetchers decide the pipeline shape: declaring fetchers
    /// requires a `group` pool (fed as a group per fetch result), an empty
    /// map requires none. Starts in [`Mode::Paused`] unless the config says
    /// `auto_start`.
    pub fn new(
        cfg: PollerConfig,
        driver: D,
        cache: Arc<dyn Cache>,
        pipeline: Pipeline<D::Payload>,
    ) -> eyre::Result<Self> {
        if cfg.batch_size == 0 {
            eyre::bail!("batch_size must be at least 1");
        }

        let driver = Arc::new(driver);
        let fetchers = driver.fetchers();
        let writers = driver.writers();
        let task_load = driver.fetch_sequence(0).len() + fetchers.len() + 1 + writers.len();

        let accumulate_transformer: FeedTransformer<D::Payload> = {
            let driver = Arc::clone(&driver);
            Arc::new(move |payload| driver.accumulate(payload))
        };

        match (&pipeline.group, fetchers.is_empty()) {
            (Some(group), false) => {
                group.set_group_input_feed(pipeline.fetch.results(), fetchers);
                pipeline.accumulate.set_input_feed(group.results(), vec![accumulate_transformer]);
            }
            (None, true) => {
                pipeline
                    .accumulate
                    .set_input_feed(pipeline.fetch.results(), vec![accumulate_transformer]);
            }
            (Some(_), true) => {
                eyre::bail!("a group pool was supplied but the driver declares no fetchers")
            }
            (None, false) => {
                eyre::bail!("the driver declares fetchers but no group pool was supplied")
            }
        }
        pipeline.write.set_input_feed(pipeline.accumulate.results(), writers);

        let start_mode = if cfg.auto_start { Mode::Ready } else { Mode::Paused };
        let (mode, _) = watch::channel(start_mode);

        Ok(Self {
            inner: Arc::new(PollerInner {
                cfg,
                driver,
                cache,
                metrics: Arc::new(NoopMetrics),
                mode: Arc::new(mode),
                mode_mu: Arc::new(AsyncMutex::new(())),
                pipeline,
                task_load,
                run: Mutex::new(None),
            }),
        })
    }

    /// Report iteration timing to `metrics` instead of discarding it.
    /// Must be called before [`start`](Self::start).
    pub fn with_metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.metrics = metrics,
            None => warn!(target: "poller", "metrics must be configured before start; ignoring"),
        }
        self
    }

    /// Start the pipeline pools under a fresh run context and spawn the
    /// main loop. Returns immediately.
    pub async fn start(&self, parent: &CancellationToken) -> eyre::Result<()> {
        let run = {
            let mut slot = self.inner.run.lock();
            if slot.is_some() {
                eyre::bail!("poller is already running");
            }
            let token = parent.child_token();
            *slot = Some(token.clone());
            token
        };

        info!(
            target: "poller",
            blockchain = %self.inner.driver.blockchain(),
            mode = %*self.inner.mode.borrow(),
            "poller starting"
        );

        let pipeline = &self.inner.pipeline;
        pipeline.fetch.start(&run).await?;
        if let Some(group) = &pipeline.group {
            group.start(&run).await?;
        }
        pipeline.accumulate.start(&run).await?;
        pipeline.write.start(&run).await?;

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.run_loop(run).await;
        });
        Ok(())
    }

    /// Cancel the run context. The main loop and every pool worker exit at
    /// their next checkpoint.
    pub fn stop(&self) {
        if let Some(run) = self.inner.run.lock().take() {
            run.cancel();
        }
    }

    /// Flush every stage (leaf to root) and halt until [`resume`](Self::resume).
    pub async fn pause(&self) {
        let _guard = self.inner.mode_mu.lock().await;
        let pipeline = &self.inner.pipeline;

        // Leaf first, so no stage re-feeds one that was already cleared.
        if let Err(err) = pipeline.write.flush_and_restart().await {
            warn!(target: "poller", %err, "write pool flush failed");
        }
        if let Err(err) = pipeline.accumulate.flush_and_restart().await {
            warn!(target: "poller", %err, "accumulate pool flush failed");
        }
        if let Some(group) = &pipeline.group {
            if let Err(err) = group.flush_and_restart().await {
                warn!(target: "poller", %err, "group pool flush failed");
            }
        }
        if let Err(err) = pipeline.fetch.flush_and_restart().await {
            warn!(target: "poller", %err, "fetch pool flush failed");
        }

        self.inner.mode.send_replace(Mode::Paused);
        info!(target: "poller", "poller paused");
    }

    /// Leave [`Mode::Paused`]; the next iteration reassesses against the
    /// chain tip.
    pub async fn resume(&self) {
        let _guard = self.inner.mode_mu.lock().await;
        self.inner.mode.send_replace(Mode::Ready);
        info!(target: "poller", "poller resumed");
    }

    /// Operator override: write the cursor directly to the cache.
    pub async fn set_cursor(&self, value: u64) -> eyre::Result<()> {
        self.inner.cache.set_current_block_number(&self.inner.cursor_key(), value).await
    }

    /// The current mode.
    pub fn mode(&self) -> Mode {
        *self.inner.mode.borrow()
    }

    /// Counter snapshots for every pipeline stage.
    pub fn insights(&self) -> HashMap<String, PoolInsights> {
        let pipeline = &self.inner.pipeline;
        let mut stages = HashMap::from([
            ("fetch-pool".to_string(), pipeline.fetch.insights()),
            ("accumulate-pool".to_string(), pipeline.accumulate.insights()),
            ("write-pool".to_string(), pipeline.write.insights()),
        ]);
        if let Some(group) = &pipeline.group {
            stages.insert("group-pool".to_string(), group.insights());
        }
        stages
    }
}

impl<D: Driver> std::fmt::Debug for Poller<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("blockchain", &self.inner.cfg.blockchain)
            .field("mode", &*self.inner.mode.borrow())
            .finish_non_exhaustive()
    }
}

impl<D: Driver> PollerInner<D> {
    async fn run_loop(self: Arc<Self>, run: CancellationToken) {
        loop {
            if run.is_cancelled() {
                warn!(target: "poller", "run context cancelled; poller stopping");
                return;
            }

            let started = Instant::now();
            let cursor = match self.set_mode_and_get_cursor(&run).await {
                Ok(cursor) => cursor,
                Err(err) => {
                    error!(target: "poller", %err, "mode selection failed; skipping iteration");
                    self.idle_tick(&run).await;
                    continue;
                }
            };

            let mode = *self.mode.borrow();
            debug!(target: "poller", mode = %mode, cursor, "top of main loop");

            let advance = match mode {
                Mode::Paused | Mode::Sleep => {
                    self.idle_tick(&run).await;
                    continue;
                }
                Mode::Ready => continue,
                Mode::Backfill => {
                    debug!(
                        target: "poller",
                        cursor,
                        batch_size = self.cfg.batch_size,
                        "backfill: polling a batch"
                    );
                    match self.drain_indexes(&run, cursor, self.cfg.batch_size).await {
                        Drained::Complete => self.cfg.batch_size,
                        Drained::Abandoned => continue,
                        Drained::Shutdown => return,
                    }
                }
                Mode::Chaintip => {
                    debug!(target: "poller", cursor, "chaintip: polling one index");
                    match self.drain_indexes(&run, cursor, 1).await {
                        Drained::Complete => 1,
                        Drained::Abandoned => continue,
                        Drained::Shutdown => return,
                    }
                }
            };

            let next = cursor + advance;
            if let Err(err) = self.persist_cursor(next).await {
                error!(target: "poller", %err, cursor = next, "failed to persist cursor");
                continue;
            }

            debug!(target: "poller", cursor = next, "finished polling iteration");
            let elapsed_ms = started.elapsed().as_millis() as f64;
            if let Err(err) = self.metrics.gauge("keep_up_with_chain_tip", elapsed_ms, &[], 1.0) {
                debug!(target: "poller", %err, "failed to emit iteration gauge");
            }
        }
    }

    /// Push one group per index in `[start, start + count)` and wait for
    /// the whole pipeline to drain them.
    async fn drain_indexes(&self, run: &CancellationToken, start: u64, count: u64) -> Drained {
        let receipt = Receipt::new();
        for offset in 0..count {
            receipt.add(self.task_load);
            let runners = self.driver.fetch_sequence(start + offset);
            if let Err(err) = self.pipeline.fetch.push_group(runners, receipt.clone()) {
                error!(target: "poller", %err, index = start + offset, "failed to push fetch group");
                return Drained::Abandoned;
            }
        }

        let mut paused = self.mode.subscribe();
        tokio::select! {
            _ = receipt.wait() => Drained::Complete,
            _ = run.cancelled() => Drained::Shutdown,
            _ = paused.wait_for(|mode| *mode == Mode::Paused) => {
                // The poller owns this iteration's receipt; a pause flushed
                // the pools, so what's outstanding will never resolve.
                warn!(target: "poller", "paused mid-iteration; abandoning in-flight work");
                Drained::Abandoned
            }
        }
    }

    async fn idle_tick(&self, run: &CancellationToken) {
        tokio::select! {
            _ = run.cancelled() => {}
            _ = tokio::time::sleep(self.cfg.tick) => {}
        }
    }
}
