//! Bounded concurrent execution for chain ETL pipelines.
//!
//! A [`WorkerPool`] runs [`Runner`]s with an upper bound on in-flight work,
//! groups related runners behind a single completion signal, and chains to
//! downstream pools through its output channel. Pools are the stages of the
//! poller's pipeline, but stand alone as a general bounded executor.
//!
//! Backpressure comes from the bounded queues: every channel a pool owns has
//! capacity equal to its bandwidth, so a fast producer suspends instead of
//! piling up work.

#![warn(missing_debug_implementations, unreachable_pub, rustdoc::all)]
#![deny(unused_must_use, rust_2018_idioms)]

mod error;
mod insights;
mod output;
mod primitives;
mod throttler;

pub use error::{PoolError, ThrottleError};
pub use insights::PoolInsights;
pub use output::OutputFeed;
pub use primitives::{
    runner, ErrHandler, FeedTransformer, ResultSet, Runner, TaskPayload, TaskResult,
};
pub use throttler::Throttler;

use chainflow_types::Receipt;
use futures::future::join_all;
use insights::PoolCounters;
use parking_lot::Mutex;
use primitives::{GroupState, Job};
use std::{collections::HashMap, sync::Arc};
use tokio::{
    sync::{mpsc, Mutex as AsyncMutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

const DEFAULT_BANDWIDTH: usize = 100;

/// Configurable container for running concurrent tasks, both as one-offs
/// and in groups with a receipt signal.
///
/// A pool spawns `bandwidth` job workers and `bandwidth` error workers on
/// [`start`](Self::start), plus one feed worker when an input feed is
/// configured. Stopping cancels the workers, waits for them to finish their
/// current runner, and closes the job, error, and result queues in that
/// order.
pub struct WorkerPool<P> {
    id: String,
    bandwidth: usize,
    use_output: bool,
    throttler: Option<Throttler>,
    err_handler: ErrHandler,
    counters: Arc<PoolCounters>,
    groups: Arc<Mutex<HashMap<String, GroupState<P>>>>,
    feed: Mutex<Option<FeedKind<P>>>,
    output: OutputFeed<P>,
    core: Mutex<Option<Arc<PoolCore<P>>>>,
    parent: Mutex<Option<CancellationToken>>,
    runtime: AsyncMutex<Option<PoolRuntime>>,
}

/// How a pool derives jobs from an upstream pool's results.
enum FeedKind<P> {
    /// One job per transformer for every upstream result.
    Single { feed: OutputFeed<P>, transformers: Vec<FeedTransformer<P>> },
    /// All transformers together form one group per upstream result.
    Grouped { feed: OutputFeed<P>, transformers: HashMap<String, FeedTransformer<P>> },
}

impl<P> FeedKind<P> {
    fn feed(&self) -> &OutputFeed<P> {
        match self {
            Self::Single { feed, .. } | Self::Grouped { feed, .. } => feed,
        }
    }
}

impl<P> Clone for FeedKind<P> {
    fn clone(&self) -> Self {
        match self {
            Self::Single { feed, transformers } => {
                Self::Single { feed: feed.clone(), transformers: transformers.clone() }
            }
            Self::Grouped { feed, transformers } => {
                Self::Grouped { feed: feed.clone(), transformers: transformers.clone() }
            }
        }
    }
}

/// Everything a worker needs for one run of the pool. Rebuilt on
/// flush-and-restart, so queued work from the previous run cannot leak in.
struct PoolCore<P> {
    id: String,
    use_output: bool,
    cancel: CancellationToken,
    throttler: Option<Throttler>,
    err_handler: ErrHandler,
    counters: Arc<PoolCounters>,
    groups: Arc<Mutex<HashMap<String, GroupState<P>>>>,
    job_tx: mpsc::Sender<Job<P>>,
    job_rx: Arc<AsyncMutex<mpsc::Receiver<Job<P>>>>,
    err_tx: mpsc::Sender<eyre::Report>,
    err_rx: Arc<AsyncMutex<mpsc::Receiver<eyre::Report>>>,
    result_tx: mpsc::Sender<TaskResult<P>>,
    output: OutputFeed<P>,
}

struct PoolRuntime {
    cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

async fn recv_locked<T>(rx: &AsyncMutex<mpsc::Receiver<T>>) -> Option<T> {
    rx.lock().await.recv().await
}

impl<P> WorkerPool<P>
where
    P: Clone + Send + 'static,
{
    /// A pool with default bandwidth and no output channel.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let handler_id = id.clone();
        Self {
            id,
            bandwidth: DEFAULT_BANDWIDTH,
            use_output: false,
            throttler: None,
            err_handler: Arc::new(move |err| {
                error!(target: "pool", id = %handler_id, %err, "error captured by worker");
            }),
            counters: Arc::new(PoolCounters::default()),
            groups: Arc::new(Mutex::new(HashMap::new())),
            feed: Mutex::new(None),
            output: OutputFeed::detached(),
            core: Mutex::new(None),
            parent: Mutex::new(None),
            runtime: AsyncMutex::new(None),
        }
    }

    /// Override the default bandwidth. Clamped to at least 1.
    pub fn with_bandwidth(mut self, bandwidth: usize) -> Self {
        self.bandwidth = bandwidth.max(1);
        self
    }

    /// Publish results on the output channel for a downstream consumer.
    pub fn with_output_channel(mut self) -> Self {
        self.use_output = true;
        self
    }

    /// Pace job dispatch with a throttler.
    pub fn with_throttler(mut self, throttler: Throttler) -> Self {
        self.throttler = Some(throttler);
        self
    }

    /// Override the default log-and-continue error handler.
    pub fn with_err_handler(mut self, handler: ErrHandler) -> Self {
        self.err_handler = handler;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn bandwidth(&self) -> usize {
        self.bandwidth
    }

    /// Derive this pool's jobs from an upstream result feed, one job per
    /// transformer for each incoming result. Derived jobs carry the
    /// upstream receipt, so it covers the whole fan-out.
    ///
    /// Configuring a feed twice is a warning, not a fault: the existing
    /// feed is kept.
    pub fn set_input_feed(&self, feed: OutputFeed<P>, transformers: Vec<FeedTransformer<P>>) {
        let mut slot = self.feed.lock();
        if slot.is_some() {
            warn!(target: "pool", id = %self.id, "input feed already configured; keeping the existing feed");
            return;
        }
        *slot = Some(FeedKind::Single { feed, transformers });
    }

    /// Like [`set_input_feed`](Self::set_input_feed), but all transformers
    /// together form a single group per upstream result; the receipt fires
    /// only after the whole group completes.
    pub fn set_group_input_feed(
        &self,
        feed: OutputFeed<P>,
        transformers: HashMap<String, FeedTransformer<P>>,
    ) {
        let mut slot = self.feed.lock();
        if slot.is_some() {
            warn!(target: "pool", id = %self.id, "input feed already configured; keeping the existing feed");
            return;
        }
        *slot = Some(FeedKind::Grouped { feed, transformers });
    }

    /// Handle to the output channel.
    ///
    /// Only meaningful when the pool was built with
    /// [`with_output_channel`](Self::with_output_channel); otherwise the
    /// feed stays empty.
    pub fn results(&self) -> OutputFeed<P> {
        if !self.use_output {
            warn!(target: "pool", id = %self.id, "results requested without the output-channel option");
        }
        self.output.clone()
    }

    /// Spawn workers and ready the pool for jobs.
    pub async fn start(&self, parent: &CancellationToken) -> Result<(), PoolError> {
        let mut runtime = self.runtime.lock().await;
        if runtime.is_some() {
            return Err(PoolError::AlreadyRunning(self.id.clone()));
        }
        *self.parent.lock() = Some(parent.clone());

        let cancel = parent.child_token();
        let core = self.build_core(cancel.clone()).await;
        *self.core.lock() = Some(Arc::clone(&core));

        debug!(target: "pool", id = %self.id, bandwidth = self.bandwidth, "starting worker pool");

        let mut workers = Vec::with_capacity(self.bandwidth * 2 + 1);
        for _ in 0..self.bandwidth {
            workers.push(tokio::spawn(job_worker(Arc::clone(&core))));
            workers.push(tokio::spawn(error_worker(Arc::clone(&core))));
        }
        if let Some(kind) = self.feed.lock().as_ref() {
            workers.push(tokio::spawn(feed_worker(Arc::clone(&core), kind.clone())));
        }

        *runtime = Some(PoolRuntime { cancel, workers });
        Ok(())
    }

    /// Gracefully shut down: cancel workers, wait for them to finish their
    /// current runner, then close the queues.
    pub async fn stop(&self) {
        let mut runtime = self.runtime.lock().await;
        let Some(state) = runtime.take() else { return };

        debug!(target: "pool", id = %self.id, "stopping worker pool");
        state.cancel.cancel();
        join_all(state.workers).await;

        // Closes job, error, and result queues, in that order: the workers
        // are gone, so dropping the core drops the last senders.
        self.core.lock().take();
    }

    /// Discard queued work and rebuild the pool in place.
    ///
    /// Payloads still sitting in channels are dropped. Receipts already
    /// decremented stay decremented; receipts for dropped work are the
    /// caller's responsibility.
    pub async fn flush_and_restart(&self) -> Result<(), PoolError> {
        let parent =
            self.parent.lock().clone().ok_or_else(|| PoolError::NotRunning(self.id.clone()))?;
        self.stop().await;
        self.groups.lock().clear();
        self.counters.reset();
        self.start(&parent).await
    }

    /// Enqueue a one-off job. Suspends on a full queue (backpressure).
    pub async fn push_job(&self, runner: Runner<P>, receipt: Receipt) -> Result<(), PoolError> {
        let core =
            self.core.lock().clone().ok_or_else(|| PoolError::NotRunning(self.id.clone()))?;
        let job = Job {
            runner,
            id: Uuid::new_v4().to_string(),
            group_id: None,
            receipt,
        };
        tokio::select! {
            _ = core.cancel.cancelled() => Err(PoolError::QueueClosed(self.id.clone())),
            sent = core.job_tx.send(job) => match sent {
                Ok(()) => {
                    insights::incr(&core.counters.queued_jobs);
                    Ok(())
                }
                Err(_) => Err(PoolError::QueueClosed(self.id.clone())),
            }
        }
    }

    /// Queue a group of runners for execution, finalized as one unit.
    ///
    /// Members are enqueued from a detached task, so the caller never
    /// blocks on queue capacity. An empty group finalizes immediately with
    /// an empty result set.
    pub fn push_group(
        &self,
        runners: HashMap<String, Runner<P>>,
        receipt: Receipt,
    ) -> Result<(), PoolError> {
        let core =
            self.core.lock().clone().ok_or_else(|| PoolError::NotRunning(self.id.clone()))?;
        tokio::spawn(async move {
            core.dispatch_group(runners, receipt).await;
        });
        Ok(())
    }

    /// Snapshot of the pool's counters. Never blocks on running work.
    pub fn insights(&self) -> PoolInsights {
        let feed_queue = self.feed.lock().as_ref().map(|kind| kind.feed().len()).unwrap_or(0);
        PoolInsights {
            bandwidth: self.bandwidth,
            in_progress: insights::read(&self.counters.in_progress),
            waiting: insights::read(&self.counters.waiting),
            job_queue: insights::read(&self.counters.queued_jobs),
            err_queue: insights::read(&self.counters.queued_errs),
            feed_queue,
            groups: self.groups.lock().len(),
        }
    }

    async fn build_core(&self, cancel: CancellationToken) -> Arc<PoolCore<P>> {
        let (job_tx, job_rx) = mpsc::channel(self.bandwidth);
        let (err_tx, err_rx) = mpsc::channel(self.bandwidth);
        let (result_tx, result_rx) = mpsc::channel(self.bandwidth);
        self.output.swap(result_rx).await;

        Arc::new(PoolCore {
            id: self.id.clone(),
            use_output: self.use_output,
            cancel,
            throttler: self.throttler.clone(),
            err_handler: Arc::clone(&self.err_handler),
            counters: Arc::clone(&self.counters),
            groups: Arc::clone(&self.groups),
            job_tx,
            job_rx: Arc::new(AsyncMutex::new(job_rx)),
            err_tx,
            err_rx: Arc::new(AsyncMutex::new(err_rx)),
            result_tx,
            output: self.output.clone(),
        })
    }
}

impl<P> std::fmt::Debug for WorkerPool<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("id", &self.id)
            .field("bandwidth", &self.bandwidth)
            .field("use_output", &self.use_output)
            .finish_non_exhaustive()
    }
}

impl<P> PoolCore<P>
where
    P: Clone + Send + 'static,
{
    /// Register a group and enqueue its members, respecting queue
    /// backpressure. The shared receipt is decremented once per member.
    async fn dispatch_group(&self, runners: HashMap<String, Runner<P>>, receipt: Receipt) {
        if runners.is_empty() {
            // An empty group has nothing to wait for: finalize immediately
            // with an empty result set.
            if self.use_output {
                self.emit(TaskResult { payload: TaskPayload::Set(ResultSet::new()), receipt })
                    .await;
            }
            return;
        }

        let group_id = Uuid::new_v4().to_string();
        self.groups
            .lock()
            .insert(group_id.clone(), GroupState::new(runners.len(), receipt.clone()));

        for (job_id, runner) in runners {
            let job = Job {
                runner,
                id: job_id,
                group_id: Some(group_id.clone()),
                receipt: receipt.clone(),
            };
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(target: "pool", id = %self.id, group_id, "pool cancelled while enqueueing group");
                    return;
                }
                sent = self.job_tx.send(job) => {
                    if sent.is_err() {
                        debug!(target: "pool", id = %self.id, group_id, "job queue closed while enqueueing group");
                        return;
                    }
                    insights::incr(&self.counters.queued_jobs);
                }
            }
        }
    }

    /// Publish a result downstream. During shutdown in-flight results are
    /// dropped rather than deadlocking against a stopped consumer.
    async fn emit(&self, result: TaskResult<P>) {
        tokio::select! {
            _ = self.cancel.cancelled() => {
                debug!(target: "pool", id = %self.id, "dropping result during shutdown");
            }
            sent = self.result_tx.send(result) => {
                if sent.is_ok() {
                    self.output.note_send();
                }
            }
        }
    }

    /// Hand an error to the error queue; drops it during shutdown.
    async fn push_err(&self, err: eyre::Report) {
        tokio::select! {
            _ = self.cancel.cancelled() => {
                debug!(target: "pool", id = %self.id, "dropping error during shutdown");
            }
            sent = self.err_tx.send(err) => {
                if sent.is_ok() {
                    insights::incr(&self.counters.queued_errs);
                }
            }
        }
    }

    /// Record one member's outcome against its group, finalizing the group
    /// on the last member: emit the result set iff every member succeeded.
    async fn process_group_result(
        &self,
        group_id: &str,
        job_id: String,
        outcome: eyre::Result<P>,
        receipt: Receipt,
    ) {
        let mut error_to_push = None;
        let mut finalized = None;
        {
            let mut groups = self.groups.lock();
            if let Some(group) = groups.get_mut(group_id) {
                group.cursor += 1;
                match outcome {
                    Ok(payload) => {
                        group.results.insert(job_id, payload);
                    }
                    Err(err) => {
                        group.failed = true;
                        error_to_push = Some(err);
                    }
                }
                if group.cursor == group.job_count {
                    finalized = groups.remove(group_id);
                }
            } else {
                // The group table was flushed while this member ran.
                debug!(target: "pool", id = %self.id, group_id, "group missing at completion");
            }
        }

        if let Some(err) = error_to_push {
            self.push_err(err).await;
        }
        if let Some(group) = finalized {
            if !group.failed && self.use_output {
                self.emit(TaskResult {
                    payload: TaskPayload::Set(group.results),
                    receipt: group.receipt,
                })
                .await;
            }
        }
        receipt.done();
    }
}

/// Pulls jobs off the shared queue and runs them, one at a time.
async fn job_worker<P>(core: Arc<PoolCore<P>>)
where
    P: Clone + Send + 'static,
{
    loop {
        let job = tokio::select! {
            _ = core.cancel.cancelled() => break,
            job = recv_locked(&core.job_rx) => match job {
                Some(job) => job,
                None => break,
            },
        };
        insights::decr(&core.counters.queued_jobs);

        if let Some(throttler) = &core.throttler {
            insights::incr(&core.counters.waiting);
            let go = tokio::select! {
                _ = core.cancel.cancelled() => false,
                outcome = throttler.wait_for_go() => outcome.is_ok(),
            };
            insights::decr(&core.counters.waiting);
            if !go {
                // Dispatch aborted by shutdown; the job is dropped but its
                // receipt still resolves.
                job.receipt.done();
                break;
            }
        }

        let Job { runner, id, group_id, receipt } = job;

        insights::incr(&core.counters.in_progress);
        let outcome = runner(core.cancel.clone()).await;
        insights::decr(&core.counters.in_progress);

        match group_id {
            Some(group_id) => {
                core.process_group_result(&group_id, id, outcome, receipt).await;
            }
            None => {
                match outcome {
                    Ok(payload) => {
                        if core.use_output {
                            core.emit(TaskResult {
                                payload: TaskPayload::Item(payload),
                                receipt: receipt.clone(),
                            })
                            .await;
                        }
                    }
                    Err(err) => core.push_err(err).await,
                }
                receipt.done();
            }
        }
    }
}

/// Drains the error queue into the pool's error handler.
async fn error_worker<P>(core: Arc<PoolCore<P>>)
where
    P: Clone + Send + 'static,
{
    loop {
        let err = tokio::select! {
            _ = core.cancel.cancelled() => break,
            err = recv_locked(&core.err_rx) => match err {
                Some(err) => err,
                None => break,
            },
        };
        insights::decr(&core.counters.queued_errs);
        (core.err_handler)(&err);
    }
}

/// Turns upstream results into jobs via the configured transformers.
async fn feed_worker<P>(core: Arc<PoolCore<P>>, kind: FeedKind<P>)
where
    P: Clone + Send + 'static,
{
    let feed = kind.feed().clone();
    loop {
        let seen = feed.generation();
        let next = tokio::select! {
            _ = core.cancel.cancelled() => return,
            item = feed.recv() => item,
        };

        let Some(result) = next else {
            // Upstream stopped or flushed; wait for it to install a
            // replacement channel.
            tokio::select! {
                _ = core.cancel.cancelled() => return,
                _ = feed.replaced(seen) => continue,
            }
        };

        let TaskResult { payload, receipt } = result;
        match &kind {
            FeedKind::Single { transformers, .. } => {
                for transformer in transformers {
                    let job = Job {
                        runner: transformer(payload.clone()),
                        id: Uuid::new_v4().to_string(),
                        group_id: None,
                        receipt: receipt.clone(),
                    };
                    tokio::select! {
                        _ = core.cancel.cancelled() => return,
                        sent = core.job_tx.send(job) => {
                            if sent.is_err() {
                                return;
                            }
                            insights::incr(&core.counters.queued_jobs);
                        }
                    }
                }
            }
            FeedKind::Grouped { transformers, .. } => {
                let runners = transformers
                    .iter()
                    .map(|(job_id, transformer)| (job_id.clone(), transformer(payload.clone())))
                    .collect::<HashMap<_, _>>();
                core.dispatch_group(runners, receipt).await;
            }
        }
    }
}
