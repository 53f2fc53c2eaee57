//! Building blocks shared by pools and their drivers.

use chainflow_types::Receipt;
use futures::future::BoxFuture;
use std::{collections::HashMap, future::Future, sync::Arc};
use tokio_util::sync::CancellationToken;

/// A unit of asynchronous work.
///
/// Runners receive the pool's cancellation token and are expected to honor
/// it; the pool never aborts a runner mid-flight.
pub type Runner<P> =
    Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, eyre::Result<P>> + Send>;

/// Maps an upstream payload to the job that should run for it. Used when a
/// pool's jobs are derived from another pool's results.
pub type FeedTransformer<P> = Arc<dyn Fn(TaskPayload<P>) -> Runner<P> + Send + Sync>;

/// Handles a runner failure. The default handler logs and continues.
pub type ErrHandler = Arc<dyn Fn(&eyre::Report) + Send + Sync>;

/// Results accumulated from a finalized group, keyed by job id.
pub type ResultSet<P> = HashMap<String, P>;

/// Box an async closure into a [`Runner`].
pub fn runner<P, F, Fut>(f: F) -> Runner<P>
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = eyre::Result<P>> + Send + 'static,
{
    Box::new(move |token| Box::pin(f(token)))
}

/// Payload flowing between pools: a single runner's output, or the
/// collected outputs of a finalized group.
#[derive(Clone, Debug)]
pub enum TaskPayload<P> {
    Item(P),
    Set(ResultSet<P>),
}

/// Envelope carried on a pool's output channel.
///
/// The receipt rides along so that jobs derived downstream decrement the
/// same completion token as the work that produced the payload.
#[derive(Clone, Debug)]
pub struct TaskResult<P> {
    pub(crate) payload: TaskPayload<P>,
    pub(crate) receipt: Receipt,
}

impl<P> TaskResult<P> {
    /// The payload produced upstream.
    pub fn payload(&self) -> &TaskPayload<P> {
        &self.payload
    }

    /// Consume the envelope, keeping only the payload.
    pub fn into_payload(self) -> TaskPayload<P> {
        self.payload
    }
}

/// Internal envelope for a queued runner.
pub(crate) struct Job<P> {
    pub(crate) runner: Runner<P>,
    pub(crate) id: String,
    pub(crate) group_id: Option<String>,
    pub(crate) receipt: Receipt,
}

/// A collection of jobs sharing a group id, finalized exactly once when the
/// last member reports in.
pub(crate) struct GroupState<P> {
    pub(crate) results: ResultSet<P>,
    pub(crate) receipt: Receipt,
    pub(crate) cursor: usize,
    pub(crate) job_count: usize,
    pub(crate) failed: bool,
}

impl<P> GroupState<P> {
    pub(crate) fn new(job_count: usize, receipt: Receipt) -> Self {
        Self { results: ResultSet::new(), receipt, cursor: 0, job_count, failed: false }
    }
}
