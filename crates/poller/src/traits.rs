//! Capability contracts consumed by the poller.

use async_trait::async_trait;
use chainflow_pool::{FeedTransformer, Runner, TaskPayload};
use std::collections::HashMap;

/// The chain-specific half of a poller: produces the per-index work the
/// pipeline executes.
///
/// `fetch_sequence` must be pure with respect to its index as far as the
/// number of jobs goes — the poller sizes its per-iteration receipt from
/// `fetch_sequence(0)`. Implementations must be safe for concurrent calls
/// to [`chain_tip_number`](Driver::chain_tip_number).
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    /// Payload type flowing between this driver's pipeline stages.
    type Payload: Clone + Send + 'static;

    /// Chain identifier, e.g. `"ethereum"`.
    fn blockchain(&self) -> &str;

    /// Highest index currently available on the remote node.
    async fn chain_tip_number(&self) -> eyre::Result<u64>;

    /// The jobs pushed as one group for a single index.
    fn fetch_sequence(&self, index: u64) -> HashMap<String, Runner<Self::Payload>>;

    /// Transformers for the optional grouping stage fed by the fetch pool's
    /// results. An empty map (the default) skips the stage.
    fn fetchers(&self) -> HashMap<String, FeedTransformer<Self::Payload>> {
        HashMap::new()
    }

    /// Combines one upstream payload into exactly one runner.
    fn accumulate(&self, upstream: TaskPayload<Self::Payload>) -> Runner<Self::Payload>;

    /// One transformer per persistence target, fed by the accumulate pool.
    fn writers(&self) -> Vec<FeedTransformer<Self::Payload>>;
}

/// Key-value store holding each poller's cursor.
///
/// Keys are formatted by the poller as `"{blockchain}-block"` unless a
/// cursor key is configured. No TTL semantics are required.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Read the cursor stored under `key`.
    async fn current_block_number(&self, key: &str) -> eyre::Result<u64>;

    /// Overwrite the cursor stored under `key`.
    async fn set_current_block_number(&self, key: &str, number: u64) -> eyre::Result<()>;
}
