//! Integration tests driving the poller against a scripted chain.

use chainflow_pool::WorkerPool;
use chainflow_poller::{Mode, Pipeline, Poller, PollerConfig};
use chainflow_test_utils::{MemoryCache, ScriptedDriver};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

/// Fetch → accumulate → write, bandwidth 4, outputs wired for chaining.
fn three_stage_pipeline() -> Pipeline<u64> {
    Pipeline {
        fetch: WorkerPool::new("fetch").with_bandwidth(4).with_output_channel(),
        group: None,
        accumulate: WorkerPool::new("accumulate").with_bandwidth(4).with_output_channel(),
        write: WorkerPool::new("write").with_bandwidth(4),
    }
}

fn four_stage_pipeline() -> Pipeline<u64> {
    Pipeline {
        fetch: WorkerPool::new("fetch").with_bandwidth(4).with_output_channel(),
        group: Some(WorkerPool::new("group").with_bandwidth(4).with_output_channel()),
        accumulate: WorkerPool::new("accumulate").with_bandwidth(4).with_output_channel(),
        write: WorkerPool::new("write").with_bandwidth(4),
    }
}

fn fast_config(blockchain: &str) -> PollerConfig {
    let mut cfg = PollerConfig::new(blockchain);
    cfg.batch_size = 3;
    cfg.http_retries = 2;
    cfg.sleep_time = Duration::from_millis(500);
    cfg.tick = Duration::from_millis(10);
    cfg.auto_start = true;
    cfg
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[tokio::test]
async fn backfill_advances_to_the_reorg_horizon() {
    let driver = ScriptedDriver::new("testchain", 20);
    let cache = MemoryCache::new();
    let poller = Poller::new(
        fast_config("testchain"),
        driver.clone(),
        Arc::new(cache.clone()),
        three_stage_pipeline(),
    )
    .expect("wired poller");

    let parent = CancellationToken::new();
    poller.start(&parent).await.expect("start");

    // Tip 20 with reorg depth 8 caps the walk at block 12: three backfill
    // batches of 3 and one final batch ending exactly on the horizon.
    wait_until("sleep at the horizon", || poller.mode() == Mode::Sleep).await;

    assert_eq!(cache.get("testchain-block"), Some(12));

    // Every index below the horizon ran exactly once, none at or past it.
    let mut fetched = driver.fetched_indexes();
    fetched.sort_unstable();
    assert_eq!(fetched, (0..12).collect::<Vec<_>>());

    // fetch + accumulate + write per index.
    assert_eq!(driver.executed(), 36);

    poller.stop();
}

#[tokio::test]
async fn chaintip_iteration_runs_the_grouping_stage() {
    let driver = ScriptedDriver::new("groupchain", 9).with_fetchers(2);
    let cache = MemoryCache::new();
    let poller = Poller::new(
        fast_config("groupchain"),
        driver.clone(),
        Arc::new(cache.clone()),
        four_stage_pipeline(),
    )
    .expect("wired poller");

    let parent = CancellationToken::new();
    poller.start(&parent).await.expect("start");

    // Tip 9, reorg depth 8: exactly one chaintip index (0), then sleep.
    wait_until("sleep after one chaintip pull", || poller.mode() == Mode::Sleep).await;

    assert_eq!(cache.get("groupchain-block"), Some(1));
    assert_eq!(driver.fetched_indexes(), vec![0]);
    // 1 fetch + 2 fetchers + 1 accumulator + 1 writer.
    assert_eq!(driver.executed(), 5);

    poller.stop();
}

#[tokio::test]
async fn sleeping_poller_reassesses_without_advancing() {
    let driver = ScriptedDriver::new("flipchain", 10);
    let cache = MemoryCache::new();
    cache.insert("flipchain-block", 3);

    let mut cfg = fast_config("flipchain");
    cfg.sleep_time = Duration::from_millis(100);
    let poller = Poller::new(cfg, driver.clone(), Arc::new(cache.clone()), three_stage_pipeline())
        .expect("wired poller");

    let parent = CancellationToken::new();
    poller.start(&parent).await.expect("start");

    // Cursor 3 is inside the reorg range (max block 2): straight to sleep,
    // and each wake-up re-reads the tip before sleeping again.
    wait_until("first sleep", || poller.mode() == Mode::Sleep).await;
    wait_until("repeated tip reassessment", || driver.tip_queries() >= 3).await;
    wait_until("back asleep", || poller.mode() == Mode::Sleep).await;

    // No work was pushed and the cursor never moved.
    assert_eq!(driver.executed(), 0);
    assert!(driver.fetched_indexes().is_empty());
    assert_eq!(cache.get("flipchain-block"), Some(3));

    poller.stop();
}

#[tokio::test]
async fn pause_then_resume_leaves_the_cursor_untouched() {
    let driver = ScriptedDriver::new("idlechain", 100);
    let cache = MemoryCache::new();
    cache.insert("idlechain-block", 5);

    let mut cfg = fast_config("idlechain");
    cfg.auto_start = false;
    let poller = Poller::new(cfg, driver, Arc::new(cache.clone()), three_stage_pipeline())
        .expect("wired poller");

    assert_eq!(poller.mode(), Mode::Paused);

    poller.pause().await;
    poller.resume().await;

    assert_eq!(poller.mode(), Mode::Ready);
    assert_eq!(cache.get("idlechain-block"), Some(5));
}

#[tokio::test]
async fn pause_halts_a_running_poller_until_resume() {
    let driver = ScriptedDriver::new("busychain", 1_000_000);
    let cache = MemoryCache::new();
    let poller = Poller::new(
        fast_config("busychain"),
        driver.clone(),
        Arc::new(cache.clone()),
        three_stage_pipeline(),
    )
    .expect("wired poller");

    let parent = CancellationToken::new();
    poller.start(&parent).await.expect("start");

    wait_until("first progress", || driver.executed() > 0).await;
    poller.pause().await;
    assert_eq!(poller.mode(), Mode::Paused);

    // Give in-flight work a moment to settle, then verify nothing moves.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let executed = driver.executed();
    let cursor = cache.get("busychain-block");
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(driver.executed(), executed);
    assert_eq!(cache.get("busychain-block"), cursor);

    poller.resume().await;
    let floor = cursor.unwrap_or(0);
    wait_until("progress after resume", || {
        cache.get("busychain-block").unwrap_or(0) > floor
    })
    .await;

    poller.stop();
}

#[tokio::test]
async fn set_cursor_round_trips_through_the_cache() {
    let driver = ScriptedDriver::new("opschain", 100);
    let cache = MemoryCache::new();
    let mut cfg = fast_config("opschain");
    cfg.auto_start = false;
    let poller = Poller::new(cfg, driver, Arc::new(cache.clone()), three_stage_pipeline())
        .expect("wired poller");

    poller.set_cursor(42).await.expect("override");
    assert_eq!(cache.get("opschain-block"), Some(42));
}

#[tokio::test]
async fn configured_cursor_key_overrides_the_derived_one() {
    let driver = ScriptedDriver::new("keychain", 100);
    let cache = MemoryCache::new();
    let mut cfg = fast_config("keychain");
    cfg.auto_start = false;
    cfg.cursor_key = Some("ops/custom-cursor".to_string());
    let poller = Poller::new(cfg, driver, Arc::new(cache.clone()), three_stage_pipeline())
        .expect("wired poller");

    poller.set_cursor(7).await.expect("override");
    assert_eq!(cache.get("ops/custom-cursor"), Some(7));
    assert_eq!(cache.get("keychain-block"), None);
}

#[tokio::test]
async fn insights_cover_every_stage() {
    let driver = ScriptedDriver::new("statchain", 100).with_fetchers(2);
    let cache = MemoryCache::new();
    let mut cfg = fast_config("statchain");
    cfg.auto_start = false;
    let poller = Poller::new(cfg, driver, Arc::new(cache), four_stage_pipeline())
        .expect("wired poller");

    let stages = poller.insights();
    for stage in ["fetch-pool", "group-pool", "accumulate-pool", "write-pool"] {
        let snapshot = stages.get(stage).unwrap_or_else(|| panic!("missing stage {stage}"));
        assert_eq!(snapshot.bandwidth, 4);
        assert_eq!(snapshot.in_progress, 0);
    }
}

#[tokio::test]
async fn mismatched_grouping_configuration_is_rejected() {
    let cache = MemoryCache::new();

    // Group pool without fetchers.
    let driver = ScriptedDriver::new("badchain", 100);
    let err = Poller::new(
        fast_config("badchain"),
        driver,
        Arc::new(cache.clone()),
        four_stage_pipeline(),
    )
    .err()
    .expect("must be rejected");
    assert!(err.to_string().contains("no fetchers"));

    // Fetchers without a group pool.
    let driver = ScriptedDriver::new("badchain", 100).with_fetchers(2);
    let err = Poller::new(fast_config("badchain"), driver, Arc::new(cache), three_stage_pipeline())
        .err()
        .expect("must be rejected");
    assert!(err.to_string().contains("no group pool"));
}
