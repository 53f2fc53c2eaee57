//! Scripted poller driver.

use async_trait::async_trait;
use chainflow_pool::{runner, FeedTransformer, Runner, TaskPayload};
use chainflow_poller::Driver;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

/// A [`Driver`] whose chain tip and stage fan-out are scripted, with
/// counters that make pipeline progress observable from tests.
///
/// Every runner the driver hands out increments the executed counter when
/// it runs; fetch runners additionally record their index. Payloads are
/// the index itself.
#[derive(Debug, Clone)]
pub struct ScriptedDriver {
    blockchain: String,
    tip: Arc<AtomicU64>,
    fetch_jobs: usize,
    fetcher_jobs: usize,
    writer_jobs: usize,
    executed: Arc<AtomicUsize>,
    fetched: Arc<Mutex<Vec<u64>>>,
    tip_queries: Arc<AtomicUsize>,
}

impl ScriptedDriver {
    /// One fetch job, no grouping stage, one writer.
    pub fn new(blockchain: impl Into<String>, tip: u64) -> Self {
        Self {
            blockchain: blockchain.into(),
            tip: Arc::new(AtomicU64::new(tip)),
            fetch_jobs: 1,
            fetcher_jobs: 0,
            writer_jobs: 1,
            executed: Arc::new(AtomicUsize::new(0)),
            fetched: Arc::new(Mutex::new(Vec::new())),
            tip_queries: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Declare `count` fetchers, turning on the grouping stage.
    pub fn with_fetchers(mut self, count: usize) -> Self {
        self.fetcher_jobs = count;
        self
    }

    pub fn with_fetch_jobs(mut self, count: usize) -> Self {
        self.fetch_jobs = count.max(1);
        self
    }

    pub fn with_writers(mut self, count: usize) -> Self {
        self.writer_jobs = count;
        self
    }

    /// Move the scripted chain tip.
    pub fn set_tip(&self, tip: u64) {
        self.tip.store(tip, Ordering::SeqCst);
    }

    /// Runners executed so far, across every stage.
    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::SeqCst)
    }

    /// Indexes whose fetch runners actually ran, in execution order.
    pub fn fetched_indexes(&self) -> Vec<u64> {
        self.fetched.lock().clone()
    }

    /// How many times the poller asked for the chain tip.
    pub fn tip_queries(&self) -> usize {
        self.tip_queries.load(Ordering::SeqCst)
    }

    fn counting_runner(&self, index: u64) -> Runner<u64> {
        let executed = Arc::clone(&self.executed);
        runner(move |_token| async move {
            executed.fetch_add(1, Ordering::SeqCst);
            Ok(index)
        })
    }

    fn counting_transformer(&self) -> FeedTransformer<u64> {
        let executed = Arc::clone(&self.executed);
        Arc::new(move |payload| {
            let executed = Arc::clone(&executed);
            let index = index_of(&payload);
            runner(move |_token| async move {
                executed.fetch_add(1, Ordering::SeqCst);
                Ok(index)
            })
        })
    }
}

fn index_of(payload: &TaskPayload<u64>) -> u64 {
    match payload {
        TaskPayload::Item(index) => *index,
        TaskPayload::Set(set) => set.values().min().copied().unwrap_or(0),
    }
}

#[async_trait]
impl Driver for ScriptedDriver {
    type Payload = u64;

    fn blockchain(&self) -> &str {
        &self.blockchain
    }

    async fn chain_tip_number(&self) -> eyre::Result<u64> {
        self.tip_queries.fetch_add(1, Ordering::SeqCst);
        Ok(self.tip.load(Ordering::SeqCst))
    }

    fn fetch_sequence(&self, index: u64) -> HashMap<String, Runner<u64>> {
        (0..self.fetch_jobs)
            .map(|job| {
                let executed = Arc::clone(&self.executed);
                let fetched = Arc::clone(&self.fetched);
                let job_runner: Runner<u64> = runner(move |_token| async move {
                    fetched.lock().push(index);
                    executed.fetch_add(1, Ordering::SeqCst);
                    Ok(index)
                });
                (format!("fetch-{job}"), job_runner)
            })
            .collect()
    }

    fn fetchers(&self) -> HashMap<String, FeedTransformer<u64>> {
        (0..self.fetcher_jobs)
            .map(|job| (format!("fetcher-{job}"), self.counting_transformer()))
            .collect()
    }

    fn accumulate(&self, upstream: TaskPayload<u64>) -> Runner<u64> {
        self.counting_runner(index_of(&upstream))
    }

    fn writers(&self) -> Vec<FeedTransformer<u64>> {
        (0..self.writer_jobs).map(|_| self.counting_transformer()).collect()
    }
}
