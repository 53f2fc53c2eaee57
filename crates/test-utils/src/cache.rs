//! In-memory cursor cache.

use async_trait::async_trait;
use chainflow_poller::Cache;
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};

/// Hash-map [`Cache`] for tests. Missing keys read as 0: a fresh chain
/// starts at genesis.
#[derive(Debug, Clone, Default)]
pub struct MemoryCache {
    entries: Arc<Mutex<HashMap<String, u64>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a cursor before handing the cache to a poller.
    pub fn insert(&self, key: impl Into<String>, value: u64) {
        self.entries.lock().insert(key.into(), value);
    }

    /// Inspect a stored cursor.
    pub fn get(&self, key: &str) -> Option<u64> {
        self.entries.lock().get(key).copied()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn current_block_number(&self, key: &str) -> eyre::Result<u64> {
        Ok(self.entries.lock().get(key).copied().unwrap_or(0))
    }

    async fn set_current_block_number(&self, key: &str, number: u64) -> eyre::Result<()> {
        self.entries.lock().insert(key.to_string(), number);
        Ok(())
    }
}
