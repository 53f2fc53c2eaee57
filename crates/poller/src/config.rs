//! Poller configuration.

use serde::Deserialize;
use std::time::Duration;

/// Tunables for one poller instance.
///
/// Deserializable from any serde source; durations accept humantime strings
/// such as `"12s"` or `"500ms"`. Only `blockchain` is required.
#[derive(Debug, Clone, Deserialize)]
pub struct PollerConfig {
    /// Chain identifier, e.g. `"ethereum"`. Used to derive the default
    /// cursor key.
    pub blockchain: String,

    /// Indexes pulled per backfill iteration.
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,

    /// Safety margin kept between the cursor and the remote chain tip.
    #[serde(default = "default_reorg_depth")]
    pub reorg_depth: u64,

    /// Attempt budget for remote tip reads and cursor persistence.
    #[serde(default = "default_http_retries")]
    pub http_retries: u32,

    /// How long to back off once the cursor is within reorg range.
    #[serde(default = "default_sleep_time", with = "humantime_serde")]
    pub sleep_time: Duration,

    /// Pause between iterations while paused, sleeping, or recovering from
    /// a transient failure.
    #[serde(default = "default_tick", with = "humantime_serde")]
    pub tick: Duration,

    /// Start in Ready mode instead of Paused.
    #[serde(default)]
    pub auto_start: bool,

    /// Overrides the derived `"{blockchain}-block"` cursor key.
    #[serde(default)]
    pub cursor_key: Option<String>,

    /// Reserved for trace-driven backfills.
    #[serde(default)]
    pub is_trace_backfill: bool,
}

impl PollerConfig {
    /// A config for `blockchain` with every other field at its default.
    pub fn new(blockchain: impl Into<String>) -> Self {
        Self {
            blockchain: blockchain.into(),
            batch_size: default_batch_size(),
            reorg_depth: default_reorg_depth(),
            http_retries: default_http_retries(),
            sleep_time: default_sleep_time(),
            tick: default_tick(),
            auto_start: false,
            cursor_key: None,
            is_trace_backfill: false,
        }
    }
}

fn default_batch_size() -> u64 {
    100
}

fn default_reorg_depth() -> u64 {
    8
}

fn default_http_retries() -> u32 {
    10
}

fn default_sleep_time() -> Duration {
    Duration::from_secs(12)
}

fn default_tick() -> Duration {
    Duration::from_secs(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn only_blockchain_is_required() {
        let cfg: PollerConfig =
            serde_json::from_value(json!({ "blockchain": "ethereum" })).expect("deserializes");

        assert_eq!(cfg.blockchain, "ethereum");
        assert_eq!(cfg.batch_size, 100);
        assert_eq!(cfg.reorg_depth, 8);
        assert_eq!(cfg.http_retries, 10);
        assert_eq!(cfg.sleep_time, Duration::from_secs(12));
        assert_eq!(cfg.tick, Duration::from_secs(1));
        assert!(!cfg.auto_start);
        assert!(cfg.cursor_key.is_none());
        assert!(!cfg.is_trace_backfill);
    }

    #[test]
    fn durations_accept_humantime_strings() {
        let cfg: PollerConfig = serde_json::from_value(json!({
            "blockchain": "polygon",
            "sleep_time": "500ms",
            "tick": "2s",
            "batch_size": 25,
        }))
        .expect("deserializes");

        assert_eq!(cfg.sleep_time, Duration::from_millis(500));
        assert_eq!(cfg.tick, Duration::from_secs(2));
        assert_eq!(cfg.batch_size, 25);
    }

    #[test]
    fn missing_blockchain_is_an_error() {
        assert!(serde_json::from_value::<PollerConfig>(json!({})).is_err());
    }
}
