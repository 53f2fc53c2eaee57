//! Shared primitives for the chainflow pipeline framework.
//!
//! Everything here is deliberately small: the receipt handle that tracks
//! outstanding work for one logical unit, and the metrics capability the
//! poller reports through. Both are injected collaborators, never globals.

#![warn(missing_debug_implementations, unreachable_pub, rustdoc::all)]
#![deny(unused_must_use, rust_2018_idioms)]

mod metrics;
mod receipt;

pub use metrics::{Event, Metrics, NoopMetrics, ServiceCheck, ServiceCheckStatus};
pub use receipt::Receipt;
