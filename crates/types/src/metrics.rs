//! Statsd-shaped metrics capability.

/// Status attached to a [`ServiceCheck`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceCheckStatus {
    Ok,
    Warn,
    Critical,
    Unknown,
}

/// A named health probe result.
#[derive(Debug, Clone)]
pub struct ServiceCheck {
    pub name: String,
    pub status: ServiceCheckStatus,
}

/// An operational event worth surfacing to the metrics backend.
#[derive(Debug, Clone)]
pub struct Event {
    pub title: String,
    pub text: String,
}

/// Metrics sink consumed by the poller and pools.
///
/// The shape mirrors a statsd client: counters, gauges, service checks, and
/// events, all sampled at `rate`. Implementations are injected; the
/// framework never reaches for a global sink. [`NoopMetrics`] satisfies
/// callers that do not report anywhere.
pub trait Metrics: Send + Sync {
    fn incr(&self, name: &str, tags: &[String], rate: f64) -> eyre::Result<()>;
    fn decr(&self, name: &str, tags: &[String], rate: f64) -> eyre::Result<()>;
    fn count(&self, name: &str, value: i64, tags: &[String], rate: f64) -> eyre::Result<()>;
    fn gauge(&self, name: &str, value: f64, tags: &[String], rate: f64) -> eyre::Result<()>;
    fn close(&self) -> eyre::Result<()>;
    fn service_check(&self, check: ServiceCheck) -> eyre::Result<()>;
    fn simple_event(&self, title: &str, text: &str) -> eyre::Result<()>;
    fn event(&self, event: Event) -> eyre::Result<()>;
}

/// Discards every metric. The default sink wherever one is optional.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn incr(&self, _name: &str, _tags: &[String], _rate: f64) -> eyre::Result<()> {
        Ok(())
    }

    fn decr(&self, _name: &str, _tags: &[String], _rate: f64) -> eyre::Result<()> {
        Ok(())
    }

    fn count(&self, _name: &str, _value: i64, _tags: &[String], _rate: f64) -> eyre::Result<()> {
        Ok(())
    }

    fn gauge(&self, _name: &str, _value: f64, _tags: &[String], _rate: f64) -> eyre::Result<()> {
        Ok(())
    }

    fn close(&self) -> eyre::Result<()> {
        Ok(())
    }

    fn service_check(&self, _check: ServiceCheck) -> eyre::Result<()> {
        Ok(())
    }

    fn simple_event(&self, _title: &str, _text: &str) -> eyre::Result<()> {
        Ok(())
    }

    fn event(&self, _event: Event) -> eyre::Result<()> {
        Ok(())
    }
}
