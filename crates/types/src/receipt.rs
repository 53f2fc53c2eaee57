//! Multi-party completion token.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::error;

/// Completion token shared by every job queued on behalf of one logical unit
/// of work, e.g. one block index traversing the pipeline.
///
/// Cloning hands the same counter to another party. [`Receipt::wait`]
/// resolves once every reservation made with [`Receipt::add`] has been
/// matched by a [`Receipt::done`].
#[derive(Clone, Debug)]
pub struct Receipt {
    count: Arc<watch::Sender<usize>>,
}

impl Receipt {
    /// A fresh receipt with nothing outstanding.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { count: Arc::new(tx) }
    }

    /// Reserve `n` more completions before [`wait`](Self::wait) may resolve.
    pub fn add(&self, n: usize) {
        if n == 0 {
            return;
        }
        self.count.send_modify(|count| *count += n);
    }

    /// Record one completion.
    ///
    /// Saturates at zero: a decrement without a matching
    /// [`add`](Self::add) is a caller bug and is logged rather than
    /// poisoning the counter.
    pub fn done(&self) {
        self.count.send_modify(|count| match count.checked_sub(1) {
            Some(next) => *count = next,
            None => error!(target: "receipt", "done() called without a matching add()"),
        });
    }

    /// Number of completions still outstanding.
    pub fn outstanding(&self) -> usize {
        *self.count.borrow()
    }

    /// Resolve once the counter reaches zero. Resolves immediately when
    /// nothing is outstanding.
    pub async fn wait(&self) {
        let mut rx = self.count.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|count| *count == 0).await;
    }
}

impl Default for Receipt {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_resolves_immediately_when_nothing_outstanding() {
        let receipt = Receipt::new();
        tokio::time::timeout(Duration::from_millis(100), receipt.wait())
            .await
            .expect("wait on an empty receipt should not block");
    }

    #[tokio::test]
    async fn wait_resolves_after_all_parties_report() {
        let receipt = Receipt::new();
        receipt.add(3);

        for _ in 0..3 {
            let receipt = receipt.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                receipt.done();
            });
        }

        tokio::time::timeout(Duration::from_secs(1), receipt.wait())
            .await
            .expect("all parties reported");
        assert_eq!(receipt.outstanding(), 0);
    }

    #[tokio::test]
    async fn done_without_add_saturates_at_zero() {
        let receipt = Receipt::new();
        receipt.done();
        assert_eq!(receipt.outstanding(), 0);

        receipt.add(1);
        assert_eq!(receipt.outstanding(), 1);
        receipt.done();
        assert_eq!(receipt.outstanding(), 0);
    }
}
