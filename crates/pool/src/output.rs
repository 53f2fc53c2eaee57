//! Output-channel handle that survives flush-and-restart.

use crate::TaskResult;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use tokio::sync::{mpsc, watch, Mutex};

/// Cloneable handle to a pool's output channel.
///
/// The handle stays valid across `flush_and_restart`: the owning pool swaps
/// the receiver behind it and bumps a generation counter, so a feed worker
/// that drained a closed receiver can re-attach to the replacement instead
/// of reading a dead channel forever.
pub struct OutputFeed<P> {
    shared: Arc<Shared<P>>,
}

struct Shared<P> {
    rx: Mutex<mpsc::Receiver<TaskResult<P>>>,
    generation: watch::Sender<u64>,
    depth: AtomicUsize,
}

impl<P> Clone for OutputFeed<P> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<P> OutputFeed<P> {
    /// A handle whose channel is closed until the owning pool starts and
    /// swaps in the real receiver.
    pub(crate) fn detached() -> Self {
        let (tx, rx) = mpsc::channel(1);
        drop(tx);
        let (generation, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                rx: Mutex::new(rx),
                generation,
                depth: AtomicUsize::new(0),
            }),
        }
    }

    /// Receive the next upstream result. `None` means the current channel
    /// is closed: the upstream pool stopped or flushed.
    pub async fn recv(&self) -> Option<TaskResult<P>> {
        let item = self.shared.rx.lock().await.recv().await;
        if item.is_some() {
            let _ = self
                .shared
                .depth
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
        }
        item
    }

    /// Results sitting in the channel, awaiting a consumer.
    pub fn len(&self) -> usize {
        self.shared.depth.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Generation seen right now; increases whenever the owning pool
    /// replaces the channel.
    pub(crate) fn generation(&self) -> u64 {
        *self.shared.generation.borrow()
    }

    /// Wait until the channel has been replaced since `seen`.
    pub(crate) async fn replaced(&self, seen: u64) {
        let mut rx = self.shared.generation.subscribe();
        // The sender lives in `self.shared`, so this cannot fail.
        let _ = rx.wait_for(|generation| *generation > seen).await;
    }

    /// Install a fresh receiver. Callers must have dropped every sender to
    /// the previous channel first, so a feed worker blocked in `recv`
    /// resolves promptly and releases the lock.
    pub(crate) async fn swap(&self, rx: mpsc::Receiver<TaskResult<P>>) {
        *self.shared.rx.lock().await = rx;
        self.shared.depth.store(0, Ordering::Relaxed);
        self.shared.generation.send_modify(|generation| *generation += 1);
    }

    /// Record a send into the current channel.
    pub(crate) fn note_send(&self) {
        self.shared.depth.fetch_add(1, Ordering::Relaxed);
    }
}

impl<P> std::fmt::Debug for OutputFeed<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputFeed")
            .field("generation", &self.generation())
            .field("depth", &self.len())
            .finish()
    }
}
