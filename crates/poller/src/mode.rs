//! Poller modes.

use std::fmt;

/// What the poller does on each iteration of its main loop, deduced from
/// the distance between the local cursor and the remote chain tip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Reassess against the chain tip on the next iteration.
    Ready,
    /// Within reorg range; waiting for the chain tip to move before
    /// reassessing.
    Sleep,
    /// Manually halted; stays put until resumed.
    Paused,
    /// Far enough behind the tip to pull whole batches.
    Backfill,
    /// Close to the tip; pulling one index at a time.
    Chaintip,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Ready => "ready",
            Mode::Sleep => "sleep",
            Mode::Paused => "paused",
            Mode::Backfill => "backfill",
            Mode::Chaintip => "chaintip",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
