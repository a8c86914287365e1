//! Snapshot strategies: pure predicates deciding when a host captures a
//! snapshot after folding a live event.

use std::fmt;

/// What a strategy sees after each live event is folded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotContext {
    /// The host's version after the fold.
    pub version: u64,
    /// Events folded since the last snapshot was captured or hydrated.
    pub events_since_snapshot: u64,
}

/// Decides whether a snapshot should be taken.
///
/// Consulted once per live event, never during recovery.
pub trait SnapshotStrategy: fmt::Debug + Send + Sync {
    /// Returns `true` to capture a snapshot at `ctx.version`.
    fn should_snapshot(&self, ctx: &SnapshotContext) -> bool;
}

/// Never snapshot. The default.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverSnapshot;

impl SnapshotStrategy for NeverSnapshot {
    fn should_snapshot(&self, _ctx: &SnapshotContext) -> bool {
        false
    }
}

/// Snapshot whenever the version is a multiple of `n`.
///
/// `SnapshotEvery(0)` never fires.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotEvery(pub u64);

impl SnapshotStrategy for SnapshotEvery {
    fn should_snapshot(&self, ctx: &SnapshotContext) -> bool {
        self.0 != 0 && ctx.version % self.0 == 0
    }
}
