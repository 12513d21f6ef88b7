use serde::{Deserialize, Serialize};

/// Running totals kept by the change queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeCounters {
    /// Changes applied successfully.
    pub applied: u64,
    /// Changes the applier rejected; they were cancelled.
    pub failed: u64,
    /// Ids given up on after the gap timeout.
    pub skipped_with_gap: u64,
    /// Late arrivals for ids that were already skipped.
    pub discarded: u64,
    /// Copies of changes already held or applied.
    pub duplicates: u64,
    /// Changes that arrived below an id already pending.
    pub unaligned: u64,
}
