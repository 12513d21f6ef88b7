use serde::{Deserialize, Serialize};

use crate::changes::{ChangeCounters, ChangeQueue};
use crate::cluster::{NodeRegistry, NodeStatus};

/// Overall verdict of a health snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// Every check passed.
    Healthy,
    /// Some check failed but changes are still accepted.
    Degraded,
    /// Quorum is lost; new changes are refused.
    Unhealthy,
}

/// One health check and its measured values.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Check {
    Quorum {
        live: usize,
        required: usize,
        healthy: bool,
    },
    LocalStatus {
        status: NodeStatus,
        healthy: bool,
    },
    CommitGap {
        commit_id: u64,
        waiting_for: Option<u64>,
        pending: usize,
        healthy: bool,
    },
    SkippedIds {
        count: usize,
        healthy: bool,
    },
    ArchiveTail {
        tail_len: usize,
        threshold: usize,
        healthy: bool,
    },
}

impl Check {
    fn healthy(&self) -> bool {
        match self {
            Check::Quorum { healthy, .. }
            | Check::LocalStatus { healthy, .. }
            | Check::CommitGap { healthy, .. }
            | Check::SkippedIds { healthy, .. }
            | Check::ArchiveTail { healthy, .. } => *healthy,
        }
    }
}

/// Health snapshot of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterHealth {
    /// Worst status over all checks.
    pub status: HealthStatus,
    /// Individual checks.
    pub checks: Vec<Check>,
    /// Change queue totals.
    pub counters: ChangeCounters,
}

impl ClusterHealth {
    /// Empty, healthy snapshot.
    pub fn new() -> Self {
        Self {
            status: HealthStatus::Healthy,
            checks: Vec::new(),
            counters: ChangeCounters::default(),
        }
    }

    /// Snapshot of the node as seen by its registry and change queue.
    pub fn collect(registry: &NodeRegistry, queue: &ChangeQueue, tail_threshold: usize) -> Self {
        let mut health = Self::new();
        health.counters = queue.counters();
        health.add_check(Check::Quorum {
            live: registry.live_count(),
            required: registry.quorum_size(),
            healthy: registry.has_quorum(),
        });
        if let Some(local) = registry.node(registry.this_id()) {
            // still catching up from a peer
            health.add_check(Check::LocalStatus {
                status: local.status,
                healthy: local.status == NodeStatus::Ready,
            });
        }
        let waiting_for = queue.waiting_for();
        health.add_check(Check::CommitGap {
            commit_id: queue.commit_id().0,
            waiting_for: waiting_for.map(|id| id.0),
            pending: queue.pending_len(),
            healthy: waiting_for.is_none(),
        });
        health.add_check(Check::SkippedIds {
            count: queue.skipped_len(),
            healthy: queue.skipped_len() == 0,
        });
        let tail_len = queue.archive().stats().tail_len;
        health.add_check(Check::ArchiveTail {
            tail_len,
            threshold: tail_threshold,
            // one full threshold of slack before the flusher counts as behind
            healthy: tail_len < tail_threshold.saturating_mul(2),
        });
        health
    }

    /// Records a check; a failed quorum check makes the node unhealthy.
    pub fn add_check(&mut self, check: Check) {
        if !check.healthy() {
            if matches!(check, Check::Quorum { .. }) {
                self.status = HealthStatus::Unhealthy;
            } else if self.status == HealthStatus::Healthy {
                self.status = HealthStatus::Degraded;
            }
        }
        self.checks.push(check);
    }

    /// True when every check passed.
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

impl Default for ClusterHealth {
    fn default() -> Self {
        Self::new()
    }
}
