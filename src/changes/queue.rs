//! The change queue: id assignment, ordering, gap policy and the commit loop.
//!
//! The queue is driven from a single task and never performs network I/O.
//! Anything that must reach a peer is recorded as an [`Effect`] and drained
//! by the owner with [`ChangeQueue::take_effects`]. Time is passed in
//! explicitly so timers can be driven deterministically.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use super::change::{Change, ChangeStatus, TaskApplier};
use super::counters::ChangeCounters;
use crate::archive::{Archive, ArchiveRecord};
use crate::cluster::NodeRegistry;
use crate::types::{ChangeId, NodeId, Result, TesseraError};

const RECOVER_BATCH_BYTES: usize = 1 << 20;

/// Timing and limits of the queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueOptions {
    /// How long a missing id may block the commit loop before it is skipped.
    pub gap_timeout: Duration,
    /// How long to wait before asking a peer for a missing id.
    pub missing_timeout: Duration,
    /// Largest distance a remote id may be ahead of `next_id`.
    pub max_id_gap: u64,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            gap_timeout: Duration::from_millis(42_000),
            missing_timeout: Duration::from_millis(6_000),
            max_id_gap: 1_000,
        }
    }
}

/// Outbound work produced by queue operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Effect {
    /// Send a new local change to every peer.
    Broadcast(Change),
    /// Ask one ready peer for a single missing id.
    RequestMissing(ChangeId),
    /// Ask a peer to replay `first..=last` after those ids were skipped.
    RequestSync {
        /// First skipped id.
        first: ChangeId,
        /// Last skipped id.
        last: ChangeId,
    },
}

/// Outcome of accepting a remote change.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Received {
    /// Held until its turn in the commit loop.
    Queued,
    /// Identical to a change already held or applied; ignored.
    Duplicate,
    /// The id was skipped earlier; the change is cancelled unapplied.
    Discarded,
}

/// What one pass of the commit loop did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommitReport {
    /// Changes applied.
    pub applied: usize,
    /// Changes the applier rejected.
    pub cancelled: usize,
    /// Skip markers consumed.
    pub skipped: usize,
    /// Commit id after the pass.
    pub commit_id: ChangeId,
}

impl CommitReport {
    /// True when the pass advanced the commit id.
    pub fn advanced(&self) -> bool {
        self.applied + self.cancelled + self.skipped > 0
    }

    fn merge(&mut self, other: CommitReport) {
        self.applied += other.applied;
        self.cancelled += other.cancelled;
        self.skipped += other.skipped;
        self.commit_id = other.commit_id;
    }
}

#[derive(Clone, Debug)]
enum Slot {
    Change(Change),
    Skip,
}

#[derive(Clone, Copy, Debug)]
struct GapWait {
    waiting_for: ChangeId,
    since: Instant,
    missing_requested: bool,
}

/// Orders changes by id and applies them without gaps.
pub struct ChangeQueue {
    this: NodeId,
    options: QueueOptions,
    next_id: ChangeId,
    commit_id: ChangeId,
    pending: BTreeMap<ChangeId, Slot>,
    skipped: BTreeSet<ChangeId>,
    gap: Option<GapWait>,
    archive: Archive,
    counters: ChangeCounters,
    effects: Vec<Effect>,
    synchronizing: bool,
}

impl ChangeQueue {
    /// Creates the queue positioned after the archive's last id.
    pub fn new(this: NodeId, archive: Archive, options: QueueOptions) -> Self {
        let commit_id = archive.last_id();
        info!(%this, commit_id = commit_id.0, "changes.init");
        Self {
            this,
            options,
            next_id: commit_id.next(),
            commit_id,
            pending: BTreeMap::new(),
            skipped: BTreeSet::new(),
            gap: None,
            archive,
            counters: ChangeCounters::default(),
            effects: Vec::new(),
            synchronizing: false,
        }
    }

    /// Local node id.
    pub fn this_id(&self) -> NodeId {
        self.this
    }

    /// Id the next local change receives.
    pub fn next_id(&self) -> ChangeId {
        self.next_id
    }

    /// Highest id applied or skipped with nothing missing below it.
    pub fn commit_id(&self) -> ChangeId {
        self.commit_id
    }

    /// Number of changes and skip markers waiting for their turn.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Lowest id waiting in the queue.
    pub fn lowest_pending(&self) -> Option<ChangeId> {
        self.pending.keys().next().copied()
    }

    /// A change waiting in the queue, if one is held for `id`.
    pub fn pending_change(&self, id: ChangeId) -> Option<&Change> {
        match self.pending.get(&id) {
            Some(Slot::Change(change)) => Some(change),
            _ => None,
        }
    }

    /// True when `id` was given up on.
    pub fn is_skipped(&self, id: ChangeId) -> bool {
        self.skipped.contains(&id)
    }

    /// Number of ids known as skipped.
    pub fn skipped_len(&self) -> usize {
        self.skipped.len()
    }

    /// Id currently blocking the commit loop, if any.
    pub fn waiting_for(&self) -> Option<ChangeId> {
        self.gap.map(|gap| gap.waiting_for)
    }

    /// Running totals.
    pub fn counters(&self) -> ChangeCounters {
        self.counters
    }

    /// Archive the queue writes to.
    pub fn archive(&self) -> &Archive {
        &self.archive
    }

    /// Options in effect.
    pub fn options(&self) -> QueueOptions {
        self.options
    }

    /// While synchronizing, gaps are not skipped; the sync stream fills them.
    pub fn set_synchronizing(&mut self, synchronizing: bool) {
        if self.synchronizing != synchronizing {
            debug!(synchronizing, "changes.synchronizing");
        }
        self.synchronizing = synchronizing;
    }

    /// Drains effects produced since the last call.
    pub fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    /// Creates a change originating on this node and queues its broadcast.
    ///
    /// Fails with `NotQuorum` when too few nodes are live; already queued
    /// changes keep being applied regardless.
    pub fn create_local_change(
        &mut self,
        registry: &NodeRegistry,
        payload: impl Into<Bytes>,
    ) -> Result<Change> {
        registry.require_quorum()?;
        let id = self.next_id;
        self.next_id = id.next();
        let mut change = Change::new(id, self.this, payload);
        change.status = ChangeStatus::Queued;
        debug!(
            id = id.0,
            payload_len = change.payload.len(),
            "changes.create_local"
        );
        self.pending.insert(id, Slot::Change(change.clone()));
        self.effects.push(Effect::Broadcast(change.clone()));
        Ok(change)
    }

    /// Accepts a change from a peer, directly or through a sync stream.
    pub fn receive_remote_change(&mut self, mut change: Change) -> Result<Received> {
        let id = change.id;
        if id == ChangeId(0) {
            return Err(TesseraError::Invalid("change id 0 is reserved"));
        }
        if id <= self.commit_id {
            return self.receive_committed(&change);
        }
        if id.0 > self.next_id.0.saturating_add(self.options.max_id_gap) {
            warn!(
                id = id.0,
                next_id = self.next_id.0,
                origin = %change.origin,
                "changes.gap_too_large"
            );
            return Err(TesseraError::GapTooLarge {
                id,
                next_id: self.next_id,
            });
        }
        if id >= self.next_id {
            self.next_id = id.next();
        }
        match self.pending.get(&id) {
            Some(Slot::Change(existing)) => {
                if existing.same_content(&change) {
                    self.counters.duplicates += 1;
                    Ok(Received::Duplicate)
                } else {
                    Err(self.conflict(id, change.origin, existing.origin))
                }
            }
            Some(Slot::Skip) => {
                self.counters.discarded += 1;
                debug!(id = id.0, "changes.discard_skipped");
                Ok(Received::Discarded)
            }
            None => {
                if self.pending.keys().next_back().is_some_and(|&last| last > id) {
                    self.counters.unaligned += 1;
                }
                change.status = ChangeStatus::Queued;
                debug!(id = id.0, origin = %change.origin, "changes.queue_remote");
                self.pending.insert(id, Slot::Change(change));
                Ok(Received::Queued)
            }
        }
    }

    fn receive_committed(&mut self, change: &Change) -> Result<Received> {
        let id = change.id;
        if self.skipped.contains(&id) {
            self.counters.discarded += 1;
            debug!(id = id.0, "changes.discard_skipped");
            return Ok(Received::Discarded);
        }
        match self.archive.get(id)? {
            Some(ArchiveRecord::Applied(existing)) if !existing.same_content(change) => {
                Err(self.conflict(id, change.origin, existing.origin))
            }
            Some(ArchiveRecord::Skipped(_)) => {
                self.skipped.insert(id);
                self.counters.discarded += 1;
                Ok(Received::Discarded)
            }
            // identical, cancelled, or older than the retained history
            _ => {
                self.counters.duplicates += 1;
                Ok(Received::Duplicate)
            }
        }
    }

    fn conflict(&self, id: ChangeId, origin: NodeId, existing_origin: NodeId) -> TesseraError {
        error!(
            id = id.0,
            %origin,
            %existing_origin,
            "changes.duplicate_id"
        );
        TesseraError::DuplicateId {
            id,
            origin,
            existing_origin,
        }
    }

    /// Accepts a skip marker replayed by a peer.
    ///
    /// A pending change for the same id takes precedence over the marker.
    pub fn receive_remote_skip(&mut self, id: ChangeId) -> Result<Received> {
        if id == ChangeId(0) {
            return Err(TesseraError::Invalid("change id 0 is reserved"));
        }
        if id <= self.commit_id {
            self.counters.duplicates += 1;
            return Ok(Received::Duplicate);
        }
        if id.0 > self.next_id.0.saturating_add(self.options.max_id_gap) {
            return Err(TesseraError::GapTooLarge {
                id,
                next_id: self.next_id,
            });
        }
        if id >= self.next_id {
            self.next_id = id.next();
        }
        if self.pending.contains_key(&id) {
            self.counters.duplicates += 1;
            return Ok(Received::Duplicate);
        }
        self.pending.insert(id, Slot::Skip);
        Ok(Received::Queued)
    }

    /// Applies every immediately applicable change in id order.
    ///
    /// A change rejected by the applier is cancelled and logged with its full
    /// payload; its id still consumes its slot and the loop continues.
    pub fn drive_commit_loop<A>(&mut self, applier: &mut A) -> Result<CommitReport>
    where
        A: TaskApplier + ?Sized,
    {
        let mut report = CommitReport::default();
        loop {
            let next = self.commit_id.next();
            let Some(slot) = self.pending.remove(&next) else {
                break;
            };
            match slot {
                Slot::Skip => {
                    self.archive.push(ArchiveRecord::Skipped(next))?;
                    self.skipped.insert(next);
                    report.skipped += 1;
                }
                Slot::Change(mut change) => {
                    change.status = ChangeStatus::Applying;
                    match applier.apply(&change.payload) {
                        Ok(()) => {
                            change.status = ChangeStatus::Applied;
                            self.archive.push(ArchiveRecord::Applied(change))?;
                            self.counters.applied += 1;
                            report.applied += 1;
                        }
                        Err(err) => {
                            change.status = ChangeStatus::Cancelled;
                            error!(
                                id = next.0,
                                origin = %change.origin,
                                error = %err,
                                payload = %hex::encode(&change.payload),
                                "changes.apply_failed"
                            );
                            self.archive.push(ArchiveRecord::Cancelled(next))?;
                            self.counters.failed += 1;
                            report.cancelled += 1;
                        }
                    }
                }
            }
            self.commit_id = next;
        }
        if self
            .gap
            .is_some_and(|gap| gap.waiting_for <= self.commit_id)
        {
            // the awaited id arrived; cancel the timer
            self.gap = None;
        }
        report.commit_id = self.commit_id;
        if report.advanced() {
            debug!(
                applied = report.applied,
                cancelled = report.cancelled,
                skipped = report.skipped,
                commit_id = self.commit_id.0,
                "changes.commit"
            );
        }
        Ok(report)
    }

    // Arms the gap timer when the lowest pending id is not the next one.
    fn refresh_gap(&mut self, now: Instant) {
        let expected = self.commit_id.next();
        match self.lowest_pending() {
            Some(lowest) if lowest > expected => {
                if self.gap.map(|gap| gap.waiting_for) != Some(expected) {
                    debug!(waiting_for = expected.0, "changes.gap_detected");
                    self.gap = Some(GapWait {
                        waiting_for: expected,
                        since: now,
                        missing_requested: false,
                    });
                }
            }
            _ => self.gap = None,
        }
    }

    /// Advances the gap timers; returns the next deadline, if any.
    pub fn poll_timers(&mut self, now: Instant) -> Result<Option<Instant>> {
        self.refresh_gap(now);
        let Some(mut gap) = self.gap else {
            return Ok(None);
        };
        let elapsed = now.saturating_duration_since(gap.since);
        if !gap.missing_requested && elapsed >= self.options.missing_timeout {
            gap.missing_requested = true;
            info!(id = gap.waiting_for.0, "changes.request_missing");
            self.effects.push(Effect::RequestMissing(gap.waiting_for));
        }
        if elapsed >= self.options.gap_timeout {
            if self.synchronizing {
                // postponed; the running sync stream may still deliver it
                gap.since = now;
            } else {
                self.skip_gap()?;
                self.refresh_gap(now);
                return Ok(self.deadline());
            }
        }
        self.gap = Some(gap);
        Ok(self.deadline())
    }

    fn deadline(&self) -> Option<Instant> {
        self.gap.map(|gap| {
            if gap.missing_requested {
                gap.since + self.options.gap_timeout
            } else {
                gap.since + self.options.missing_timeout.min(self.options.gap_timeout)
            }
        })
    }

    // Skips the whole hole below the lowest pending id.
    fn skip_gap(&mut self) -> Result<()> {
        let Some(lowest) = self.lowest_pending() else {
            return Ok(());
        };
        let first = self.commit_id.next();
        let last = ChangeId(lowest.0 - 1);
        let mut id = first;
        while id <= last {
            self.archive.push(ArchiveRecord::Skipped(id))?;
            self.skipped.insert(id);
            self.counters.skipped_with_gap += 1;
            id = id.next();
        }
        self.commit_id = last;
        self.gap = None;
        warn!(
            first = first.0,
            last = last.0,
            "changes.gap_skipped"
        );
        self.effects.push(Effect::RequestSync { first, last });
        Ok(())
    }

    /// Runs the commit loop and the timers; returns the pass report and the
    /// next timer deadline.
    pub fn tick<A>(&mut self, now: Instant, applier: &mut A) -> Result<(CommitReport, Option<Instant>)>
    where
        A: TaskApplier + ?Sized,
    {
        let mut report = self.drive_commit_loop(applier)?;
        let before = self.commit_id;
        let mut deadline = self.poll_timers(now)?;
        if self.commit_id != before {
            report.merge(self.drive_commit_loop(applier)?);
            deadline = self.poll_timers(now)?;
        }
        Ok((report, deadline))
    }

    /// Re-applies archived history starting at `from` after a restart.
    ///
    /// Applied records are handed to the applier again, skip markers are
    /// restored, and the queue is positioned after the last archived id.
    pub fn recover<A>(&mut self, from: ChangeId, applier: &mut A) -> Result<CommitReport>
    where
        A: TaskApplier + ?Sized,
    {
        let mut report = CommitReport::default();
        let mut next = from;
        loop {
            let batch = self.archive.read_from(next, RECOVER_BATCH_BYTES)?;
            let Some(last) = batch.last().map(ArchiveRecord::id) else {
                break;
            };
            for record in batch {
                match record {
                    ArchiveRecord::Applied(change) => match applier.apply(&change.payload) {
                        Ok(()) => report.applied += 1,
                        Err(err) => {
                            error!(
                                id = change.id.0,
                                error = %err,
                                payload = %hex::encode(&change.payload),
                                "changes.recover.apply_failed"
                            );
                            report.cancelled += 1;
                        }
                    },
                    ArchiveRecord::Skipped(id) => {
                        self.skipped.insert(id);
                        report.skipped += 1;
                    }
                    ArchiveRecord::Cancelled(_) => report.cancelled += 1,
                }
            }
            next = last.next();
        }
        let last = self.archive.last_id();
        if last > self.commit_id {
            self.commit_id = last;
        }
        if self.next_id <= self.commit_id {
            self.next_id = self.commit_id.next();
        }
        report.commit_id = self.commit_id;
        info!(
            from = from.0,
            applied = report.applied,
            skipped = report.skipped,
            commit_id = self.commit_id.0,
            "changes.recover"
        );
        Ok(report)
    }
}
