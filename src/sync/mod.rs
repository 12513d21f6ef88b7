#![forbid(unsafe_code)]

//! Catch-up streams replaying archived history to a lagging node.
//!
//! The responder sends one bounded part at a time and waits for the
//! requester's acknowledgement before reading the next one, so either side
//! can abort between parts. The requester feeds every record back into its
//! change queue, which is idempotent on ids it already holds.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::archive::{Archive, ArchiveRecord};
use crate::changes::ChangeQueue;
use crate::proto::{Package, SyncPart};
use crate::types::{ChangeId, NodeId, Result, TesseraError, TimeoutKind};

/// Sync stream tuning.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncOptions {
    /// Upper bound of encoded record bytes per part.
    pub part_size: usize,
    /// Inactivity after which a requester gives up on a stream.
    pub timeout: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            part_size: 131_072,
            timeout: Duration::from_millis(30_000),
        }
    }
}

struct OutboundStream {
    next_id: ChangeId,
    parts_sent: u64,
}

/// Serves catch-up streams from the local archive.
pub struct SyncResponder {
    archive: Archive,
    part_size: usize,
    streams: HashMap<NodeId, OutboundStream>,
}

impl SyncResponder {
    /// Creates a responder reading from `archive`.
    pub fn new(archive: Archive, options: SyncOptions) -> Self {
        Self {
            archive,
            part_size: options.part_size.max(1),
            streams: HashMap::new(),
        }
    }

    /// Opens a stream for `peer` starting at `first_id` and returns the first
    /// package to send.
    ///
    /// Fails with `HistoryTruncated` when the archive starts above `first_id`.
    pub fn start(&mut self, peer: NodeId, first_id: ChangeId) -> Result<Package> {
        let first_available = self.archive.first_id();
        if first_id < first_available {
            self.streams.remove(&peer);
            warn!(
                %peer,
                requested = first_id.0,
                first_available = first_available.0,
                "sync.responder.truncated"
            );
            return Err(TesseraError::HistoryTruncated {
                requested: first_id,
                first_available,
            });
        }
        info!(%peer, first_id = first_id.0, "sync.responder.start");
        self.streams.insert(
            peer,
            OutboundStream {
                next_id: first_id,
                parts_sent: 0,
            },
        );
        self.next_part(peer)
    }

    /// Handles an acknowledgement; returns the next part, if the stream is
    /// still open.
    pub fn on_ack(&mut self, peer: NodeId, next_id: ChangeId) -> Result<Option<Package>> {
        match self.streams.get_mut(&peer) {
            Some(stream) => stream.next_id = next_id,
            None => return Ok(None),
        }
        self.next_part(peer).map(Some)
    }

    /// Drops the stream for `peer`; returns whether one was open.
    pub fn abort(&mut self, peer: NodeId) -> bool {
        let open = self.streams.remove(&peer).is_some();
        if open {
            info!(%peer, "sync.responder.abort");
        }
        open
    }

    /// Number of open outbound streams.
    pub fn active(&self) -> usize {
        self.streams.len()
    }

    fn next_part(&mut self, peer: NodeId) -> Result<Package> {
        let Some(stream) = self.streams.get_mut(&peer) else {
            return Err(TesseraError::Invalid("no sync stream for peer"));
        };
        let records = match self.archive.read_from(stream.next_id, self.part_size) {
            Ok(records) => records,
            Err(err) => {
                self.streams.remove(&peer);
                return Err(err);
            }
        };
        let (Some(first), Some(last)) = (
            records.first().map(ArchiveRecord::id),
            records.last().map(ArchiveRecord::id),
        ) else {
            self.streams.remove(&peer);
            let last_id = self.archive.last_id();
            info!(%peer, last_id = last_id.0, "sync.responder.done");
            return Ok(Package::SyncDone { last_id });
        };
        let more = last < self.archive.last_id();
        stream.next_id = last.next();
        stream.parts_sent += 1;
        debug!(
            %peer,
            first = first.0,
            last = last.0,
            records = records.len(),
            more,
            part = stream.parts_sent,
            "sync.part"
        );
        if !more {
            self.streams.remove(&peer);
        }
        Ok(Package::SyncPart(SyncPart {
            first,
            last,
            more,
            records,
        }))
    }
}

/// Requester side of a stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SyncState {
    /// No stream was ever started.
    Idle,
    /// Request sent, waiting for the first part.
    Requested {
        /// First id asked for.
        first_id: ChangeId,
    },
    /// At least one part arrived.
    Streaming {
        /// First id of the latest part.
        first: ChangeId,
        /// Last id of the latest part.
        last: ChangeId,
    },
    /// The responder had nothing more to send.
    Done,
    /// The stream ended early; the rest must be requested again.
    Failed,
}

/// Result of handling a sync package on the requester side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Send this acknowledgement back to the responder.
    Ack(Package),
    /// Stream finished.
    Done {
        /// Last id the responder reported or sent.
        last_id: ChangeId,
    },
    /// History is gone on the responder; a full snapshot transfer is needed
    /// before incremental sync can resume.
    NeedsSnapshot {
        /// First id that was requested.
        requested: ChangeId,
        /// Oldest id the responder still holds.
        first_available: ChangeId,
    },
    /// The responder aborted the stream.
    Aborted,
    /// Package did not belong to the current stream.
    Ignored,
}

/// Drives one inbound catch-up stream at a time.
pub struct SyncRequester {
    options: SyncOptions,
    state: SyncState,
    peer: Option<NodeId>,
    last_activity: Option<Instant>,
    received: u64,
}

impl SyncRequester {
    /// Creates an idle requester.
    pub fn new(options: SyncOptions) -> Self {
        Self {
            options,
            state: SyncState::Idle,
            peer: None,
            last_activity: None,
            received: 0,
        }
    }

    /// Current state.
    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Peer serving the current or last stream.
    pub fn peer(&self) -> Option<NodeId> {
        self.peer
    }

    /// Records received over the lifetime of the requester.
    pub fn received(&self) -> u64 {
        self.received
    }

    /// True while waiting for or receiving parts.
    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            SyncState::Requested { .. } | SyncState::Streaming { .. }
        )
    }

    /// Starts a stream from `peer`; returns the request to send.
    pub fn start(&mut self, peer: NodeId, first_id: ChangeId, now: Instant) -> Package {
        info!(%peer, first_id = first_id.0, "sync.requester.start");
        self.state = SyncState::Requested { first_id };
        self.peer = Some(peer);
        self.last_activity = Some(now);
        Package::SyncRequest { first_id }
    }

    fn owns(&self, from: NodeId) -> bool {
        self.is_active() && self.peer == Some(from)
    }

    /// Feeds one part into `queue` and returns the acknowledgement.
    ///
    /// Records already fed stay valid if the stream fails later.
    pub fn on_part(
        &mut self,
        from: NodeId,
        part: SyncPart,
        queue: &mut ChangeQueue,
        now: Instant,
    ) -> Result<SyncOutcome> {
        if !self.owns(from) {
            debug!(%from, "sync.requester.ignored_part");
            return Ok(SyncOutcome::Ignored);
        }
        self.last_activity = Some(now);
        let SyncPart {
            first,
            last,
            more,
            records,
        } = part;
        for record in records {
            let fed = match record {
                ArchiveRecord::Applied(change) => queue.receive_remote_change(change),
                // the responder's applier rejected it; the id is still consumed
                ArchiveRecord::Skipped(id) | ArchiveRecord::Cancelled(id) => {
                    queue.receive_remote_skip(id)
                }
            };
            if let Err(err) = fed {
                self.state = SyncState::Failed;
                warn!(%from, error = %err, "sync.requester.failed");
                return Err(err);
            }
            self.received += 1;
        }
        self.state = SyncState::Streaming { first, last };
        if more {
            Ok(SyncOutcome::Ack(Package::SyncPartAck {
                next_id: last.next(),
            }))
        } else {
            self.state = SyncState::Done;
            info!(%from, last_id = last.0, "sync.requester.done");
            Ok(SyncOutcome::Done { last_id: last })
        }
    }

    /// Handles `SyncDone`.
    pub fn on_done(&mut self, from: NodeId, last_id: ChangeId) -> SyncOutcome {
        if !self.owns(from) {
            return SyncOutcome::Ignored;
        }
        self.state = SyncState::Done;
        info!(%from, last_id = last_id.0, "sync.requester.done");
        SyncOutcome::Done { last_id }
    }

    /// Handles `SyncTruncated`.
    pub fn on_truncated(
        &mut self,
        from: NodeId,
        requested: ChangeId,
        first_available: ChangeId,
    ) -> SyncOutcome {
        if !self.owns(from) {
            return SyncOutcome::Ignored;
        }
        self.state = SyncState::Failed;
        warn!(
            %from,
            requested = requested.0,
            first_available = first_available.0,
            "sync.requester.needs_snapshot"
        );
        SyncOutcome::NeedsSnapshot {
            requested,
            first_available,
        }
    }

    /// Handles `SyncAbort` from the responder.
    pub fn on_abort(&mut self, from: NodeId) -> SyncOutcome {
        if !self.owns(from) {
            return SyncOutcome::Ignored;
        }
        self.state = SyncState::Failed;
        info!(%from, "sync.requester.aborted");
        SyncOutcome::Aborted
    }

    /// Cancels the local stream; returns the peer and the abort to send.
    pub fn abort(&mut self) -> Option<(NodeId, Package)> {
        if !self.is_active() {
            return None;
        }
        self.state = SyncState::Failed;
        self.peer.map(|peer| (peer, Package::SyncAbort))
    }

    /// Checks the inactivity timeout; returns the next deadline.
    pub fn poll(&mut self, now: Instant) -> Result<Option<Instant>> {
        if !self.is_active() {
            return Ok(None);
        }
        let Some(since) = self.last_activity else {
            return Ok(None);
        };
        let deadline = since + self.options.timeout;
        if now >= deadline {
            self.state = SyncState::Failed;
            warn!(peer = ?self.peer, "sync.requester.timeout");
            return Err(TesseraError::Timeout(TimeoutKind::SyncStream));
        }
        Ok(Some(deadline))
    }
}
