#![forbid(unsafe_code)]

//! Identifiers and the error taxonomy shared by every component.

use std::fmt;

/// Checksum helpers used by the archive segment format.
pub mod checksum;

pub use checksum::{Checksum, Crc32Fast};

/// Cluster-wide monotonic identifier of a change.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct ChangeId(pub u64);

impl ChangeId {
    /// Returns the id directly following this one.
    ///
    /// Ids read from disk go through [`ChangeId::checked_next`] first, so
    /// every id reaching this call has a successor.
    pub const fn next(self) -> Self {
        ChangeId(self.0 + 1)
    }

    /// The following id, or `None` at the end of the id space.
    pub const fn checked_next(self) -> Option<Self> {
        match self.0.checked_add(1) {
            Some(id) => Some(ChangeId(id)),
            None => None,
        }
    }
}

impl fmt::Display for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "change:{}", self.0)
    }
}

/// Identifier of a cluster node.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node:{}", self.0)
    }
}

impl From<u32> for NodeId {
    fn from(value: u32) -> Self {
        NodeId(value)
    }
}

/// Which timed operation expired.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TimeoutKind {
    /// A missing change id was not received in time.
    MissingChange,
    /// A synchronization stream stalled.
    SyncStream,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutKind::MissingChange => f.write_str("missing change"),
            TimeoutKind::SyncStream => f.write_str("sync stream"),
        }
    }
}

/// Failure reported by the task applier for a single change.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("task application failed: {0}")]
pub struct ApplyError(pub String);

impl ApplyError {
    /// Creates an apply error from any message.
    pub fn new(msg: impl Into<String>) -> Self {
        ApplyError(msg.into())
    }
}

/// Errors produced by the change pipeline.
#[derive(thiserror::Error, Debug)]
pub enum TesseraError {
    /// Underlying I/O failure.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// On-disk data failed validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Bad node count, redundancy or configuration file.
    #[error("configuration error: {0}")]
    Config(String),
    /// Not enough nodes online to accept new changes.
    #[error("not enough nodes online: {live} live, at least {required} required")]
    NotQuorum {
        /// Number of live nodes including this one.
        live: usize,
        /// Number of live nodes required.
        required: usize,
    },
    /// The same id carries two different payloads (split brain).
    #[error("{id} from {origin} conflicts with the copy from {existing_origin}")]
    DuplicateId {
        /// Conflicting change id.
        id: ChangeId,
        /// Origin of the rejected copy.
        origin: NodeId,
        /// Origin of the copy already held.
        existing_origin: NodeId,
    },
    /// The task applier rejected a change.
    #[error(transparent)]
    Apply(#[from] ApplyError),
    /// The archive no longer holds the requested history.
    #[error("history truncated: requested {requested}, archive starts at {first_available}")]
    HistoryTruncated {
        /// First id that was requested.
        requested: ChangeId,
        /// Oldest id the archive can still serve.
        first_available: ChangeId,
    },
    /// A timed operation expired.
    #[error("timeout waiting for {0}")]
    Timeout(TimeoutKind),
    /// A remote id is too far ahead of the local sequence.
    #[error("{id} is too far ahead of the next expected id {next_id}")]
    GapTooLarge {
        /// Received id.
        id: ChangeId,
        /// Locally expected next id.
        next_id: ChangeId,
    },
    /// The service has shut down.
    #[error("change service closed")]
    Closed,
}

impl TesseraError {
    /// Faults an operator must look at; the node never resolves these itself.
    pub fn is_operator_fault(&self) -> bool {
        matches!(
            self,
            TesseraError::DuplicateId { .. } | TesseraError::Config(_)
        )
    }

    /// Faults recovered locally without aborting the node.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TesseraError::Apply(_) | TesseraError::Timeout(_))
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TesseraError>;
