use std::fmt;

use bytes::Bytes;

use crate::types::{ApplyError, ChangeId, NodeId};

/// Lifecycle of a change.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ChangeStatus {
    /// Built but not yet placed in the queue.
    Pending,
    /// Waiting in the queue for its turn.
    Queued,
    /// Handed to the task applier.
    Applying,
    /// Applied and archived.
    Applied,
    /// Discarded; the id still consumed its slot in the order.
    Cancelled,
}

impl ChangeStatus {
    /// Upper-case status name used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeStatus::Pending => "PENDING",
            ChangeStatus::Queued => "QUEUED",
            ChangeStatus::Applying => "APPLYING",
            ChangeStatus::Applied => "APPLIED",
            ChangeStatus::Cancelled => "CANCELLED",
        }
    }
}

/// One ordered mutation replicated across the cluster.
///
/// The payload is the serialized task list; it is never inspected here.
#[derive(Clone, PartialEq, Eq)]
pub struct Change {
    /// Cluster-wide id, assigned by the origin node.
    pub id: ChangeId,
    /// Node that assigned the id.
    pub origin: NodeId,
    /// Lifecycle state.
    pub status: ChangeStatus,
    /// Opaque serialized task list.
    pub payload: Bytes,
}

impl Change {
    /// Creates a change in `Pending` state.
    pub fn new(id: ChangeId, origin: NodeId, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            origin,
            status: ChangeStatus::Pending,
            payload: payload.into(),
        }
    }

    /// Same id and byte-identical payload.
    pub fn same_content(&self, other: &Change) -> bool {
        self.id == other.id && self.payload == other.payload
    }
}

impl fmt::Debug for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Change")
            .field("id", &self.id)
            .field("origin", &self.origin)
            .field("status", &self.status)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Applies a change's task list to the in-memory graph.
///
/// Called exactly once per change, in commit order, never concurrently.
pub trait TaskApplier {
    /// Applies one serialized task list.
    fn apply(&mut self, task_list: &[u8]) -> Result<(), ApplyError>;
}

impl<F> TaskApplier for F
where
    F: FnMut(&[u8]) -> Result<(), ApplyError>,
{
    fn apply(&mut self, task_list: &[u8]) -> Result<(), ApplyError> {
        self(task_list)
    }
}

/// Payload produced for a new local change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeRequest {
    /// Serialized task list.
    pub payload: Bytes,
}

/// Turns an evaluated statement's task list into a change payload.
pub trait TaskProducer {
    /// Builds the change payload; only called once quorum is confirmed.
    fn make_change(&self, task_list: &[u8]) -> ChangeRequest;
}

/// Producer that uses the task list as the payload unchanged.
#[derive(Clone, Copy, Debug, Default)]
pub struct PassthroughProducer;

impl TaskProducer for PassthroughProducer {
    fn make_change(&self, task_list: &[u8]) -> ChangeRequest {
        ChangeRequest {
            payload: Bytes::copy_from_slice(task_list),
        }
    }
}
