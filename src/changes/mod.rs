#![forbid(unsafe_code)]

//! Ordering, gap handling and in-order application of changes.

mod change;
mod counters;
/// The change queue state machine and commit loop.
pub mod queue;

pub use change::{
    Change, ChangeRequest, ChangeStatus, PassthroughProducer, TaskApplier, TaskProducer,
};
pub use counters::ChangeCounters;
pub use queue::{ChangeQueue, CommitReport, Effect, QueueOptions, Received};
