#![forbid(unsafe_code)]

//! Cluster membership: the lookup/quorum table and the node registry.

/// Deterministic key assignment and quorum arithmetic.
pub mod lookup;
/// Peer liveness tracking.
pub mod registry;

pub use lookup::LookupTable;
pub use registry::{NodeInfo, NodeRegistry, NodeStatus};
