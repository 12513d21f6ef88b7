//! Tessera: ordered change replication for a small cluster of nodes.
//!
//! Every node applies the same changes in the same id order. Changes are
//! created on any node while a quorum is live, broadcast to peers, drained
//! by the commit loop in strict id order and appended to an on-disk archive
//! that lagging nodes stream from to catch up.
//!
//! * [`changes`] holds the change queue and its commit loop.
//! * [`cluster`] holds the lookup table and the node registry.
//! * [`archive`] is the segmented change log.
//! * [`sync`] streams archive ranges between nodes.
//! * [`proto`] defines the wire packages and the transport seam.
//! * [`node`] wires everything into a single event loop.

#![warn(missing_docs)]

pub mod archive;
pub mod changes;
pub mod cluster;
pub mod node;
pub mod primitives;
pub mod proto;
pub mod sync;
pub mod types;

pub use types::{ChangeId, NodeId, Result, TesseraError};
