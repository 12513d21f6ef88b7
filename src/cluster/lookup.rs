//! Deterministic key-to-node assignment and quorum arithmetic.

use xxhash_rust::xxh64::xxh64;

use crate::types::{NodeId, Result, TesseraError};

const KEY_HASH_SEED: u64 = 0;

/// Immutable assignment table for a fixed `(n, r)` pair.
///
/// The table has one slot per node. A key is hashed onto a slot and the slot
/// lists the `r` node indices responsible for it. Every node index appears in
/// exactly `r` slots, so assignments stay balanced over any run of `n`
/// consecutive slots. The table is rebuilt, never mutated, when the node list
/// changes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LookupTable {
    nodes: Vec<NodeId>,
    redundancy: usize,
    slots: Vec<usize>,
}

impl LookupTable {
    /// Builds the table for an ordered node list and redundancy `r`.
    pub fn build(nodes: &[NodeId], redundancy: usize) -> Result<Self> {
        let n = nodes.len();
        if redundancy == 0 {
            return Err(TesseraError::Config(
                "redundancy must be at least 1".to_string(),
            ));
        }
        if redundancy > n {
            return Err(TesseraError::Config(format!(
                "redundancy {redundancy} exceeds node count {n}"
            )));
        }
        for (idx, node) in nodes.iter().enumerate() {
            if nodes[..idx].contains(node) {
                return Err(TesseraError::Config(format!(
                    "{node} listed more than once"
                )));
            }
        }
        let mut slots = Vec::with_capacity(n * redundancy);
        for slot in 0..n {
            let start = slots.len();
            for p in 0..redundancy {
                slots.push((n - slot + p) % n);
            }
            // lower node index first within a slot
            slots[start..].sort_unstable();
        }
        Ok(Self {
            nodes: nodes.to_vec(),
            redundancy,
            slots,
        })
    }

    /// Number of nodes `n`.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Replicas per key `r`.
    pub fn redundancy(&self) -> usize {
        self.redundancy
    }

    /// Ordered node list the table was built from.
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    /// Live nodes required for quorum: `floor(n/2) + 1`.
    pub fn quorum(&self) -> usize {
        self.nodes.len() / 2 + 1
    }

    /// True iff `live_node_count` reaches quorum.
    pub fn has_quorum(&self, live_node_count: usize) -> bool {
        live_node_count >= self.quorum()
    }

    /// Node indices assigned to a numeric key (e.g. a thing id).
    pub fn assign_id(&self, id: u64) -> &[usize] {
        let slot = (id % self.nodes.len() as u64) as usize;
        self.slot(slot)
    }

    /// Node indices assigned to an arbitrary byte key.
    pub fn assign(&self, key: &[u8]) -> &[usize] {
        self.assign_id(xxh64(key, KEY_HASH_SEED))
    }

    /// Node ids assigned to an arbitrary byte key.
    pub fn assign_nodes(&self, key: &[u8]) -> Vec<NodeId> {
        self.assign(key).iter().map(|&idx| self.nodes[idx]).collect()
    }

    /// True when `node` is one of the replicas for `id`.
    pub fn node_has_id(&self, node: NodeId, id: u64) -> bool {
        self.assign_id(id)
            .iter()
            .any(|&idx| self.nodes[idx] == node)
    }

    /// Node indices of one slot.
    pub fn slot(&self, slot: usize) -> &[usize] {
        let start = slot * self.redundancy;
        &self.slots[start..start + self.redundancy]
    }

    /// Iterates over all slots in order.
    pub fn slots(&self) -> impl Iterator<Item = &[usize]> {
        self.slots.chunks(self.redundancy)
    }
}
