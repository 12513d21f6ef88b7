//! Known peers, their liveness and the quorum gate built on the lookup table.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::lookup::LookupTable;
use crate::types::{ChangeId, NodeId, Result, TesseraError};

/// Connection status of a node, ordered from least to most available.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum NodeStatus {
    /// No connection.
    Offline,
    /// Connection attempt in progress.
    Connecting,
    /// Connected but not yet authenticated.
    Connected,
    /// Node is building its initial state.
    Building,
    /// Node is shutting down.
    ShuttingDown,
    /// Node is catching up from a peer.
    Synchronizing,
    /// Node is flushing and serving catch-up requests.
    Away,
    /// Node will go away shortly.
    AwaySoon,
    /// Node accepts changes and queries.
    Ready,
}

impl NodeStatus {
    /// Live nodes count towards quorum.
    pub fn is_live(self) -> bool {
        self > NodeStatus::ShuttingDown
    }

    /// Human readable name.
    pub fn as_str(self) -> &'static str {
        match self {
            NodeStatus::Offline => "OFFLINE",
            NodeStatus::Connecting => "CONNECTING",
            NodeStatus::Connected => "CONNECTED",
            NodeStatus::Building => "BUILDING",
            NodeStatus::ShuttingDown => "SHUTTING_DOWN",
            NodeStatus::Synchronizing => "SYNCHRONIZING",
            NodeStatus::Away => "AWAY",
            NodeStatus::AwaySoon => "AWAY_SOON",
            NodeStatus::Ready => "READY",
        }
    }
}

/// What the registry knows about one node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    /// Node identifier.
    pub id: NodeId,
    /// Availability zone, used to prefer nearby peers.
    pub zone: u8,
    /// Last known status.
    pub status: NodeStatus,
    /// Highest id the node reported as committed.
    pub committed_id: ChangeId,
}

impl NodeInfo {
    /// A node in `zone` that has not connected yet.
    pub fn new(id: NodeId, zone: u8) -> Self {
        Self {
            id,
            zone,
            status: NodeStatus::Offline,
            committed_id: ChangeId(0),
        }
    }
}

/// Registry of cluster nodes including the local one.
#[derive(Clone, Debug)]
pub struct NodeRegistry {
    this: NodeId,
    redundancy: usize,
    nodes: Vec<NodeInfo>,
    lookup: LookupTable,
}

impl NodeRegistry {
    /// Creates a registry containing only the local node, marked ready.
    pub fn new(this: NodeId, zone: u8, redundancy: usize) -> Result<Self> {
        let mut local = NodeInfo::new(this, zone);
        local.status = NodeStatus::Ready;
        Self::with_nodes(this, vec![local], redundancy)
    }

    /// Creates a registry from a full node list; `this` must be listed.
    pub fn with_nodes(this: NodeId, mut nodes: Vec<NodeInfo>, redundancy: usize) -> Result<Self> {
        if redundancy == 0 {
            return Err(TesseraError::Config(
                "redundancy must be at least 1".to_string(),
            ));
        }
        if !nodes.iter().any(|n| n.id == this) {
            return Err(TesseraError::Config(format!(
                "local {this} missing from node list"
            )));
        }
        nodes.sort_by_key(|n| n.id);
        let lookup = Self::build_lookup(&nodes, redundancy)?;
        Ok(Self {
            this,
            redundancy,
            nodes,
            lookup,
        })
    }

    // Redundancy is capped to the node count while the cluster is smaller
    // than the configured replica count.
    fn build_lookup(nodes: &[NodeInfo], redundancy: usize) -> Result<LookupTable> {
        let ids: Vec<NodeId> = nodes.iter().map(|n| n.id).collect();
        LookupTable::build(&ids, redundancy.min(ids.len()))
    }

    /// Id of the local node.
    pub fn this_id(&self) -> NodeId {
        self.this
    }

    /// Current lookup table.
    pub fn lookup(&self) -> &LookupTable {
        &self.lookup
    }

    /// All nodes ordered by id.
    pub fn nodes(&self) -> &[NodeInfo] {
        &self.nodes
    }

    /// Nodes other than the local one.
    pub fn peers(&self) -> impl Iterator<Item = &NodeInfo> {
        let this = self.this;
        self.nodes.iter().filter(move |n| n.id != this)
    }

    /// Looks up a node by id.
    pub fn node(&self, id: NodeId) -> Option<&NodeInfo> {
        self.nodes.iter().find(|n| n.id == id)
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut NodeInfo> {
        self.nodes.iter_mut().find(|n| n.id == id)
    }

    /// Adds a node and rebuilds the lookup table.
    pub fn add_node(&mut self, info: NodeInfo) -> Result<()> {
        if self.node(info.id).is_some() {
            return Err(TesseraError::Config(format!(
                "{} already registered",
                info.id
            )));
        }
        let mut nodes = self.nodes.clone();
        nodes.push(info);
        nodes.sort_by_key(|n| n.id);
        self.lookup = Self::build_lookup(&nodes, self.redundancy)?;
        self.nodes = nodes;
        info!(
            nodes = self.nodes.len(),
            quorum = self.quorum_size(),
            "registry.node_added"
        );
        Ok(())
    }

    /// Removes a peer and rebuilds the lookup table.
    pub fn remove_node(&mut self, id: NodeId) -> Result<()> {
        if id == self.this {
            return Err(TesseraError::Invalid("cannot remove the local node"));
        }
        let nodes: Vec<NodeInfo> = self.nodes.iter().filter(|n| n.id != id).cloned().collect();
        if nodes.len() == self.nodes.len() {
            return Err(TesseraError::Config(format!("{id} is not registered")));
        }
        self.lookup = Self::build_lookup(&nodes, self.redundancy)?;
        self.nodes = nodes;
        info!(%id, nodes = self.nodes.len(), "registry.node_removed");
        Ok(())
    }

    /// Updates a node status; returns false for unknown nodes.
    pub fn set_status(&mut self, id: NodeId, status: NodeStatus) -> bool {
        match self.node_mut(id) {
            Some(node) => {
                if node.status != status {
                    debug!(
                        %id,
                        from = node.status.as_str(),
                        to = status.as_str(),
                        "registry.status"
                    );
                    node.status = status;
                }
                true
            }
            None => false,
        }
    }

    /// Records the committed id a node reported.
    pub fn set_committed(&mut self, id: NodeId, committed: ChangeId) -> bool {
        match self.node_mut(id) {
            Some(node) => {
                node.committed_id = committed;
                true
            }
            None => false,
        }
    }

    /// Live nodes including the local one.
    pub fn live_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.status.is_live()).count()
    }

    /// Live nodes required for quorum.
    pub fn quorum_size(&self) -> usize {
        self.lookup.quorum()
    }

    /// True when enough nodes are live to accept new changes.
    pub fn has_quorum(&self) -> bool {
        self.lookup.has_quorum(self.live_count())
    }

    /// Errors with `NotQuorum` when quorum is not reached.
    pub fn require_quorum(&self) -> Result<()> {
        if self.has_quorum() {
            Ok(())
        } else {
            Err(TesseraError::NotQuorum {
                live: self.live_count(),
                required: self.quorum_size(),
            })
        }
    }

    /// Picks a random ready peer, preferring the local zone.
    pub fn random_ready_peer<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<NodeId> {
        let zone = self.node(self.this).map(|n| n.zone);
        let ready: Vec<&NodeInfo> = self
            .peers()
            .filter(|n| n.status == NodeStatus::Ready)
            .collect();
        let same_zone: Vec<&NodeInfo> = ready
            .iter()
            .copied()
            .filter(|n| Some(n.zone) == zone)
            .collect();
        let pool = if same_zone.is_empty() { &ready } else { &same_zone };
        pool.choose(rng).map(|n| n.id)
    }

    /// True when at least one peer is ready to serve requests.
    pub fn has_ready_peer(&self) -> bool {
        self.peers().any(|n| n.status == NodeStatus::Ready)
    }

    /// Peers a change should be broadcast to.
    pub fn broadcast_targets(&self) -> Vec<NodeId> {
        self.peers()
            .filter(|n| n.status >= NodeStatus::Synchronizing)
            .map(|n| n.id)
            .collect()
    }

    /// Lowest committed id over all nodes; archive history above it must stay.
    pub fn lowest_committed_id(&self) -> ChangeId {
        self.nodes
            .iter()
            .map(|n| n.committed_id)
            .min()
            .unwrap_or_default()
    }

    /// Refuses to add a node while too many nodes are disconnected to keep
    /// quorum should the new node fail to connect.
    pub fn check_add(&self) -> Result<()> {
        let n = self.nodes.len();
        let mut may_skip = if n >= 4 { n / 2 - 1 } else { 0 };
        for node in &self.nodes {
            if node.status <= NodeStatus::Connected {
                if may_skip == 0 {
                    return Err(TesseraError::Config(format!(
                        "wait for a connection to {} before adding a new node; current status: {}",
                        node.id,
                        node.status.as_str()
                    )));
                }
                may_skip -= 1;
            }
        }
        Ok(())
    }
}
