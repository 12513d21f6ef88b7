use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::archive::ArchiveOptions;
use crate::changes::QueueOptions;
use crate::cluster::{NodeInfo, NodeRegistry, NodeStatus};
use crate::sync::SyncOptions;
use crate::types::{NodeId, Result, TesseraError};

/// A peer listed in the node configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PeerConfig {
    /// Peer node id.
    pub id: u32,
    /// Peer availability zone.
    #[serde(default)]
    pub zone: u8,
}

/// Settings of one node, loaded from TOML.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Local node id.
    pub node_id: u32,
    /// Local availability zone.
    pub zone: u8,
    /// Directory holding archive segments.
    pub archive_dir: PathBuf,
    /// Replicas per key.
    pub redundancy: usize,
    /// Other cluster members.
    pub peers: Vec<PeerConfig>,
    /// Milliseconds a missing id may block the commit loop.
    pub gap_timeout_ms: u64,
    /// Milliseconds before a missing id is requested from a peer.
    pub missing_timeout_ms: u64,
    /// Largest accepted distance between a remote id and `next_id`.
    pub max_id_gap: u64,
    /// Bytes of records per sync part.
    pub sync_part_size: usize,
    /// Milliseconds of sync stream inactivity before giving up.
    pub sync_timeout_ms: u64,
    /// Tail length that triggers a background archive flush.
    pub archive_flush_threshold: usize,
    /// Records per segment file.
    pub max_segment_changes: usize,
    /// Bytes per segment file.
    pub max_segment_bytes: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            zone: 0,
            archive_dir: PathBuf::from("archive"),
            redundancy: 1,
            peers: Vec::new(),
            gap_timeout_ms: 42_000,
            missing_timeout_ms: 6_000,
            max_id_gap: 1_000,
            sync_part_size: 131_072,
            sync_timeout_ms: 30_000,
            archive_flush_threshold: 1_000,
            max_segment_changes: 10_000,
            max_segment_bytes: 16 * 1024 * 1024,
        }
    }
}

impl NodeConfig {
    /// Short timeouts and tiny segments for tests and local experiments.
    pub fn testing(archive_dir: impl Into<PathBuf>) -> Self {
        Self {
            archive_dir: archive_dir.into(),
            gap_timeout_ms: 2_000,
            missing_timeout_ms: 300,
            max_id_gap: 100,
            sync_part_size: 4_096,
            sync_timeout_ms: 1_000,
            archive_flush_threshold: 16,
            max_segment_changes: 64,
            max_segment_bytes: 64 * 1024,
            ..Self::default()
        }
    }

    /// Reads and validates a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|source| {
            TesseraError::Config(format!("failed to read config {}: {source}", path.display()))
        })?;
        let config: NodeConfig = toml::from_str(&contents).map_err(|source| {
            TesseraError::Config(format!(
                "failed to parse config {}: {source}",
                path.display()
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects zero timeouts, sizes and redundancy, and duplicate members.
    pub fn validate(&self) -> Result<()> {
        let checks: [(&str, bool); 9] = [
            ("redundancy", self.redundancy == 0),
            ("gap_timeout_ms", self.gap_timeout_ms == 0),
            ("missing_timeout_ms", self.missing_timeout_ms == 0),
            ("max_id_gap", self.max_id_gap == 0),
            ("sync_part_size", self.sync_part_size == 0),
            ("sync_timeout_ms", self.sync_timeout_ms == 0),
            ("archive_flush_threshold", self.archive_flush_threshold == 0),
            ("max_segment_changes", self.max_segment_changes == 0),
            ("max_segment_bytes", self.max_segment_bytes == 0),
        ];
        if let Some((field, _)) = checks.iter().find(|(_, zero)| *zero) {
            return Err(TesseraError::Config(format!("{field} must be greater than zero")));
        }
        if self.missing_timeout_ms >= self.gap_timeout_ms {
            return Err(TesseraError::Config(
                "missing_timeout_ms must be shorter than gap_timeout_ms".to_string(),
            ));
        }
        let mut ids: Vec<u32> = self.peers.iter().map(|p| p.id).collect();
        ids.push(self.node_id);
        ids.sort_unstable();
        if ids.windows(2).any(|w| w[0] == w[1]) {
            return Err(TesseraError::Config(
                "node ids must be unique across node_id and peers".to_string(),
            ));
        }
        Ok(())
    }

    /// Change queue options.
    pub fn queue_options(&self) -> QueueOptions {
        QueueOptions {
            gap_timeout: Duration::from_millis(self.gap_timeout_ms),
            missing_timeout: Duration::from_millis(self.missing_timeout_ms),
            max_id_gap: self.max_id_gap,
        }
    }

    /// Archive options.
    pub fn archive_options(&self) -> ArchiveOptions {
        ArchiveOptions {
            flush_threshold: self.archive_flush_threshold,
            max_segment_changes: self.max_segment_changes,
            max_segment_bytes: self.max_segment_bytes,
        }
    }

    /// Sync stream options.
    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            part_size: self.sync_part_size,
            timeout: Duration::from_millis(self.sync_timeout_ms),
        }
    }

    /// Registry with the local node ready and every peer offline.
    pub fn registry(&self) -> Result<NodeRegistry> {
        let this = NodeId(self.node_id);
        let mut local = NodeInfo::new(this, self.zone);
        local.status = NodeStatus::Ready;
        let mut nodes = vec![local];
        nodes.extend(
            self.peers
                .iter()
                .map(|peer| NodeInfo::new(NodeId(peer.id), peer.zone)),
        );
        NodeRegistry::with_nodes(this, nodes, self.redundancy)
    }
}

/// Default location of the node configuration file.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("tessera").join("node.toml"))
}
