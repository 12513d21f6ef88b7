#![forbid(unsafe_code)]

//! Node assembly: configuration, health reporting and the event loop.

/// Node configuration file and derived options.
pub mod config;
/// Health snapshot.
pub mod health;
/// Event loop and its handle.
pub mod service;

pub use config::{default_config_path, NodeConfig, PeerConfig};
pub use health::{Check, ClusterHealth, HealthStatus};
pub use service::{ChangeQueueService, ServiceHandle};
