//! Agent Configuration
//!
//! Plain configuration structs consumed by the library components. The
//! binary fills them from command-line arguments; tests build them directly.

use crate::crd::labels;
use crate::retry::RetryPolicy;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

// =============================================================================
// Constants
// =============================================================================

/// Smallest device the agent will offer for provisioning (16 MiB)
pub const MIN_SUPPORTED_DEVICE_SIZE: u64 = 16 * 1024 * 1024;

/// Directory under which the agent mounts the drives it owns
pub const DEFAULT_MOUNT_ROOT: &str = "/var/lib/direct-storage/mnt";

// =============================================================================
// Listener Configuration
// =============================================================================

/// Configuration for the uevent listener
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Number of worker tasks handling events
    pub threadiness: usize,
    /// Capacity of the event queue between reader and workers
    pub queue_capacity: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            threadiness: 4,
            queue_capacity: 1000,
        }
    }
}

// =============================================================================
// Probe Configuration
// =============================================================================

/// Host paths consulted when building device snapshots
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Path to sysfs (for testing)
    pub sysfs_path: PathBuf,
    /// Directory holding udev's per-device property records
    pub udev_data_path: PathBuf,
    /// Path to procfs (for testing)
    pub proc_path: PathBuf,
    /// Path to the device directory (for testing)
    pub dev_path: PathBuf,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            sysfs_path: PathBuf::from("/sys"),
            udev_data_path: PathBuf::from("/run/udev/data"),
            proc_path: PathBuf::from("/proc"),
            dev_path: PathBuf::from("/dev"),
        }
    }
}

// =============================================================================
// Reconciler Configuration
// =============================================================================

/// Policy inputs of the drive reconciler
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Node the agent runs on
    pub node_id: String,
    /// Topology segments stamped onto new drives
    pub topology: BTreeMap<String, String>,
    /// Mount root; an owned drive is mounted at `<mount_root>/<fs uuid>`
    /// and any mount below it does not make a drive unavailable
    pub mount_root: PathBuf,
    /// Devices smaller than this are unavailable
    pub min_drive_size: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            topology: BTreeMap::new(),
            mount_root: PathBuf::from(DEFAULT_MOUNT_ROOT),
            min_drive_size: MIN_SUPPORTED_DEVICE_SIZE,
        }
    }
}

impl ReconcilerConfig {
    /// Reconciler configuration for a node with the given topology
    pub fn for_node(node_id: impl Into<String>, topology: BTreeMap<String, String>) -> Self {
        Self {
            node_id: node_id.into(),
            topology,
            ..Default::default()
        }
    }
}

// =============================================================================
// Agent Configuration
// =============================================================================

/// Complete agent configuration
#[derive(Debug, Clone, Default)]
pub struct AgentConfig {
    pub listener: ListenerConfig,
    pub probe: ProbeConfig,
    pub reconciler: ReconcilerConfig,
    pub retry: RetryPolicy,
    /// Interval between full device resyncs, `None` to disable
    pub resync_interval: Option<Duration>,
}

impl AgentConfig {
    /// Node the agent runs on
    pub fn node_id(&self) -> &str {
        &self.reconciler.node_id
    }
}

/// Build the topology map recorded on drives of this node
///
/// Empty segments are omitted; the node segment is always present.
pub fn build_topology(
    identity: &str,
    rack: &str,
    zone: &str,
    region: &str,
    node_id: &str,
) -> BTreeMap<String, String> {
    let mut topology = BTreeMap::new();
    for (key, value) in [
        (labels::TOPOLOGY_IDENTITY, identity),
        (labels::TOPOLOGY_RACK, rack),
        (labels::TOPOLOGY_ZONE, zone),
        (labels::TOPOLOGY_REGION, region),
    ] {
        if !value.is_empty() {
            topology.insert(key.to_string(), value.to_string());
        }
    }
    topology.insert(labels::TOPOLOGY_NODE.to_string(), node_id.to_string());
    topology
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.listener.threadiness, 4);
        assert_eq!(config.listener.queue_capacity, 1000);
        assert_eq!(config.reconciler.min_drive_size, 16 * 1024 * 1024);
        assert_eq!(config.reconciler.mount_root, PathBuf::from(DEFAULT_MOUNT_ROOT));
        assert_eq!(config.retry.max_attempts, 5);
    }

    #[test]
    fn test_build_topology() {
        let topology = build_topology("das", "", "zone-a", "", "node-1");
        assert_eq!(topology.len(), 3);
        assert_eq!(topology[labels::TOPOLOGY_NODE], "node-1");
        assert_eq!(topology[labels::TOPOLOGY_ZONE], "zone-a");
        assert!(!topology.contains_key(labels::TOPOLOGY_RACK));
    }
}
