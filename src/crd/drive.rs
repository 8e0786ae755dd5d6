//! Drive CRD
//!
//! Represents one managed block device on a node: the identity it was
//! discovered with, its observed state and the capacity carved out of it
//! by volumes.

use super::labels;
use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Drive CRD
// =============================================================================

/// Drive pins a discovered block device to its node.
///
/// [`DriveSpec`] holds node affinity and topology, fixed at creation; everything
/// observed from the kernel lives in [`DriveStatus`].
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "direct.storage.io",
    version = "v1",
    kind = "Drive",
    plural = "drives",
    shortname = "drv",
    status = "DriveStatus",
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".spec.nodeName"}"#,
    printcolumn = r#"{"name": "Path", "type": "string", "jsonPath": ".status.path"}"#,
    printcolumn = r#"{"name": "Status", "type": "string", "jsonPath": ".status.driveStatus"}"#,
    printcolumn = r#"{"name": "Free", "type": "integer", "jsonPath": ".status.freeCapacity"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DriveSpec {
    /// Node the drive is attached to
    pub node_name: String,

    /// Topology segments (identity, rack, zone, region, node)
    #[serde(default)]
    pub topology: BTreeMap<String, String>,
}

// =============================================================================
// Drive State
// =============================================================================

/// Lifecycle state of a drive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum DriveState {
    #[default]
    Available,
    Unavailable,
    InUse,
    Ready,
    Terminating,
}

impl DriveState {
    /// Whether the drive is owned by the agent (formatted, mounted or draining)
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            DriveState::InUse | DriveState::Ready | DriveState::Terminating
        )
    }
}

impl std::fmt::Display for DriveState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriveState::Available => write!(f, "Available"),
            DriveState::Unavailable => write!(f, "Unavailable"),
            DriveState::InUse => write!(f, "InUse"),
            DriveState::Ready => write!(f, "Ready"),
            DriveState::Terminating => write!(f, "Terminating"),
        }
    }
}

// =============================================================================
// Status
// =============================================================================

/// Observed state of a drive
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DriveStatus {
    /// Device path (always `/dev/<name>`)
    #[serde(default)]
    pub path: String,

    /// Kernel device name
    #[serde(default)]
    pub root_partition: String,

    #[serde(default)]
    pub major_number: u32,

    #[serde(default)]
    pub minor_number: u32,

    /// Partition number, 0 for whole disks
    #[serde(default)]
    pub partition_num: u32,

    #[serde(default)]
    pub drive_status: DriveState,

    // Capacity accounting
    #[serde(default)]
    pub total_capacity: u64,

    #[serde(default)]
    pub allocated_capacity: u64,

    #[serde(default)]
    pub free_capacity: u64,

    #[serde(default)]
    pub logical_block_size: u64,

    #[serde(default)]
    pub physical_block_size: u64,

    // Filesystem
    #[serde(default)]
    pub filesystem: String,

    /// Filesystem UUID as probed from the device
    #[serde(default)]
    pub filesystem_uuid: String,

    /// Filesystem UUID as reported by the uevent
    #[serde(default)]
    pub uevent_fs_uuid: String,

    #[serde(default)]
    pub mountpoint: String,

    #[serde(default)]
    pub mount_options: Vec<String>,

    // Hardware identity
    #[serde(default)]
    pub model_number: String,

    #[serde(default)]
    pub serial_number: String,

    #[serde(default)]
    pub uevent_serial: String,

    #[serde(default)]
    pub wwid: String,

    #[serde(default)]
    pub vendor: String,

    // Software identity
    #[serde(default)]
    pub dm_name: String,

    #[serde(default)]
    pub dm_uuid: String,

    #[serde(default)]
    pub md_uuid: String,

    #[serde(default)]
    pub part_table_uuid: String,

    #[serde(default)]
    pub part_table_type: String,

    #[serde(default)]
    pub partition_uuid: String,

    // Flags
    #[serde(default, rename = "virtual")]
    pub is_virtual: bool,

    #[serde(default)]
    pub read_only: bool,

    #[serde(default)]
    pub partitioned: bool,

    #[serde(default)]
    pub swap_on: bool,

    /// Device this drive is a member of (device-mapper/raid holder)
    #[serde(default)]
    pub master: String,

    /// Anomalies detected during reconciliation
    #[serde(default)]
    pub conditions: Vec<DriveCondition>,

    /// Volumes whose capacity is already back on the drive while their
    /// drive finalizer may still be present
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub released_volumes: Vec<ReleasedVolume>,
}

/// Capacity release recorded ahead of the finalizer removal
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReleasedVolume {
    pub name: String,
    /// Distinguishes a re-created volume of the same name
    #[serde(default)]
    pub uid: String,
}

/// Drive condition recording an observation that needs operator attention
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DriveCondition {
    /// Type of condition
    pub r#type: String,
    /// Status: True, False, Unknown
    pub status: String,
    /// Last transition time
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_transition_time: Option<DateTime<Utc>>,
    /// Reason
    #[serde(default)]
    pub reason: Option<String>,
    /// Message
    #[serde(default)]
    pub message: Option<String>,
}

impl DriveCondition {
    /// Build a `True` condition stamped with the current time
    pub fn new(r#type: &str, reason: &str, message: impl Into<String>) -> Self {
        Self {
            r#type: r#type.to_string(),
            status: "True".to_string(),
            last_transition_time: Some(Utc::now()),
            reason: Some(reason.to_string()),
            message: Some(message.into()),
        }
    }
}

impl DriveStatus {
    /// Set a condition, returning whether anything changed
    ///
    /// Conditions are keyed by type and reason; an existing entry with the
    /// same status and message is left untouched, timestamp included.
    pub fn set_condition(&mut self, condition: DriveCondition) -> bool {
        if let Some(existing) = self
            .conditions
            .iter_mut()
            .find(|c| c.r#type == condition.r#type && c.reason == condition.reason)
        {
            if existing.status == condition.status && existing.message == condition.message {
                return false;
            }
            *existing = condition;
        } else {
            self.conditions.push(condition);
        }
        true
    }

    /// Recompute free capacity, clamping allocation to the total
    pub fn update_capacity(&mut self, total: u64) {
        self.total_capacity = total;
        if self.allocated_capacity > self.total_capacity {
            self.allocated_capacity = self.total_capacity;
        }
        self.free_capacity = self.total_capacity - self.allocated_capacity;
    }
}

// =============================================================================
// Implementations
// =============================================================================

impl Drive {
    /// Resource name
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    /// Finalizers currently set on the drive
    pub fn finalizers(&self) -> &[String] {
        self.metadata.finalizers.as_deref().unwrap_or_default()
    }

    /// Names of the volumes allocated on this drive
    pub fn volume_names(&self) -> Vec<String> {
        labels::volume_names(self.finalizers())
            .map(str::to_string)
            .collect()
    }

    /// Whether the drive records `volume_name` as allocated on it
    pub fn holds_volume(&self, volume_name: &str) -> bool {
        let finalizer = labels::volume_finalizer(volume_name);
        self.finalizers().iter().any(|f| *f == finalizer)
    }

    /// Set a label, returning whether the value changed
    pub fn set_label(&mut self, key: &str, value: impl Into<String>) -> bool {
        let value = value.into();
        let labels = self.metadata.labels.get_or_insert_with(BTreeMap::new);
        if labels.get(key) == Some(&value) {
            return false;
        }
        labels.insert(key.to_string(), value);
        true
    }

    /// Current drive state, `Available` when no status is recorded yet
    pub fn state(&self) -> DriveState {
        self.status
            .as_ref()
            .map(|s| s.drive_status)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::labels::{volume_finalizer, DRIVE_FINALIZER_DATA_PROTECTION};

    #[test]
    fn test_drive_state_active() {
        assert!(DriveState::InUse.is_active());
        assert!(DriveState::Ready.is_active());
        assert!(DriveState::Terminating.is_active());
        assert!(!DriveState::Available.is_active());
        assert!(!DriveState::Unavailable.is_active());
        assert_eq!(format!("{}", DriveState::InUse), "InUse");
    }

    #[test]
    fn test_volume_relation() {
        let mut drive = Drive::new("d1", DriveSpec::default());
        drive.metadata.finalizers = Some(vec![
            DRIVE_FINALIZER_DATA_PROTECTION.to_string(),
            volume_finalizer("v1"),
        ]);
        assert_eq!(drive.volume_names(), vec!["v1".to_string()]);
        assert!(drive.holds_volume("v1"));
        assert!(!drive.holds_volume("v2"));
    }

    #[test]
    fn test_set_condition_is_idempotent() {
        let mut status = DriveStatus::default();
        assert!(status.set_condition(DriveCondition::new("Anomaly", "Degraded", "x")));
        assert!(!status.set_condition(DriveCondition::new("Anomaly", "Degraded", "x")));
        assert!(status.set_condition(DriveCondition::new("Anomaly", "Degraded", "y")));
        assert!(status.set_condition(DriveCondition::new("Anomaly", "Reformatted", "y")));
        assert_eq!(status.conditions.len(), 2);
    }

    #[test]
    fn test_update_capacity_clamps_allocation() {
        let mut status = DriveStatus {
            allocated_capacity: 80,
            ..Default::default()
        };
        status.update_capacity(50);
        assert_eq!(status.allocated_capacity, 50);
        assert_eq!(status.free_capacity, 0);

        status.allocated_capacity = 10;
        status.update_capacity(100);
        assert_eq!(status.free_capacity, 90);
    }

    #[test]
    fn test_set_label() {
        let mut drive = Drive::new("d1", DriveSpec::default());
        assert!(drive.set_label("k", "v"));
        assert!(!drive.set_label("k", "v"));
        assert!(drive.set_label("k", "w"));
    }
}
