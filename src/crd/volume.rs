//! Volume CRD
//!
//! Represents a capacity reservation carved out of a drive.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Volume CRD
// =============================================================================

/// Volume reserves capacity on a single drive of a single node.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "direct.storage.io",
    version = "v1",
    kind = "Volume",
    plural = "volumes",
    shortname = "dvol",
    status = "VolumeStatus",
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".spec.nodeName"}"#,
    printcolumn = r#"{"name": "Drive", "type": "string", "jsonPath": ".spec.driveName"}"#,
    printcolumn = r#"{"name": "Capacity", "type": "integer", "jsonPath": ".status.totalCapacity"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpec {
    /// Node hosting the volume
    pub node_name: String,

    /// Name of the owning drive resource
    pub drive_name: String,

    /// Capacity requested by the claim
    #[serde(default)]
    pub requested_capacity: u64,
}

/// Status of the volume
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeStatus {
    /// Directory backing the volume on the host
    #[serde(default)]
    pub host_path: String,

    /// Capacity reserved on the drive
    #[serde(default)]
    pub total_capacity: u64,

    #[serde(default)]
    pub conditions: Vec<VolumeCondition>,
}

/// Lifecycle conditions of a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum VolumeConditionType {
    Staged,
    Published,
    Ready,
}

impl std::fmt::Display for VolumeConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolumeConditionType::Staged => write!(f, "Staged"),
            VolumeConditionType::Published => write!(f, "Published"),
            VolumeConditionType::Ready => write!(f, "Ready"),
        }
    }
}

/// A single volume condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeCondition {
    pub r#type: VolumeConditionType,
    pub status: bool,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl VolumeCondition {
    pub fn new(r#type: VolumeConditionType, status: bool) -> Self {
        Self {
            r#type,
            status,
            reason: None,
            message: None,
            last_transition_time: Some(Utc::now()),
        }
    }
}

// =============================================================================
// Implementations
// =============================================================================

impl Volume {
    /// Resource name
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    /// Finalizers currently set on the volume
    pub fn finalizers(&self) -> &[String] {
        self.metadata.finalizers.as_deref().unwrap_or_default()
    }

    /// Value of a condition, `false` when absent
    pub fn condition(&self, r#type: VolumeConditionType) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.conditions.iter().find(|c| c.r#type == r#type))
            .map(|c| c.status)
            .unwrap_or(false)
    }

    /// Whether the volume is currently published to a workload
    pub fn is_published(&self) -> bool {
        self.condition(VolumeConditionType::Published)
    }

    /// Whether deletion of the volume has been requested
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Reserved capacity, 0 when no status is recorded
    pub fn total_capacity(&self) -> u64 {
        self.status.as_ref().map(|s| s.total_capacity).unwrap_or(0)
    }

    /// Host directory backing the volume, if recorded
    pub fn host_path(&self) -> Option<&str> {
        self.status
            .as_ref()
            .map(|s| s.host_path.as_str())
            .filter(|p| !p.is_empty())
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

    /// Current value of a label
    pub fn label(&self, key: &str) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(key))
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_published_condition() {
        let mut volume = Volume::new(
            "v1",
            VolumeSpec {
                node_name: "node-1".into(),
                drive_name: "d1".into(),
                requested_capacity: 10,
            },
        );
        assert!(!volume.is_published());

        volume.status = Some(VolumeStatus {
            host_path: "/data/v1".into(),
            total_capacity: 10,
            conditions: vec![
                VolumeCondition::new(VolumeConditionType::Staged, true),
                VolumeCondition::new(VolumeConditionType::Published, true),
            ],
        });
        assert!(volume.is_published());
        assert!(volume.condition(VolumeConditionType::Staged));
        assert!(!volume.condition(VolumeConditionType::Ready));
        assert_eq!(volume.host_path(), Some("/data/v1"));
        assert_eq!(volume.total_capacity(), 10);
    }

    #[test]
    fn test_labels() {
        let mut volume = Volume::new("v1", VolumeSpec::default());
        assert_eq!(volume.label("k"), None);
        assert!(volume.set_label("k", "v"));
        assert!(!volume.set_label("k", "v"));
        assert_eq!(volume.label("k"), Some("v"));
    }
}
