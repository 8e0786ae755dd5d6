//! Decoded uevent record

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::str::FromStr;

// =============================================================================
// Property Keys
// =============================================================================

pub const SUBSYSTEM_KEY: &str = "SUBSYSTEM";
pub const DEVPATH_KEY: &str = "DEVPATH";
pub const ACTION_KEY: &str = "ACTION";
pub const MAJOR_KEY: &str = "MAJOR";
pub const MINOR_KEY: &str = "MINOR";
pub const ID_PART_ENTRY_NUMBER_KEY: &str = "ID_PART_ENTRY_NUMBER";
pub const ID_WWN_KEY: &str = "ID_WWN";
pub const ID_MODEL_KEY: &str = "ID_MODEL";
pub const ID_SERIAL_KEY: &str = "ID_SERIAL";
pub const ID_SERIAL_SHORT_KEY: &str = "ID_SERIAL_SHORT";
pub const ID_VENDOR_KEY: &str = "ID_VENDOR";
pub const DM_NAME_KEY: &str = "DM_NAME";
pub const DM_UUID_KEY: &str = "DM_UUID";
pub const MD_UUID_KEY: &str = "MD_UUID";
pub const ID_PART_TABLE_UUID_KEY: &str = "ID_PART_TABLE_UUID";
pub const ID_PART_TABLE_TYPE_KEY: &str = "ID_PART_TABLE_TYPE";
pub const ID_PART_ENTRY_UUID_KEY: &str = "ID_PART_ENTRY_UUID";
pub const ID_FS_UUID_KEY: &str = "ID_FS_UUID";
pub const ID_FS_TYPE_KEY: &str = "ID_FS_TYPE";

/// Subsystem of the events the agent handles
pub const BLOCK_SUBSYSTEM: &str = "block";

// =============================================================================
// Action
// =============================================================================

/// Device lifecycle action carried by a uevent
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Action {
    Add,
    Change,
    Remove,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Add => "add",
            Action::Change => "change",
            Action::Remove => "remove",
        }
    }
}

impl FromStr for Action {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "add" => Ok(Action::Add),
            "change" => Ok(Action::Change),
            "remove" => Ok(Action::Remove),
            other => Err(Error::InvalidAction {
                action: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// UEvent
// =============================================================================

/// A block-device uevent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UEvent {
    pub action: Action,
    /// Kernel device path relative to sysfs (`/devices/.../block/sdb`)
    pub devpath: String,
    /// All properties carried by the event
    pub properties: BTreeMap<String, String>,
}

impl UEvent {
    /// Classify a decoded property map
    ///
    /// Fails with [`Error::NonBlockDevice`] for other subsystems,
    /// [`Error::MissingDevPath`] without a usable `DEVPATH` and
    /// [`Error::InvalidAction`] for actions other than add/change/remove.
    pub fn from_properties(properties: BTreeMap<String, String>) -> Result<Self> {
        let subsystem = properties.get(SUBSYSTEM_KEY).map(String::as_str).unwrap_or("");
        if subsystem != BLOCK_SUBSYSTEM {
            return Err(Error::NonBlockDevice {
                subsystem: subsystem.to_string(),
            });
        }

        let devpath = properties.get(DEVPATH_KEY).cloned().unwrap_or_default();
        if basename(&devpath).is_empty() {
            return Err(Error::MissingDevPath);
        }

        let action = properties
            .get(ACTION_KEY)
            .map(String::as_str)
            .unwrap_or("")
            .parse()?;

        Ok(Self {
            action,
            devpath,
            properties,
        })
    }

    /// Kernel device name (last component of `DEVPATH`)
    pub fn name(&self) -> &str {
        basename(&self.devpath)
    }

    /// Property value, empty when absent
    pub fn get(&self, key: &str) -> &str {
        self.properties.get(key).map(String::as_str).unwrap_or("")
    }

    /// Whether the event carries udev-enriched `ID_*` properties
    pub fn has_id_properties(&self) -> bool {
        self.properties.keys().any(|k| k.starts_with("ID_"))
    }
}

fn basename(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or("")
}
