//! Device Snapshot Builder
//!
//! Turns a decoded uevent into a [`Device`]. `add` and `change` events are
//! completed from udev's database when they arrive without `ID_*`
//! properties and are enriched with a live probe; `remove` events are built
//! from their own fields only, since the device is already gone.

use super::device::{is_loop_device, normalize_uuid, Device};
use super::probe::DeviceSource;
use crate::error::{Error, Result};
use crate::uevent::event::*;
use crate::uevent::{Action, UEvent};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Builds device snapshots from events
#[derive(Clone)]
pub struct DeviceBuilder {
    source: Arc<dyn DeviceSource>,
}

impl DeviceBuilder {
    /// Create a builder reading host state from `source`
    pub fn new(source: Arc<dyn DeviceSource>) -> Self {
        Self { source }
    }

    /// Build the snapshot for `event`
    ///
    /// Returns `Ok(None)` for loopback devices, which are never managed.
    /// Unparsable numeric fields fail the event with
    /// [`Error::InvalidNumber`].
    pub fn build(&self, event: &UEvent) -> Result<Option<Device>> {
        let name = event.name();
        if is_loop_device(name) {
            debug!(device = %name, action = %event.action, "loopback device is ignored");
            return Ok(None);
        }

        let major = parse_required(&event.properties, MAJOR_KEY)?;
        let minor = parse_required(&event.properties, MINOR_KEY)?;

        let mut props = event.properties.clone();
        if event.action != Action::Remove && !event.has_id_properties() {
            if let Some(udev) = self.source.udev_properties(major, minor)? {
                debug!(device = %name, "using udev data for {}:{}", major, minor);
                for (key, value) in udev {
                    props.entry(key).or_insert(value);
                }
            }
        }

        let get = |key: &str| props.get(key).cloned().unwrap_or_default();
        let uevent_fs_uuid = get(ID_FS_UUID_KEY);

        let mut device = Device {
            name: name.to_string(),
            major,
            minor,
            partition: parse_optional(&props, ID_PART_ENTRY_NUMBER_KEY)?,
            fs_type: get(ID_FS_TYPE_KEY),
            fs_uuid: uevent_fs_uuid.clone(),
            uevent_fs_uuid,
            pt_uuid: get(ID_PART_TABLE_UUID_KEY),
            pt_type: get(ID_PART_TABLE_TYPE_KEY),
            part_uuid: get(ID_PART_ENTRY_UUID_KEY),
            dm_name: get(DM_NAME_KEY),
            dm_uuid: get(DM_UUID_KEY),
            md_uuid: normalize_uuid(&get(MD_UUID_KEY)),
            serial: get(ID_SERIAL_KEY),
            uevent_serial: get(ID_SERIAL_SHORT_KEY),
            wwid: get(ID_WWN_KEY),
            vendor: get(ID_VENDOR_KEY),
            model: get(ID_MODEL_KEY),
            is_virtual: event.devpath.contains("/devices/virtual/"),
            ..Default::default()
        };

        if event.action != Action::Remove {
            let info = self.source.probe(name, major, minor)?;
            device.size = info.size;
            device.logical_block_size = info.logical_block_size;
            device.physical_block_size = info.physical_block_size;
            device.read_only = info.read_only;
            device.partitioned = info.partitioned;
            device.master = info.master;
            device.swap_on = info.swap_on;
            device.mounts = info.mounts;
            if let Some(fs_uuid) = info.fs_uuid {
                device.fs_uuid = fs_uuid;
            }
            if let Some(serial) = info.serial {
                device.serial = serial;
            }
        }

        Ok(Some(device))
    }
}

fn parse_required(props: &BTreeMap<String, String>, key: &str) -> Result<u32> {
    let value = props.get(key).map(String::as_str).unwrap_or("");
    value.parse().map_err(|_| Error::InvalidNumber {
        field: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_optional(props: &BTreeMap<String, String>, key: &str) -> Result<u32> {
    match props.get(key) {
        Some(_) => parse_required(props, key),
        None => Ok(0),
    }
}
