//! Block device snapshots
//!
//! - [`device`]: the `Device` snapshot and identity normalisation helpers
//! - [`probe`]: live host state from sysfs, procfs and the udev database
//! - [`builder`]: event to snapshot conversion

pub mod builder;
pub mod device;
pub mod probe;

pub use builder::DeviceBuilder;
pub use device::{
    fs_type_equal, is_loop_device, normalize_uuid, pt_type_equal, Device, MountInfo,
};
pub use probe::{DeviceSource, ProbeInfo, SysfsProbe};
