//! Host Device Probe
//!
//! Reads the live state of a block device from sysfs, procfs, the udev
//! database and `/dev/disk/by-uuid`. All roots come from [`ProbeConfig`]
//! so tests can point the probe at a fixture tree.

use super::device::MountInfo;
use crate::config::ProbeConfig;
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Sector size used by the sysfs `size` attribute
const SECTOR_SIZE: u64 = 512;

/// Block size assumed when the queue attributes are unreadable
const DEFAULT_BLOCK_SIZE: u64 = 512;

// =============================================================================
// Probe Result
// =============================================================================

/// Live properties of a block device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeInfo {
    /// Size in bytes
    pub size: u64,
    pub logical_block_size: u64,
    pub physical_block_size: u64,
    pub read_only: bool,
    /// Whether partitions exist on the device
    pub partitioned: bool,
    /// First holder of the device, empty when none
    pub master: String,
    pub swap_on: bool,
    pub mounts: Vec<MountInfo>,
    /// Filesystem UUID from `/dev/disk/by-uuid`
    pub fs_uuid: Option<String>,
    /// Serial from sysfs
    pub serial: Option<String>,
}

// =============================================================================
// Device Source
// =============================================================================

/// Host-side information consulted while building device snapshots
pub trait DeviceSource: Send + Sync {
    /// Properties recorded by udev for `major:minor`, `None` when absent
    fn udev_properties(&self, major: u32, minor: u32) -> Result<Option<BTreeMap<String, String>>>;

    /// Live state of the named device
    fn probe(&self, name: &str, major: u32, minor: u32) -> Result<ProbeInfo>;
}

// =============================================================================
// Sysfs Probe
// =============================================================================

/// [`DeviceSource`] backed by the host filesystems
#[derive(Debug, Clone, Default)]
pub struct SysfsProbe {
    config: ProbeConfig,
}

impl SysfsProbe {
    /// Create a new probe
    pub fn new(config: ProbeConfig) -> Self {
        Self { config }
    }

    /// Probe configuration
    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    fn block_dir(&self, name: &str) -> PathBuf {
        self.config.sysfs_path.join("class/block").join(name)
    }

    /// Read a sysfs attribute
    fn read_sysfs_attr(&self, base: &Path, attr: &str) -> io::Result<String> {
        let path = base.join(attr);
        fs::read_to_string(&path).map(|s| s.trim().to_string())
    }

    fn read_block_size(&self, dir: &Path, attr: &str) -> u64 {
        // partitions carry no queue directory; it lives on the parent disk
        self.read_sysfs_attr(dir, &format!("queue/{}", attr))
            .or_else(|_| self.read_sysfs_attr(dir, &format!("../queue/{}", attr)))
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_BLOCK_SIZE)
    }

    fn is_partitioned(&self, dir: &Path, name: &str) -> bool {
        let Ok(entries) = fs::read_dir(dir) else {
            return false;
        };
        entries.flatten().any(|entry| {
            let child = entry.file_name().to_string_lossy().to_string();
            child.starts_with(name) && entry.path().join("partition").exists()
        })
    }

    fn first_holder(&self, dir: &Path) -> String {
        let Ok(entries) = fs::read_dir(dir.join("holders")) else {
            return String::new();
        };
        let mut holders: Vec<String> = entries
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        holders.sort();
        holders.into_iter().next().unwrap_or_default()
    }

    fn is_swap_on(&self, name: &str) -> Result<bool> {
        let swaps = match fs::read_to_string(self.config.proc_path.join("swaps")) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let dev_path = format!("/dev/{}", name);
        Ok(swaps
            .lines()
            .skip(1)
            .filter_map(|line| line.split_whitespace().next())
            .any(|filename| filename == dev_path))
    }

    fn mounts(&self, major: u32, minor: u32) -> Result<Vec<MountInfo>> {
        let mountinfo = match fs::read_to_string(self.config.proc_path.join("self/mountinfo")) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(parse_mountinfo(&mountinfo, major, minor))
    }

    fn fs_uuid(&self, name: &str) -> Option<String> {
        let entries = fs::read_dir(self.config.dev_path.join("disk/by-uuid")).ok()?;
        entries.flatten().find_map(|entry| {
            let target = fs::read_link(entry.path()).ok()?;
            let target_name = target.file_name()?.to_string_lossy().to_string();
            (target_name == name).then(|| entry.file_name().to_string_lossy().to_string())
        })
    }
}

impl DeviceSource for SysfsProbe {
    fn udev_properties(&self, major: u32, minor: u32) -> Result<Option<BTreeMap<String, String>>> {
        let path = self
            .config
            .udev_data_path
            .join(format!("b{}:{}", major, minor));
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(parse_udev_data(&content))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No udev data at {:?}", path);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn probe(&self, name: &str, major: u32, minor: u32) -> Result<ProbeInfo> {
        let dir = self.block_dir(name);

        let size_str = self
            .read_sysfs_attr(&dir, "size")
            .map_err(|e| Error::DeviceProbe {
                device: name.to_string(),
                reason: format!("unable to read size: {}", e),
            })?;
        let sectors: u64 = size_str.parse().map_err(|_| Error::DeviceProbe {
            device: name.to_string(),
            reason: format!("invalid size: {}", size_str),
        })?;

        let read_only = self
            .read_sysfs_attr(&dir, "ro")
            .map(|s| s == "1")
            .unwrap_or(false);

        let serial = self
            .read_sysfs_attr(&dir, "device/serial")
            .ok()
            .filter(|s| !s.is_empty());

        Ok(ProbeInfo {
            size: sectors * SECTOR_SIZE,
            logical_block_size: self.read_block_size(&dir, "logical_block_size"),
            physical_block_size: self.read_block_size(&dir, "physical_block_size"),
            read_only,
            partitioned: self.is_partitioned(&dir, name),
            master: self.first_holder(&dir),
            swap_on: self.is_swap_on(name)?,
            mounts: self.mounts(major, minor)?,
            fs_uuid: self.fs_uuid(name),
            serial,
        })
    }
}

// =============================================================================
// Parsers
// =============================================================================

/// Parse the `E:KEY=VALUE` property lines of a udev database record
pub fn parse_udev_data(content: &str) -> BTreeMap<String, String> {
    content
        .lines()
        .filter_map(|line| line.strip_prefix("E:"))
        .filter_map(|entry| entry.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Parse a `key=value` per line sysfs `uevent` file
pub fn parse_uevent_file(content: &str) -> BTreeMap<String, String> {
    content
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Extract the mounts of `major:minor` from `/proc/self/mountinfo`
pub fn parse_mountinfo(content: &str, major: u32, minor: u32) -> Vec<MountInfo> {
    let dev = format!("{}:{}", major, minor);
    content
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 6 || fields[2] != dev {
                return None;
            }
            Some(MountInfo {
                mount_point: unescape_mount_path(fields[4]),
                options: fields[5].split(',').map(str::to_string).collect(),
            })
        })
        .collect()
}

/// Decode the octal escapes (`\040`) the kernel uses in mount paths
fn unescape_mount_path(path: &str) -> String {
    let bytes = path.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let decoded = std::str::from_utf8(&bytes[i + 1..i + 4])
                .ok()
                .and_then(|octal| u8::from_str_radix(octal, 8).ok());
            if let Some(value) = decoded {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).to_string()
}
