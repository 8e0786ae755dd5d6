//! Device snapshot and identity normalisation

use serde::{Deserialize, Serialize};

/// Prefix of loopback device names
const LOOP_PREFIX: &str = "loop";

/// Stripped UUIDs longer than this are regrouped as `8-4-4-4-12`
const UUID_REGROUP_THRESHOLD: usize = 20;

// =============================================================================
// Device
// =============================================================================

/// A mount of the device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountInfo {
    pub mount_point: String,
    pub options: Vec<String>,
}

/// Point-in-time view of a block device
///
/// Built once per handled event and never modified afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Kernel device name (`sdb`, `nvme0n1p2`, `dm-0`)
    pub name: String,
    pub major: u32,
    pub minor: u32,
    /// Partition number, 0 for whole disks
    pub partition: u32,

    /// Size in bytes
    pub size: u64,
    pub logical_block_size: u64,
    pub physical_block_size: u64,

    pub fs_type: String,
    /// Filesystem UUID as probed on the host
    pub fs_uuid: String,
    /// Filesystem UUID as reported by the event
    pub uevent_fs_uuid: String,

    pub pt_uuid: String,
    pub pt_type: String,
    pub part_uuid: String,
    pub dm_name: String,
    pub dm_uuid: String,
    pub md_uuid: String,

    /// Serial as probed on the host
    pub serial: String,
    /// Short serial as reported by the event
    pub uevent_serial: String,
    pub wwid: String,
    pub vendor: String,
    pub model: String,

    pub mounts: Vec<MountInfo>,

    pub read_only: bool,
    pub is_virtual: bool,
    pub partitioned: bool,
    pub swap_on: bool,
    /// Holder device when this device is a dm/md member
    pub master: String,
}

impl Device {
    /// Device node path
    pub fn dev_path(&self) -> String {
        format!("/dev/{}", self.name)
    }

    /// First mount point, empty when unmounted
    pub fn first_mount_point(&self) -> &str {
        self.mounts
            .first()
            .map(|m| m.mount_point.as_str())
            .unwrap_or("")
    }

    /// Options of the first mount
    pub fn first_mount_options(&self) -> &[String] {
        self.mounts
            .first()
            .map(|m| m.options.as_slice())
            .unwrap_or(&[])
    }

    /// All mount points
    pub fn mount_points(&self) -> impl Iterator<Item = &str> {
        self.mounts.iter().map(|m| m.mount_point.as_str())
    }
}

// =============================================================================
// Normalisation
// =============================================================================

/// Canonicalise a UUID-like identifier
///
/// `:` and `-` separators are stripped; when more than 20 characters remain
/// they are regrouped as `8-4-4-4-rest`. Shorter values are returned as is.
pub fn normalize_uuid(uuid: &str) -> String {
    let stripped: String = uuid.chars().filter(|c| *c != ':' && *c != '-').collect();
    if stripped.len() <= UUID_REGROUP_THRESHOLD || !stripped.is_ascii() {
        return uuid.to_string();
    }
    format!(
        "{}-{}-{}-{}-{}",
        &stripped[..8],
        &stripped[8..12],
        &stripped[12..16],
        &stripped[16..20],
        &stripped[20..]
    )
}

fn is_dos_pt_type(pt_type: &str) -> bool {
    matches!(pt_type, "dos" | "msdos" | "mbr")
}

/// Compare partition table types, treating `dos`, `msdos` and `mbr` alike
pub fn pt_type_equal(a: &str, b: &str) -> bool {
    let (a, b) = (a.to_ascii_lowercase(), b.to_ascii_lowercase());
    a == b || (is_dos_pt_type(&a) && is_dos_pt_type(&b))
}

/// Compare filesystem types case-insensitively
pub fn fs_type_equal(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Whether `name` is a loopback device (`loop0`, `loop12`, ...)
pub fn is_loop_device(name: &str) -> bool {
    name.strip_prefix(LOOP_PREFIX)
        .map(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_uuid() {
        let canonical = "2e4d5e7e-0b23-4d10-9c1b-0a7e4e6f3b21";
        assert_eq!(normalize_uuid(canonical), canonical);
        assert_eq!(normalize_uuid(&normalize_uuid(canonical)), canonical);

        assert_eq!(
            normalize_uuid("2e4d5e7e:0b234d10:9c1b0a7e:4e6f3b21"),
            canonical
        );
        assert_eq!(normalize_uuid("2e4d5e7e0b234d109c1b0a7e4e6f3b21"), canonical);

        // short identifiers pass through untouched
        assert_eq!(normalize_uuid("1234-ABCD"), "1234-ABCD");
        assert_eq!(normalize_uuid(""), "");
    }

    #[test]
    fn test_pt_type_equal() {
        assert!(pt_type_equal("gpt", "GPT"));
        assert!(pt_type_equal("dos", "msdos"));
        assert!(pt_type_equal("MBR", "dos"));
        assert!(!pt_type_equal("gpt", "dos"));
        assert!(pt_type_equal("", ""));
    }

    #[test]
    fn test_is_loop_device() {
        assert!(is_loop_device("loop0"));
        assert!(is_loop_device("loop17"));
        assert!(!is_loop_device("loop"));
        assert!(!is_loop_device("loopback"));
        assert!(!is_loop_device("sda"));
        assert!(!is_loop_device("nvme0n1"));
    }

    #[test]
    fn test_mount_accessors() {
        let mut device = Device {
            name: "sdb".into(),
            ..Default::default()
        };
        assert_eq!(device.dev_path(), "/dev/sdb");
        assert_eq!(device.first_mount_point(), "");
        assert!(device.first_mount_options().is_empty());

        device.mounts.push(MountInfo {
            mount_point: "/mnt/a".into(),
            options: vec!["rw".into()],
        });
        device.mounts.push(MountInfo {
            mount_point: "/mnt/b".into(),
            options: vec![],
        });
        assert_eq!(device.first_mount_point(), "/mnt/a");
        assert_eq!(device.first_mount_options(), &["rw".to_string()]);
        assert_eq!(device.mount_points().count(), 2);
    }
}
