//! Label and finalizer conventions
//!
//! Drives and volumes reference each other through labels and finalizers.
//! The drive-to-volume relation is encoded as one finalizer per allocated
//! volume; every component builds and parses that encoding through the
//! helpers below.

/// Label carrying the node a resource belongs to
pub const NODE_LABEL: &str = "direct.storage.io/node";

/// Label carrying the sanitized device name of a drive
pub const DRIVE_PATH_LABEL: &str = "direct.storage.io/drive-path";

/// Label carrying the owning drive's resource name on a volume
pub const DRIVE_LABEL: &str = "direct.storage.io/drive";

/// Label marking which component created a resource
pub const CREATED_BY_LABEL: &str = "direct.storage.io/created-by";

/// Value of [`CREATED_BY_LABEL`] for resources written by this agent
pub const CREATED_BY_VALUE: &str = "das-node-agent";

/// Prefix of the per-volume finalizer held by a drive
pub const DRIVE_FINALIZER_PREFIX: &str = "direct.storage.io.volume/";

/// Finalizer protecting a drive that holds data
pub const DRIVE_FINALIZER_DATA_PROTECTION: &str = "direct.storage.io/data-protection";

/// Finalizer protecting a volume until its backing directory is purged
pub const VOLUME_FINALIZER_PURGE_PROTECTION: &str = "direct.storage.io/purge-protection";

/// Topology segment keys recorded on every drive
pub const TOPOLOGY_IDENTITY: &str = "direct.storage.io/identity";
pub const TOPOLOGY_RACK: &str = "direct.storage.io/rack";
pub const TOPOLOGY_ZONE: &str = "direct.storage.io/zone";
pub const TOPOLOGY_REGION: &str = "direct.storage.io/region";
pub const TOPOLOGY_NODE: &str = "direct.storage.io/node";

/// Maximum length of a label value
const MAX_LABEL_VALUE_LEN: usize = 63;

/// Build the drive finalizer recording that `volume_name` is allocated on it
pub fn volume_finalizer(volume_name: &str) -> String {
    format!("{}{}", DRIVE_FINALIZER_PREFIX, volume_name)
}

/// Extract the volume name from a drive finalizer, if it encodes one
pub fn parse_volume_finalizer(finalizer: &str) -> Option<&str> {
    finalizer
        .strip_prefix(DRIVE_FINALIZER_PREFIX)
        .filter(|name| !name.is_empty())
}

/// Iterate the volume names encoded in a finalizer list
pub fn volume_names(finalizers: &[String]) -> impl Iterator<Item = &str> {
    finalizers.iter().filter_map(|f| parse_volume_finalizer(f))
}

/// Remove `finalizer` from the list, reporting whether it was present
pub fn exclude_finalizer(finalizers: &[String], finalizer: &str) -> (Vec<String>, bool) {
    let mut found = false;
    let kept = finalizers
        .iter()
        .filter(|f| {
            if f.as_str() == finalizer {
                found = true;
                false
            } else {
                true
            }
        })
        .cloned()
        .collect();
    (kept, found)
}

/// Turn an arbitrary string into a valid label value
///
/// `/dev/` prefixes are dropped, characters outside `[A-Za-z0-9._-]` become
/// `-`, the result is truncated to 63 characters and trimmed so it starts
/// and ends with an alphanumeric character.
pub fn sanitize_label_value(value: &str) -> String {
    let value = value.strip_prefix("/dev/").unwrap_or(value);
    let mapped: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .take(MAX_LABEL_VALUE_LEN)
        .collect();

    mapped
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

/// Label value for the drive-path label of a device name or path
pub fn drive_path_label(device: &str) -> String {
    sanitize_label_value(device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_finalizer_round_trip() {
        let finalizer = volume_finalizer("pvc-123");
        assert_eq!(finalizer, "direct.storage.io.volume/pvc-123");
        assert_eq!(parse_volume_finalizer(&finalizer), Some("pvc-123"));
        assert_eq!(parse_volume_finalizer(DRIVE_FINALIZER_DATA_PROTECTION), None);
        assert_eq!(parse_volume_finalizer(DRIVE_FINALIZER_PREFIX), None);
    }

    #[test]
    fn test_volume_names_skips_other_finalizers() {
        let finalizers = vec![
            DRIVE_FINALIZER_DATA_PROTECTION.to_string(),
            volume_finalizer("v1"),
            volume_finalizer("v2"),
        ];
        let names: Vec<&str> = volume_names(&finalizers).collect();
        assert_eq!(names, vec!["v1", "v2"]);
    }

    #[test]
    fn test_exclude_finalizer() {
        let finalizers = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let (kept, found) = exclude_finalizer(&finalizers, "b");
        assert!(found);
        assert_eq!(kept, vec!["a".to_string(), "c".to_string()]);

        let (kept, found) = exclude_finalizer(&finalizers, "z");
        assert!(!found);
        assert_eq!(kept.len(), 3);
    }

    #[test]
    fn test_sanitize_label_value() {
        assert_eq!(sanitize_label_value("/dev/sdb"), "sdb");
        assert_eq!(sanitize_label_value("nvme0n1p1"), "nvme0n1p1");
        assert_eq!(sanitize_label_value("mapper/vg0-lv0"), "mapper-vg0-lv0");
        assert_eq!(sanitize_label_value("-weird:name-"), "weird-name");
        assert_eq!(sanitize_label_value(&"x".repeat(100)).len(), 63);
    }
}
