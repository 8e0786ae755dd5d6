//! Drive Identity Matcher
//!
//! Decides which recorded drive, if any, an observed device corresponds to.
//! Each matcher compares one identity property (recorded value `alpha`,
//! observed value `beta`):
//!
//! | alpha     | beta      | outcome      |
//! |-----------|-----------|--------------|
//! | empty     | any       | inconclusive |
//! | non-empty | empty     | inconclusive |
//! | non-empty | equal     | match        |
//! | non-empty | different | no match     |
//!
//! The partition number is the exception: it is always known (0 is the
//! whole disk), so a different number is a conclusive no match while an
//! equal one leaves the decision to the next matcher.
//!
//! Matchers run in precedence order and the first conclusive outcome
//! classifies the drive. Drives on which every matcher is inconclusive are
//! left out of both the matched and the unmatched set.

use crate::crd::{Drive, DriveStatus};
use crate::device::{pt_type_equal, Device};

// =============================================================================
// Outcomes
// =============================================================================

/// Result of one matcher on one (device, drive) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    Match,
    NoMatch,
    Inconclusive,
}

impl MatchOutcome {
    /// Compare two string properties
    pub fn compare(alpha: &str, beta: &str) -> Self {
        if alpha.is_empty() || beta.is_empty() {
            MatchOutcome::Inconclusive
        } else if alpha == beta {
            MatchOutcome::Match
        } else {
            MatchOutcome::NoMatch
        }
    }

    /// Compare two numeric properties, 0 meaning unknown
    pub fn compare_num(alpha: u64, beta: u64) -> Self {
        if alpha == 0 || beta == 0 {
            MatchOutcome::Inconclusive
        } else if alpha == beta {
            MatchOutcome::Match
        } else {
            MatchOutcome::NoMatch
        }
    }

    /// Rule out on a differing value, otherwise defer
    pub fn rule_out(alpha: u64, beta: u64) -> Self {
        if alpha == beta {
            MatchOutcome::Inconclusive
        } else {
            MatchOutcome::NoMatch
        }
    }

    pub fn is_conclusive(&self) -> bool {
        !matches!(self, MatchOutcome::Inconclusive)
    }
}

impl std::fmt::Display for MatchOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MatchOutcome::Match => write!(f, "match"),
            MatchOutcome::NoMatch => write!(f, "no-match"),
            MatchOutcome::Inconclusive => write!(f, "inconclusive"),
        }
    }
}

// =============================================================================
// Matchers
// =============================================================================

/// A named identity predicate
#[derive(Clone, Copy)]
pub struct Matcher {
    pub name: &'static str,
    pub func: fn(&Device, &DriveStatus) -> MatchOutcome,
}

impl std::fmt::Debug for Matcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name)
    }
}

/// Matchers in precedence order: hardware identity, then software and
/// filesystem identity, then the block size as a last resort
pub const MATCHERS: &[Matcher] = &[
    Matcher { name: "partition-number", func: partition_number },
    Matcher { name: "uevent-serial", func: uevent_serial },
    Matcher { name: "wwid", func: wwid },
    Matcher { name: "model", func: model },
    Matcher { name: "vendor", func: vendor },
    Matcher { name: "partition-table-uuid", func: partition_table_uuid },
    Matcher { name: "partition-uuid", func: partition_uuid },
    Matcher { name: "dm-uuid", func: dm_uuid },
    Matcher { name: "md-uuid", func: md_uuid },
    Matcher { name: "uevent-fs-uuid", func: uevent_fs_uuid },
    Matcher { name: "fs-uuid", func: fs_uuid },
    Matcher { name: "serial-number", func: serial_number },
    Matcher { name: "logical-block-size", func: logical_block_size },
];

fn partition_number(device: &Device, status: &DriveStatus) -> MatchOutcome {
    MatchOutcome::rule_out(status.partition_num.into(), device.partition.into())
}

fn uevent_serial(device: &Device, status: &DriveStatus) -> MatchOutcome {
    MatchOutcome::compare(&status.uevent_serial, &device.uevent_serial)
}

fn wwid(device: &Device, status: &DriveStatus) -> MatchOutcome {
    MatchOutcome::compare(&status.wwid, &device.wwid)
}

fn model(device: &Device, status: &DriveStatus) -> MatchOutcome {
    MatchOutcome::compare(&status.model_number, &device.model)
}

fn vendor(device: &Device, status: &DriveStatus) -> MatchOutcome {
    MatchOutcome::compare(&status.vendor, &device.vendor)
}

fn partition_table_uuid(device: &Device, status: &DriveStatus) -> MatchOutcome {
    if status.part_table_uuid.is_empty() || status.part_table_type.is_empty() {
        return MatchOutcome::Inconclusive;
    }
    if device.pt_uuid.is_empty() || device.pt_type.is_empty() {
        return MatchOutcome::Inconclusive;
    }
    if status.part_table_uuid == device.pt_uuid
        && pt_type_equal(&status.part_table_type, &device.pt_type)
    {
        MatchOutcome::Match
    } else {
        MatchOutcome::NoMatch
    }
}

fn partition_uuid(device: &Device, status: &DriveStatus) -> MatchOutcome {
    MatchOutcome::compare(&status.partition_uuid, &device.part_uuid)
}

fn dm_uuid(device: &Device, status: &DriveStatus) -> MatchOutcome {
    MatchOutcome::compare(&status.dm_uuid, &device.dm_uuid)
}

fn md_uuid(device: &Device, status: &DriveStatus) -> MatchOutcome {
    MatchOutcome::compare(&status.md_uuid, &device.md_uuid)
}

fn uevent_fs_uuid(device: &Device, status: &DriveStatus) -> MatchOutcome {
    MatchOutcome::compare(&status.uevent_fs_uuid, &device.uevent_fs_uuid)
}

fn fs_uuid(device: &Device, status: &DriveStatus) -> MatchOutcome {
    MatchOutcome::compare(&status.filesystem_uuid, &device.fs_uuid)
}

fn serial_number(device: &Device, status: &DriveStatus) -> MatchOutcome {
    MatchOutcome::compare(&status.serial_number, &device.serial)
}

fn logical_block_size(device: &Device, status: &DriveStatus) -> MatchOutcome {
    MatchOutcome::compare_num(status.logical_block_size, device.logical_block_size)
}

// =============================================================================
// Aggregation
// =============================================================================

/// Conclusive classification of one drive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    /// Matcher that decided
    pub matcher: &'static str,
    pub matched: bool,
}

/// Run the matchers on one drive status; `None` when all are inconclusive
pub fn classify(device: &Device, status: &DriveStatus) -> Option<Verdict> {
    MATCHERS.iter().find_map(|m| {
        let outcome = (m.func)(device, status);
        outcome.is_conclusive().then(|| Verdict {
            matcher: m.name,
            matched: outcome == MatchOutcome::Match,
        })
    })
}

/// Drives split by their conclusive classification
#[derive(Debug, Default)]
pub struct MatchResult<'a> {
    pub matched: Vec<&'a Drive>,
    pub unmatched: Vec<&'a Drive>,
}

/// Classify every drive against the device
///
/// Drives without a recorded status, or on which no matcher is
/// conclusive, appear in neither set.
pub fn get_matching_drives<'a>(device: &Device, drives: &'a [Drive]) -> MatchResult<'a> {
    let mut result = MatchResult::default();
    for drive in drives {
        let Some(status) = drive.status.as_ref() else {
            continue;
        };
        match classify(device, status) {
            Some(Verdict { matched: true, .. }) => result.matched.push(drive),
            Some(Verdict { matched: false, .. }) => result.unmatched.push(drive),
            None => {}
        }
    }
    result
}

/// Aggregate decision over the candidate drives
#[derive(Debug, Clone, Copy)]
pub enum MatchDecision<'a> {
    /// Exactly one drive matched
    Matched(&'a Drive),
    /// No drive matched
    NoMatch,
    /// More than one drive matched
    Ambiguous(usize),
}

impl MatchDecision<'_> {
    /// Metric label of the decision
    pub fn label(&self) -> &'static str {
        match self {
            MatchDecision::Matched(_) => "matched",
            MatchDecision::NoMatch => "no-match",
            MatchDecision::Ambiguous(_) => "ambiguous",
        }
    }
}

/// Decide which drive the device corresponds to
pub fn run_matcher<'a>(device: &Device, drives: &'a [Drive]) -> MatchDecision<'a> {
    let result = get_matching_drives(device, drives);
    match result.matched.as_slice() {
        [] => MatchDecision::NoMatch,
        [drive] => MatchDecision::Matched(drive),
        many => MatchDecision::Ambiguous(many.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::DriveSpec;
    use assert_matches::assert_matches;

    fn drive(name: &str, status: DriveStatus) -> Drive {
        let mut drive = Drive::new(name, DriveSpec::default());
        drive.status = Some(status);
        drive
    }

    #[test]
    fn test_compare_truth_table() {
        assert_eq!(MatchOutcome::compare("", ""), MatchOutcome::Inconclusive);
        assert_eq!(MatchOutcome::compare("", "b"), MatchOutcome::Inconclusive);
        assert_eq!(MatchOutcome::compare("a", ""), MatchOutcome::Inconclusive);
        assert_eq!(MatchOutcome::compare("a", "a"), MatchOutcome::Match);
        assert_eq!(MatchOutcome::compare("a", "b"), MatchOutcome::NoMatch);

        assert_eq!(MatchOutcome::compare_num(0, 0), MatchOutcome::Inconclusive);
        assert_eq!(MatchOutcome::compare_num(0, 512), MatchOutcome::Inconclusive);
        assert_eq!(MatchOutcome::compare_num(512, 0), MatchOutcome::Inconclusive);
        assert_eq!(MatchOutcome::compare_num(512, 512), MatchOutcome::Match);
        assert_eq!(MatchOutcome::compare_num(512, 4096), MatchOutcome::NoMatch);

        assert_eq!(MatchOutcome::rule_out(0, 0), MatchOutcome::Inconclusive);
        assert_eq!(MatchOutcome::rule_out(3, 3), MatchOutcome::Inconclusive);
        assert_eq!(MatchOutcome::rule_out(0, 1), MatchOutcome::NoMatch);
        assert_eq!(MatchOutcome::rule_out(2, 0), MatchOutcome::NoMatch);
    }

    /// Every matcher follows the truth table for its own property
    #[test]
    fn test_each_matcher_truth_table() {
        type Setter = fn(&mut Device, &mut DriveStatus, &str, &str);
        let cases: &[(&str, Setter)] = &[
            ("uevent-serial", |d, s, a, b| {
                s.uevent_serial = a.into();
                d.uevent_serial = b.into();
            }),
            ("wwid", |d, s, a, b| {
                s.wwid = a.into();
                d.wwid = b.into();
            }),
            ("model", |d, s, a, b| {
                s.model_number = a.into();
                d.model = b.into();
            }),
            ("vendor", |d, s, a, b| {
                s.vendor = a.into();
                d.vendor = b.into();
            }),
            ("partition-uuid", |d, s, a, b| {
                s.partition_uuid = a.into();
                d.part_uuid = b.into();
            }),
            ("dm-uuid", |d, s, a, b| {
                s.dm_uuid = a.into();
                d.dm_uuid = b.into();
            }),
            ("md-uuid", |d, s, a, b| {
                s.md_uuid = a.into();
                d.md_uuid = b.into();
            }),
            ("uevent-fs-uuid", |d, s, a, b| {
                s.uevent_fs_uuid = a.into();
                d.uevent_fs_uuid = b.into();
            }),
            ("fs-uuid", |d, s, a, b| {
                s.filesystem_uuid = a.into();
                d.fs_uuid = b.into();
            }),
            ("serial-number", |d, s, a, b| {
                s.serial_number = a.into();
                d.serial = b.into();
            }),
            ("partition-table-uuid", |d, s, a, b| {
                s.part_table_uuid = a.into();
                s.part_table_type = "gpt".into();
                d.pt_uuid = b.into();
                d.pt_type = "GPT".into();
            }),
            ("logical-block-size", |d, s, a, b| {
                s.logical_block_size = a.len() as u64;
                d.logical_block_size = b.len() as u64;
            }),
        ];

        for (name, set) in cases {
            let matcher = MATCHERS.iter().find(|m| m.name == *name).unwrap();
            let run = |a: &str, b: &str| {
                let mut device = Device::default();
                let mut status = DriveStatus::default();
                set(&mut device, &mut status, a, b);
                (matcher.func)(&device, &status)
            };
            assert_eq!(run("", ""), MatchOutcome::Inconclusive, "{}", name);
            assert_eq!(run("", "x"), MatchOutcome::Inconclusive, "{}", name);
            assert_eq!(run("x", ""), MatchOutcome::Inconclusive, "{}", name);
            assert_eq!(run("x", "x"), MatchOutcome::Match, "{}", name);
            assert_eq!(run("x", "yy"), MatchOutcome::NoMatch, "{}", name);
        }
        assert_eq!(cases.len() + 1, MATCHERS.len());
    }

    #[test]
    fn test_partition_number_separates_disk_from_partition() {
        let disk = DriveStatus {
            wwid: "W1".into(),
            ..Default::default()
        };
        let part = DriveStatus {
            partition_num: 1,
            ..disk.clone()
        };
        let device = |partition| Device {
            wwid: "W1".into(),
            partition,
            ..Default::default()
        };

        assert_eq!(
            classify(&device(1), &disk),
            Some(Verdict {
                matcher: "partition-number",
                matched: false
            })
        );
        assert_eq!(
            classify(&device(0), &part),
            Some(Verdict {
                matcher: "partition-number",
                matched: false
            })
        );
        assert_eq!(
            classify(&device(0), &disk),
            Some(Verdict {
                matcher: "wwid",
                matched: true
            })
        );
        assert_eq!(
            classify(&device(1), &part),
            Some(Verdict {
                matcher: "wwid",
                matched: true
            })
        );
    }

    #[test]
    fn test_partition_table_type_equivalence() {
        let device = Device {
            pt_uuid: "abcd".into(),
            pt_type: "msdos".into(),
            ..Default::default()
        };
        let mut status = DriveStatus {
            part_table_uuid: "abcd".into(),
            part_table_type: "dos".into(),
            ..Default::default()
        };
        assert_eq!(partition_table_uuid(&device, &status), MatchOutcome::Match);

        status.part_table_type = "gpt".into();
        assert_eq!(partition_table_uuid(&device, &status), MatchOutcome::NoMatch);

        status.part_table_type = String::new();
        assert_eq!(partition_table_uuid(&device, &status), MatchOutcome::Inconclusive);
    }

    #[test]
    fn test_first_conclusive_matcher_decides() {
        // serial disagrees before the fs uuid agrees
        let device = Device {
            uevent_serial: "S2".into(),
            fs_uuid: "F1".into(),
            ..Default::default()
        };
        let status = DriveStatus {
            uevent_serial: "S1".into(),
            filesystem_uuid: "F1".into(),
            ..Default::default()
        };
        assert_eq!(
            classify(&device, &status),
            Some(Verdict {
                matcher: "uevent-serial",
                matched: false
            })
        );
    }

    #[test]
    fn test_inconclusive_drives_are_excluded() {
        let device = Device {
            wwid: "W1".into(),
            ..Default::default()
        };
        let drives = vec![
            drive("blank", DriveStatus::default()),
            drive(
                "other",
                DriveStatus {
                    wwid: "W2".into(),
                    ..Default::default()
                },
            ),
            Drive::new("no-status", DriveSpec::default()),
        ];
        let result = get_matching_drives(&device, &drives);
        assert!(result.matched.is_empty());
        assert_eq!(result.unmatched.len(), 1);
        assert_eq!(result.unmatched[0].name(), "other");
        assert!(result.matched.len() + result.unmatched.len() <= drives.len());
    }

    #[test]
    fn test_no_identity_yields_no_match() {
        let device = Device {
            name: "sdb".into(),
            wwid: "W1".into(),
            model: "M1".into(),
            ..Default::default()
        };
        let drives = vec![drive("d1", DriveStatus::default()), drive("d2", DriveStatus::default())];
        assert_matches!(run_matcher(&device, &drives), MatchDecision::NoMatch);
        assert_matches!(run_matcher(&device, &[]), MatchDecision::NoMatch);
    }

    #[test]
    fn test_identical_drives_are_ambiguous() {
        let status = DriveStatus {
            wwid: "W1".into(),
            model_number: "M1".into(),
            serial_number: "S1".into(),
            ..Default::default()
        };
        let device = Device {
            wwid: "W1".into(),
            model: "M1".into(),
            serial: "S1".into(),
            ..Default::default()
        };
        let drives = vec![drive("d1", status.clone()), drive("d2", status)];
        assert_matches!(run_matcher(&device, &drives), MatchDecision::Ambiguous(2));
    }

    #[test]
    fn test_wwid_and_model_single_match() {
        let device = Device {
            name: "sdb".into(),
            wwid: "W1".into(),
            model: "M1".into(),
            ..Default::default()
        };
        let drives = vec![
            drive(
                "d1",
                DriveStatus {
                    wwid: "W1".into(),
                    model_number: "M1".into(),
                    ..Default::default()
                },
            ),
            drive("blank", DriveStatus::default()),
        ];
        match run_matcher(&device, &drives) {
            MatchDecision::Matched(d) => assert_eq!(d.name(), "d1"),
            other => panic!("unexpected decision {:?}", other),
        }
    }
}
