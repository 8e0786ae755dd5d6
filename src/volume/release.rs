//! Volume Release
//!
//! Finalizes a volume whose deletion was requested: purges its backing
//! directory, returns its capacity to the drive and drops the finalizers
//! that keep both records alive.

use crate::crd::labels::{
    exclude_finalizer, volume_finalizer, DRIVE_FINALIZER_DATA_PROTECTION,
    VOLUME_FINALIZER_PURGE_PROTECTION,
};
use crate::crd::{DriveState, ReleasedVolume, Volume};
use crate::domain::ports::{DriveStoreRef, VolumeStoreRef};
use crate::error::{Error, Result};
use crate::retry::{retry_on_conflict, RetryPolicy};
use std::io::ErrorKind;
use tracing::{debug, info, warn};

/// What [`VolumeReleaser::release`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Deletion not requested; nothing to do
    Skipped,
    /// Capacity and finalizers released
    Released,
}

/// Releases deleted volumes back to their drives
pub struct VolumeReleaser {
    drives: DriveStoreRef,
    volumes: VolumeStoreRef,
    policy: RetryPolicy,
}

impl VolumeReleaser {
    pub fn new(drives: DriveStoreRef, volumes: VolumeStoreRef, policy: RetryPolicy) -> Self {
        Self {
            drives,
            volumes,
            policy,
        }
    }

    /// Release `volume` if its deletion has been requested
    ///
    /// A published volume is refused with [`Error::VolumePublished`] and
    /// left untouched. Otherwise the host directory is removed, the drive
    /// gets the volume's capacity back and loses the volume finalizer, and
    /// finally the volume's purge-protection finalizer is dropped.
    pub async fn release(&self, volume: &Volume) -> Result<ReleaseOutcome> {
        if !volume.is_deleting() {
            return Ok(ReleaseOutcome::Skipped);
        }
        let name = volume.name();
        if volume.is_published() {
            return Err(Error::VolumePublished {
                name: name.to_string(),
            });
        }

        if let Some(host_path) = volume.host_path() {
            match tokio::fs::remove_dir_all(host_path).await {
                Ok(()) => debug!(volume = %name, "removed {}", host_path),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.release_capacity(volume).await?;
        self.remove_purge_protection(volume).await?;

        info!(volume = %name, drive = %volume.spec.drive_name, "Released volume");
        Ok(ReleaseOutcome::Released)
    }

    async fn release_capacity(&self, volume: &Volume) -> Result<()> {
        let drive_name = volume.spec.drive_name.as_str();
        let finalizer = volume_finalizer(volume.name());
        let finalizer = finalizer.as_str();
        let capacity = volume.total_capacity();
        let released = ReleasedVolume {
            name: volume.name().to_string(),
            uid: volume.metadata.uid.clone().unwrap_or_default(),
        };
        let released = &released;

        // Status lands before metadata; after a half-applied write the
        // release record keeps the retry from adding the capacity twice.
        let result = retry_on_conflict(&self.policy, self.drives.kind(), drive_name, || async move {
            let mut drive = self.drives.get(drive_name).await?;
            let (finalizers, found) = exclude_finalizer(drive.finalizers(), finalizer);
            if !found {
                return Ok(false);
            }

            let held = drive.volume_names();
            let only_protection =
                finalizers.len() == 1 && finalizers[0] == DRIVE_FINALIZER_DATA_PROTECTION;
            drive.metadata.finalizers = Some(finalizers);

            let status = drive.status.get_or_insert_with(Default::default);
            status.released_volumes.retain(|r| {
                if r.name == released.name {
                    r == released
                } else {
                    held.contains(&r.name)
                }
            });
            if status.released_volumes.contains(released) {
                debug!(volume = %released.name, drive = %drive_name, "capacity already returned");
            } else {
                status.free_capacity += capacity;
                status.allocated_capacity = status.allocated_capacity.saturating_sub(capacity);
                status.released_volumes.push(released.clone());
            }
            if only_protection {
                status.drive_status = DriveState::Ready;
            }

            self.drives.update(&drive).await?;
            Ok(true)
        })
        .await;

        match result {
            Ok(true) => Ok(()),
            Ok(false) => {
                debug!(volume = %volume.name(), drive = %drive_name, "drive holds no finalizer for volume");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                warn!(volume = %volume.name(), "drive {} not found; nothing to release", drive_name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn remove_purge_protection(&self, volume: &Volume) -> Result<()> {
        let name = volume.name();
        let mut given = Some(volume.clone());

        retry_on_conflict(&self.policy, self.volumes.kind(), name, || {
            let cached = given.take();
            async move {
                let mut volume = match cached {
                    Some(volume) => volume,
                    None => self.volumes.get(name).await?,
                };
                let (finalizers, found) =
                    exclude_finalizer(volume.finalizers(), VOLUME_FINALIZER_PURGE_PROTECTION);
                if found {
                    volume.metadata.finalizers = Some(finalizers);
                    self.volumes.update(&volume).await?;
                }
                Ok(())
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        Drive, DriveSpec, DriveStatus, VolumeCondition, VolumeConditionType, VolumeSpec,
        VolumeStatus,
    };
    use crate::store::MemoryStore;
    use assert_matches::assert_matches;
    use chrono::Utc;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use std::path::Path;
    use std::sync::Arc;

    const MIB: u64 = 1 << 20;

    struct Fixture {
        drives: Arc<MemoryStore<Drive>>,
        volumes: Arc<MemoryStore<Volume>>,
        releaser: VolumeReleaser,
    }

    fn fixture() -> Fixture {
        let drives = Arc::new(MemoryStore::<Drive>::new());
        let volumes = Arc::new(MemoryStore::<Volume>::new());

        let mut drive = Drive::new("D", DriveSpec::default());
        drive.metadata.finalizers = Some(vec![
            DRIVE_FINALIZER_DATA_PROTECTION.to_string(),
            volume_finalizer("V20"),
            volume_finalizer("V30"),
        ]);
        drive.status = Some(DriveStatus {
            drive_status: DriveState::InUse,
            total_capacity: 100 * MIB,
            allocated_capacity: 50 * MIB,
            free_capacity: 50 * MIB,
            ..Default::default()
        });
        drives.insert(drive);

        let releaser = VolumeReleaser::new(drives.clone(), volumes.clone(), RetryPolicy::default());
        Fixture {
            drives,
            volumes,
            releaser,
        }
    }

    fn volume(name: &str, capacity: u64, host_path: &Path, published: bool) -> Volume {
        let mut volume = Volume::new(
            name,
            VolumeSpec {
                node_name: "node-1".into(),
                drive_name: "D".into(),
                requested_capacity: capacity,
            },
        );
        volume.metadata.finalizers = Some(vec![VOLUME_FINALIZER_PURGE_PROTECTION.to_string()]);
        volume.metadata.deletion_timestamp = Some(Time(Utc::now()));
        volume.status = Some(VolumeStatus {
            host_path: host_path.to_string_lossy().into_owned(),
            total_capacity: capacity,
            conditions: vec![VolumeCondition::new(VolumeConditionType::Published, published)],
        });
        volume
    }

    #[tokio::test]
    async fn test_release_returns_capacity() {
        let f = fixture();
        let dir = tempfile::tempdir().unwrap();
        let host_path = dir.path().join("V20");
        std::fs::create_dir_all(host_path.join("data")).unwrap();
        let stored = f.volumes.insert(volume("V20", 20 * MIB, &host_path, false));

        let outcome = f.releaser.release(&stored).await.unwrap();
        assert_eq!(outcome, ReleaseOutcome::Released);
        assert!(!host_path.exists());

        let drive = f.drives.snapshot("D").unwrap();
        let status = drive.status.as_ref().unwrap();
        assert_eq!(status.allocated_capacity, 30 * MIB);
        assert_eq!(status.free_capacity, 70 * MIB);
        assert_eq!(status.drive_status, DriveState::InUse);
        assert_eq!(
            drive.finalizers(),
            &[
                DRIVE_FINALIZER_DATA_PROTECTION.to_string(),
                volume_finalizer("V30")
            ]
        );

        assert!(f.volumes.snapshot("V20").unwrap().finalizers().is_empty());
    }

    #[tokio::test]
    async fn test_release_of_last_volume_marks_drive_ready() {
        let f = fixture();
        let dir = tempfile::tempdir().unwrap();
        let v20 = f.volumes.insert(volume("V20", 20 * MIB, &dir.path().join("V20"), false));
        let v30 = f.volumes.insert(volume("V30", 30 * MIB, &dir.path().join("V30"), false));

        f.releaser.release(&v20).await.unwrap();
        f.releaser.release(&v30).await.unwrap();

        let status = f.drives.snapshot("D").unwrap().status.unwrap();
        assert_eq!(status.drive_status, DriveState::Ready);
        assert_eq!(status.allocated_capacity, 0);
        assert_eq!(status.free_capacity, 100 * MIB);
    }

    #[tokio::test]
    async fn test_published_volume_is_refused() {
        let f = fixture();
        let dir = tempfile::tempdir().unwrap();
        let stored = f.volumes.insert(volume("V20", 20 * MIB, dir.path(), true));

        let result = f.releaser.release(&stored).await;
        assert_matches!(result, Err(Error::VolumePublished { name }) if name == "V20");
        assert!(dir.path().exists());
        assert_eq!(f.drives.writes(), 0);
        assert_eq!(f.volumes.writes(), 0);
    }

    #[tokio::test]
    async fn test_volume_not_being_deleted_is_skipped() {
        let f = fixture();
        let dir = tempfile::tempdir().unwrap();
        let mut live = volume("V20", 20 * MIB, dir.path(), false);
        live.metadata.deletion_timestamp = None;

        assert_eq!(f.releaser.release(&live).await.unwrap(), ReleaseOutcome::Skipped);
        assert!(dir.path().exists());
        assert_eq!(f.drives.writes(), 0);
    }

    #[tokio::test]
    async fn test_release_survives_conflicts() {
        let f = fixture();
        let dir = tempfile::tempdir().unwrap();
        let stored = f.volumes.insert(volume("V20", 20 * MIB, &dir.path().join("V20"), false));
        f.drives.inject_conflicts(2);
        f.volumes.inject_conflicts(1);

        f.releaser.release(&stored).await.unwrap();

        let status = f.drives.snapshot("D").unwrap().status.unwrap();
        assert_eq!(status.allocated_capacity, 30 * MIB);
        assert_eq!(f.drives.writes(), 1);
        assert!(f.volumes.snapshot("V20").unwrap().finalizers().is_empty());
    }

    #[tokio::test]
    async fn test_half_applied_write_returns_capacity_once() {
        let f = fixture();
        let dir = tempfile::tempdir().unwrap();
        let stored = f.volumes.insert(volume("V20", 20 * MIB, &dir.path().join("V20"), false));
        f.drives.inject_split_writes(1);

        f.releaser.release(&stored).await.unwrap();

        let drive = f.drives.snapshot("D").unwrap();
        let status = drive.status.as_ref().unwrap();
        assert_eq!(status.allocated_capacity, 30 * MIB);
        assert_eq!(status.free_capacity, 70 * MIB);
        assert_eq!(
            drive.finalizers(),
            &[
                DRIVE_FINALIZER_DATA_PROTECTION.to_string(),
                volume_finalizer("V30")
            ]
        );
        assert_eq!(f.drives.writes(), 2);

        // the next release drops the finished record
        let v30 = f.volumes.insert(volume("V30", 30 * MIB, &dir.path().join("V30"), false));
        f.releaser.release(&v30).await.unwrap();
        let status = f.drives.snapshot("D").unwrap().status.unwrap();
        assert_eq!(status.free_capacity, 100 * MIB);
        assert_eq!(status.drive_status, DriveState::Ready);
        let names: Vec<_> = status.released_volumes.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["V30"]);
    }

    #[tokio::test]
    async fn test_recreated_volume_returns_capacity_again() {
        let f = fixture();
        let dir = tempfile::tempdir().unwrap();
        let mut old = volume("V20", 20 * MIB, &dir.path().join("V20"), false);
        old.metadata.uid = Some("uid-1".into());
        let mut drive = f.drives.snapshot("D").unwrap();
        drive.status.as_mut().unwrap().released_volumes = vec![ReleasedVolume {
            name: "V20".into(),
            uid: "uid-1".into(),
        }];
        f.drives.insert(drive);

        let mut recreated = old.clone();
        recreated.metadata.uid = Some("uid-2".into());
        let stored = f.volumes.insert(recreated);
        f.releaser.release(&stored).await.unwrap();

        let status = f.drives.snapshot("D").unwrap().status.unwrap();
        assert_eq!(status.allocated_capacity, 30 * MIB);
        assert_eq!(status.released_volumes.len(), 1);
        assert_eq!(status.released_volumes[0].uid, "uid-2");
    }

    #[tokio::test]
    async fn test_repeated_release_is_idempotent() {
        let f = fixture();
        let dir = tempfile::tempdir().unwrap();
        let stored = f.volumes.insert(volume("V20", 20 * MIB, &dir.path().join("V20"), false));

        f.releaser.release(&stored).await.unwrap();
        let current = f.volumes.snapshot("V20").unwrap();
        f.releaser.release(&current).await.unwrap();

        let status = f.drives.snapshot("D").unwrap().status.unwrap();
        assert_eq!(status.allocated_capacity, 30 * MIB);
        assert_eq!(f.drives.writes(), 1);
        assert_eq!(f.volumes.writes(), 1);
    }
}
