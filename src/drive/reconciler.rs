//! Drive Reconciler
//!
//! Creates drives for newly seen devices and folds the observed state of a
//! matched device into its drive. The pure part ([`new_drive_status`],
//! [`sync_drive`]) decides what changes; [`DriveReconciler`] persists it
//! under conflict retry and triggers the volume label sync after a rename.

use crate::config::ReconcilerConfig;
use crate::crd::labels::{self, CREATED_BY_LABEL, CREATED_BY_VALUE, DRIVE_PATH_LABEL, NODE_LABEL};
use crate::crd::{Drive, DriveCondition, DriveSpec, DriveState, DriveStatus};
use crate::device::{fs_type_equal, pt_type_equal, Device};
use crate::domain::ports::{DriveStoreRef, VolumeStoreRef};
use crate::error::Result;
use crate::metrics;
use crate::retry::{retry_on_conflict, RetryPolicy};
use crate::volume::sync::sync_volume_drive_path;
use std::path::Path;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Condition type of anomaly records
pub const ANOMALY_CONDITION: &str = "Anomaly";

// =============================================================================
// Anomalies
// =============================================================================

/// Irreconcilable observation on an active drive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnomalyReason {
    /// Filesystem UUID changed; the drive may have been reformatted
    Reformatted,
    /// Mounted somewhere other than its managed mount point
    MountedOutsideRoot,
    /// Device properties now disqualify the drive
    Degraded,
}

impl std::fmt::Display for AnomalyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnomalyReason::Reformatted => write!(f, "Reformatted"),
            AnomalyReason::MountedOutsideRoot => write!(f, "MountedOutsideRoot"),
            AnomalyReason::Degraded => write!(f, "Degraded"),
        }
    }
}

/// A detected anomaly
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Anomaly {
    pub reason: AnomalyReason,
    pub message: String,
}

/// What a sync changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    /// The drive differs from its stored copy
    pub updated: bool,
    /// The device path, and with it the drive-path label, changed
    pub name_changed: bool,
    pub anomalies: Vec<Anomaly>,
}

// =============================================================================
// Status Computation
// =============================================================================

/// Reasons the device cannot be offered, empty when it can
pub fn unavailability_reasons(device: &Device, config: &ReconcilerConfig) -> Vec<String> {
    let mut reasons = Vec::new();
    if device.size < config.min_drive_size {
        reasons.push(format!("size {} below minimum {}", device.size, config.min_drive_size));
    }
    if device.read_only {
        reasons.push("read-only".to_string());
    }
    if device.partitioned {
        reasons.push("partitioned".to_string());
    }
    if device.swap_on {
        reasons.push("swap enabled".to_string());
    }
    if !device.master.is_empty() {
        reasons.push(format!("held by {}", device.master));
    }
    if !is_managed_mount(device, config) {
        reasons.push(format!("mounted at {}", device.first_mount_point()));
    }
    reasons
}

/// Whether all of the device's mounts are acceptable to the agent
///
/// An unmounted device qualifies, as does one with any mount under the
/// mount root.
fn is_managed_mount(device: &Device, config: &ReconcilerConfig) -> bool {
    device.mounts.is_empty()
        || device
            .mount_points()
            .any(|mp| Path::new(mp).starts_with(&config.mount_root))
}

/// Drive state derived purely from device properties
pub fn compute_drive_state(device: &Device, config: &ReconcilerConfig) -> DriveState {
    if unavailability_reasons(device, config).is_empty() {
        DriveState::Available
    } else {
        DriveState::Unavailable
    }
}

/// Status of a drive created for `device`
pub fn new_drive_status(device: &Device, config: &ReconcilerConfig) -> DriveStatus {
    let mut status = DriveStatus {
        path: device.dev_path(),
        root_partition: device.name.clone(),
        major_number: device.major,
        minor_number: device.minor,
        partition_num: device.partition,
        drive_status: compute_drive_state(device, config),
        logical_block_size: device.logical_block_size,
        physical_block_size: device.physical_block_size,
        filesystem: device.fs_type.clone(),
        filesystem_uuid: device.fs_uuid.clone(),
        uevent_fs_uuid: device.uevent_fs_uuid.clone(),
        mountpoint: device.first_mount_point().to_string(),
        mount_options: device.first_mount_options().to_vec(),
        model_number: device.model.clone(),
        serial_number: device.serial.clone(),
        uevent_serial: device.uevent_serial.clone(),
        wwid: device.wwid.clone(),
        vendor: device.vendor.clone(),
        dm_name: device.dm_name.clone(),
        dm_uuid: device.dm_uuid.clone(),
        md_uuid: device.md_uuid.clone(),
        part_table_uuid: device.pt_uuid.clone(),
        part_table_type: device.pt_type.clone(),
        partition_uuid: device.part_uuid.clone(),
        is_virtual: device.is_virtual,
        read_only: device.read_only,
        partitioned: device.partitioned,
        swap_on: device.swap_on,
        master: device.master.clone(),
        ..Default::default()
    };
    status.update_capacity(device.size);
    status
}

/// A new drive for `device`, named with a fresh UUID
pub fn new_drive(device: &Device, config: &ReconcilerConfig) -> Drive {
    let name = uuid::Uuid::new_v4().to_string();
    let mut drive = Drive::new(
        &name,
        DriveSpec {
            node_name: config.node_id.clone(),
            topology: config.topology.clone(),
        },
    );
    drive.set_label(NODE_LABEL, labels::sanitize_label_value(&config.node_id));
    drive.set_label(DRIVE_PATH_LABEL, labels::drive_path_label(&device.name));
    drive.set_label(CREATED_BY_LABEL, CREATED_BY_VALUE);
    drive.status = Some(new_drive_status(device, config));
    drive
}

// =============================================================================
// Sync
// =============================================================================

macro_rules! sync_field {
    ($updated:ident, $target:expr, $value:expr) => {
        if $target != $value {
            $target = $value;
            $updated = true;
        }
    };
}

macro_rules! fill_if_empty {
    ($updated:ident, $target:expr, $value:expr) => {
        if $target.is_empty() && !$value.is_empty() {
            $target = $value.clone();
            $updated = true;
        }
    };
}

/// Fold the observed device state into `drive`
///
/// Hardware identity is only filled in when missing. On active drives a
/// filesystem UUID change, a foreign mount point or a degradation to
/// unavailable is recorded as an anomaly condition and not acted upon.
pub fn sync_drive(device: &Device, drive: &mut Drive, config: &ReconcilerConfig) -> SyncOutcome {
    let mut outcome = SyncOutcome::default();
    let mut updated = false;
    let mut fs_uuid_changed = false;

    let new_path = device.dev_path();
    let path_label = labels::drive_path_label(&device.name);
    let status = drive.status.get_or_insert_with(DriveStatus::default);

    if !fs_type_equal(&status.filesystem, &device.fs_type) {
        status.filesystem = device.fs_type.clone();
        updated = true;
    }

    if status.total_capacity != device.size {
        status.update_capacity(device.size);
        updated = true;
    }

    sync_field!(updated, status.logical_block_size, device.logical_block_size);
    sync_field!(updated, status.physical_block_size, device.physical_block_size);
    sync_field!(updated, status.partition_num, device.partition);
    sync_field!(updated, status.major_number, device.major);
    sync_field!(updated, status.minor_number, device.minor);

    if status.path != new_path {
        status.path = new_path;
        outcome.name_changed = true;
        updated = true;
    }
    sync_field!(updated, status.root_partition, device.name.clone());

    fill_if_empty!(updated, status.model_number, device.model);
    fill_if_empty!(updated, status.serial_number, device.serial);
    fill_if_empty!(updated, status.uevent_serial, device.uevent_serial);
    fill_if_empty!(updated, status.wwid, device.wwid);
    fill_if_empty!(updated, status.vendor, device.vendor);

    let previous_fs_uuid = status.filesystem_uuid.clone();
    if status.filesystem_uuid != device.fs_uuid {
        status.filesystem_uuid = device.fs_uuid.clone();
        fs_uuid_changed = true;
        updated = true;
    }
    if status.uevent_fs_uuid != device.uevent_fs_uuid {
        status.uevent_fs_uuid = device.uevent_fs_uuid.clone();
        fs_uuid_changed = true;
        updated = true;
    }

    sync_field!(updated, status.partition_uuid, device.part_uuid.clone());
    sync_field!(updated, status.dm_name, device.dm_name.clone());
    sync_field!(updated, status.dm_uuid, device.dm_uuid.clone());
    sync_field!(updated, status.md_uuid, device.md_uuid.clone());
    sync_field!(updated, status.part_table_uuid, device.pt_uuid.clone());
    if !pt_type_equal(&status.part_table_type, &device.pt_type) {
        status.part_table_type = device.pt_type.clone();
        updated = true;
    }

    sync_field!(updated, status.is_virtual, device.is_virtual);
    sync_field!(updated, status.read_only, device.read_only);
    sync_field!(updated, status.partitioned, device.partitioned);
    sync_field!(updated, status.swap_on, device.swap_on);
    sync_field!(updated, status.master, device.master.clone());

    let first_mount = device.first_mount_point();
    if status.drive_status.is_active() {
        if fs_uuid_changed {
            outcome.anomalies.push(Anomaly {
                reason: AnomalyReason::Reformatted,
                message: format!(
                    "filesystem UUID changed from {:?} to {:?}",
                    previous_fs_uuid, status.filesystem_uuid
                ),
            });
        } else if !first_mount.is_empty() && status.mountpoint != first_mount {
            let expected = config.mount_root.join(&status.filesystem_uuid);
            if Path::new(first_mount) == expected {
                status.mountpoint = first_mount.to_string();
                status.mount_options = device.first_mount_options().to_vec();
                updated = true;
            } else {
                outcome.anomalies.push(Anomaly {
                    reason: AnomalyReason::MountedOutsideRoot,
                    message: format!(
                        "mounted at {} instead of {}",
                        first_mount,
                        expected.display()
                    ),
                });
            }
        }
    } else if status.mountpoint != first_mount {
        status.mountpoint = first_mount.to_string();
        status.mount_options = device.first_mount_options().to_vec();
        updated = true;
    }

    let computed = compute_drive_state(device, config);
    if computed != status.drive_status {
        if !status.drive_status.is_active() {
            status.drive_status = computed;
            updated = true;
        } else if computed == DriveState::Unavailable {
            outcome.anomalies.push(Anomaly {
                reason: AnomalyReason::Degraded,
                message: format!(
                    "{} drive became unavailable: {}",
                    status.drive_status,
                    unavailability_reasons(device, config).join(", ")
                ),
            });
        }
    }

    for anomaly in &outcome.anomalies {
        let reason = anomaly.reason.to_string();
        if status.set_condition(DriveCondition::new(ANOMALY_CONDITION, &reason, &anomaly.message)) {
            metrics::record_anomaly(&reason);
            updated = true;
        }
    }

    if drive.set_label(DRIVE_PATH_LABEL, path_label) {
        updated = true;
    }

    outcome.updated = updated;
    outcome
}

// =============================================================================
// Drive Reconciler
// =============================================================================

/// Persists drive changes derived from device snapshots
pub struct DriveReconciler {
    drives: DriveStoreRef,
    volumes: VolumeStoreRef,
    config: ReconcilerConfig,
    retry: RetryPolicy,
}

impl DriveReconciler {
    /// Create a new reconciler
    pub fn new(
        drives: DriveStoreRef,
        volumes: VolumeStoreRef,
        config: ReconcilerConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            drives,
            volumes,
            config,
            retry,
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Create a drive for a device no drive matched
    pub async fn add(&self, device: &Device) -> Result<Drive> {
        let drive = new_drive(device, &self.config);
        match self.drives.create(&drive).await {
            Ok(created) => {
                info!(
                    device = %device.name,
                    drive = %created.name(),
                    state = %created.state(),
                    "Created drive"
                );
                Ok(created)
            }
            Err(e) => {
                error!(device = %device.name, "unable to create drive: {}", e);
                Err(e)
            }
        }
    }

    /// Sync a matched drive with its device and persist the result
    ///
    /// The first attempt works on `drive` as listed; after a conflict the
    /// drive is read again and the sync recomputed. When the device path
    /// changed, the drive-path label of every volume on the drive is
    /// updated, each in its own task and retry scope, and all of them are
    /// joined before returning. Their failures are logged only.
    pub async fn update(&self, device: &Device, drive: Drive) -> Result<SyncOutcome> {
        let name = drive.name().to_string();
        let name_ref = name.as_str();
        let mut listed = Some(drive);

        let (outcome, drive) = retry_on_conflict(&self.retry, self.drives.kind(), name_ref, || {
            let cached = listed.take();
            async move {
                let mut drive = match cached {
                    Some(drive) => drive,
                    None => self.drives.get(name_ref).await?,
                };
                let outcome = sync_drive(device, &mut drive, &self.config);
                if outcome.updated {
                    drive = self.drives.update(&drive).await?;
                }
                Ok((outcome, drive))
            }
        })
        .await
        .map_err(|e| {
            error!(device = %device.name, drive = %name, "unable to update drive: {}", e);
            e
        })?;

        for anomaly in &outcome.anomalies {
            warn!(
                device = %device.name,
                drive = %name,
                reason = %anomaly.reason,
                "drive anomaly: {}",
                anomaly.message
            );
        }

        if !outcome.updated {
            debug!(device = %device.name, drive = %name, "drive is up to date");
            return Ok(outcome);
        }
        info!(device = %device.name, drive = %name, "Updated drive");

        if outcome.name_changed {
            self.sync_volume_labels(&drive).await;
        }
        Ok(outcome)
    }

    /// Handle a removal event for a matched drive
    ///
    /// Removal alone never deletes or alters a drive.
    pub async fn remove(&self, device: &Device, drive: &Drive) -> Result<()> {
        info!(
            device = %device.name,
            drive = %drive.name(),
            "device removed; drive left for operator action"
        );
        Ok(())
    }

    async fn sync_volume_labels(&self, drive: &Drive) {
        let path = drive
            .status
            .as_ref()
            .map(|s| s.path.as_str())
            .unwrap_or_default();
        let label = labels::drive_path_label(path);

        let mut tasks = JoinSet::new();
        for volume_name in drive.volume_names() {
            let volumes = self.volumes.clone();
            let policy = self.retry.clone();
            let label = label.clone();
            tasks.spawn(async move {
                let result = sync_volume_drive_path(&volumes, &policy, &volume_name, &label).await;
                (volume_name, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((volume, Ok(()))) => debug!(volume = %volume, "volume drive-path label synced"),
                Ok((volume, Err(e))) => error!(volume = %volume, "unable to update volume: {}", e),
                Err(e) => error!("volume label task failed: {}", e),
            }
        }
    }
}
