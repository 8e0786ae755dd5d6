//! Volume label sync
//!
//! Volumes carry labels that mirror their drive (node, device name, drive
//! resource name). These helpers bring them back in line after a drive is
//! renamed and, at startup, for every volume of the node.

use crate::crd::labels::{
    self, CREATED_BY_LABEL, CREATED_BY_VALUE, DRIVE_LABEL, DRIVE_PATH_LABEL, NODE_LABEL,
};
use crate::crd::{Drive, Volume};
use crate::domain::ports::{DriveStoreRef, ListFilter, VolumeStoreRef};
use crate::error::Result;
use crate::retry::{retry_on_conflict, RetryPolicy};
use std::collections::BTreeMap;
use tracing::{debug, error, info};

/// Set the drive-path label of one volume
pub async fn sync_volume_drive_path(
    volumes: &VolumeStoreRef,
    policy: &RetryPolicy,
    volume_name: &str,
    label: &str,
) -> Result<()> {
    retry_on_conflict(policy, volumes.kind(), volume_name, || async move {
        let mut volume = volumes.get(volume_name).await?;
        if volume.set_label(DRIVE_PATH_LABEL, label) {
            volumes.update(&volume).await?;
        }
        Ok(())
    })
    .await
}

/// Labels a volume should carry given its drive
///
/// Drive name and drive path are only set while the drive still records
/// the volume as allocated on it.
pub fn volume_labels(volume: &Volume, drive: Option<&Drive>) -> BTreeMap<String, String> {
    let holder = drive.filter(|d| d.holds_volume(volume.name()));
    let drive_path = holder
        .and_then(|d| d.status.as_ref())
        .map(|s| labels::drive_path_label(&s.path))
        .unwrap_or_default();
    let drive_name = holder
        .map(|d| labels::sanitize_label_value(d.name()))
        .unwrap_or_default();

    BTreeMap::from([
        (
            NODE_LABEL.to_string(),
            labels::sanitize_label_value(&volume.spec.node_name),
        ),
        (DRIVE_PATH_LABEL.to_string(), drive_path),
        (DRIVE_LABEL.to_string(), drive_name),
        (CREATED_BY_LABEL.to_string(), CREATED_BY_VALUE.to_string()),
    ])
}

/// Rewrite the labels of every volume on `node_id`
///
/// Each volume is updated in its own retry scope; failures are logged and
/// skipped. Returns the number of volumes written.
pub async fn sync_volume_labels(
    drives: &DriveStoreRef,
    volumes: &VolumeStoreRef,
    policy: &RetryPolicy,
    node_id: &str,
) -> Result<usize> {
    let names: Vec<String> = volumes
        .list(&ListFilter::new())
        .await?
        .into_iter()
        .filter(|v| v.spec.node_name == node_id)
        .map(|v| v.name().to_string())
        .collect();

    let mut written = 0;
    for name in &names {
        let result = retry_on_conflict(policy, volumes.kind(), name, || async move {
            let mut volume = volumes.get(name).await?;
            let drive = match drives.get(&volume.spec.drive_name).await {
                Ok(drive) => Some(drive),
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e),
            };

            let mut changed = false;
            for (key, value) in volume_labels(&volume, drive.as_ref()) {
                changed |= volume.set_label(&key, value);
            }
            if changed {
                volumes.update(&volume).await?;
            }
            Ok(changed)
        })
        .await;

        match result {
            Ok(true) => written += 1,
            Ok(false) => debug!(volume = %name, "volume labels up to date"),
            Err(e) => error!(volume = %name, "unable to sync volume labels: {}", e),
        }
    }

    info!("Synced labels of {} of {} volumes", written, names.len());
    Ok(written)
}
