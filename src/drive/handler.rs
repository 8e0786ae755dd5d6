//! Drive Event Handler
//!
//! Glue between the uevent listener and the drive reconciler: builds the
//! device snapshot, finds the drive it corresponds to and dispatches on
//! the event action.

use super::matcher::{run_matcher, MatchDecision};
use super::reconciler::DriveReconciler;
use crate::crd::labels::{self, DRIVE_PATH_LABEL, NODE_LABEL};
use crate::crd::Drive;
use crate::device::probe::parse_uevent_file;
use crate::device::{Device, DeviceBuilder};
use crate::domain::ports::{DriveStoreRef, ListFilter};
use crate::error::{Error, Result};
use crate::metrics;
use crate::uevent::event::{ACTION_KEY, DEVPATH_KEY, SUBSYSTEM_KEY, BLOCK_SUBSYSTEM};
use crate::uevent::{Action, UEvent, UeventHandler};
use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Handles block-device uevents for one node
pub struct DriveEventHandler {
    builder: DeviceBuilder,
    reconciler: DriveReconciler,
    drives: DriveStoreRef,
    /// sysfs root walked by [`DriveEventHandler::resync`]
    sysfs_path: PathBuf,
}

impl DriveEventHandler {
    /// Create a new handler
    pub fn new(
        builder: DeviceBuilder,
        reconciler: DriveReconciler,
        drives: DriveStoreRef,
        sysfs_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            builder,
            reconciler,
            drives,
            sysfs_path: sysfs_path.into(),
        }
    }

    /// Find the drive recorded for `device` on this node
    ///
    /// Candidates are narrowed by the drive-path label first. When none of
    /// them matches, all drives of the node are considered, so a device
    /// that came back under a new name is still recognised.
    async fn find_drive(&self, device: &Device) -> Result<Option<Drive>> {
        let node = labels::sanitize_label_value(&self.reconciler.config().node_id);
        let node_filter = ListFilter::new().label(NODE_LABEL, node);
        let path_filter = node_filter
            .clone()
            .label(DRIVE_PATH_LABEL, labels::drive_path_label(&device.name));

        let by_path = self.drives.list(&path_filter).await?;
        let by_node: Vec<Drive>;
        let mut decision = run_matcher(device, &by_path);
        if let MatchDecision::NoMatch = decision {
            by_node = self.drives.list(&node_filter).await?;
            decision = run_matcher(device, &by_node);
        }

        metrics::record_match(decision.label());
        match decision {
            MatchDecision::Matched(drive) => Ok(Some(drive.clone())),
            MatchDecision::NoMatch => Ok(None),
            MatchDecision::Ambiguous(count) => {
                error!(
                    device = %device.name,
                    "device has too many matching drives ({}); operator action required",
                    count
                );
                Err(Error::AmbiguousMatch {
                    device: device.name.clone(),
                    count,
                })
            }
        }
    }

    /// Replay a `change` event for every block device present in sysfs
    ///
    /// Failures are logged per device and do not stop the walk. Returns the
    /// number of devices handled successfully.
    pub async fn resync(&self) -> Result<usize> {
        let class_dir = self.sysfs_path.join("class/block");
        let mut entries: Vec<PathBuf> = fs::read_dir(&class_dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .collect();
        entries.sort();

        let mut handled = 0;
        for entry in entries {
            let event = match self.synthesize_event(&entry) {
                Ok(event) => event,
                Err(e) => {
                    warn!("skipping {} during resync: {}", entry.display(), e);
                    continue;
                }
            };
            match self.handle(event).await {
                Ok(()) => handled += 1,
                Err(e) => warn!("resync of {} failed: {}", entry.display(), e),
            }
        }

        info!("Resynced {} block devices", handled);
        Ok(handled)
    }

    fn synthesize_event(&self, entry: &Path) -> Result<UEvent> {
        let target = fs::read_link(entry)?;
        let mut relative = target.to_string_lossy().into_owned();
        while let Some(rest) = relative.strip_prefix("../") {
            relative = rest.to_string();
        }

        let mut properties = parse_uevent_file(&fs::read_to_string(entry.join("uevent"))?);
        properties.insert(SUBSYSTEM_KEY.to_string(), BLOCK_SUBSYSTEM.to_string());
        properties.insert(ACTION_KEY.to_string(), Action::Change.to_string());
        properties.insert(DEVPATH_KEY.to_string(), format!("/{}", relative));
        UEvent::from_properties(properties)
    }
}

#[async_trait]
impl UeventHandler for DriveEventHandler {
    async fn handle(&self, event: UEvent) -> Result<()> {
        let device = match self.builder.build(&event) {
            Ok(Some(device)) => device,
            Ok(None) => return Ok(()),
            Err(e) => {
                error!(
                    device = %event.name(),
                    action = %event.action,
                    "unable to build device: {}",
                    e
                );
                return Ok(());
            }
        };

        let drive = self.find_drive(&device).await?;
        match (drive, event.action) {
            (None, Action::Remove) => {
                info!(device = %device.name, "removed device has no matching drive");
                Ok(())
            }
            (None, _) => self.reconciler.add(&device).await.map(|_| ()),
            (Some(drive), Action::Remove) => self.reconciler.remove(&device, &drive).await,
            (Some(drive), _) => {
                debug!(device = %device.name, drive = %drive.name(), "device matched drive");
                self.reconciler.update(&device, drive).await.map(|_| ())
            }
        }
    }
}
