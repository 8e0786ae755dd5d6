//! Drive discovery and reconciliation
//!
//! - [`matcher`]: tri-state identity matching of devices against drives
//! - [`reconciler`]: drive creation and sync from device snapshots
//! - [`handler`]: uevent dispatch and sysfs resync

pub mod handler;
pub mod matcher;
pub mod reconciler;

pub use handler::DriveEventHandler;
pub use matcher::{run_matcher, MatchDecision, MatchOutcome};
pub use reconciler::{
    compute_drive_state, new_drive, new_drive_status, sync_drive, AnomalyReason, DriveReconciler,
    SyncOutcome,
};
