//! Volume maintenance
//!
//! - [`sync`]: keep volume labels in line with their drive
//! - [`release`]: finalize deleted volumes and return their capacity

pub mod release;
pub mod sync;

pub use release::{ReleaseOutcome, VolumeReleaser};
pub use sync::{sync_volume_drive_path, sync_volume_labels, volume_labels};
