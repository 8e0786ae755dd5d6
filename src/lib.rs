//! Direct-Attached Storage Node Agent
//!
//! Watches the kernel's block-device events on a node and keeps the
//! cluster's Drive records in line with the devices actually present.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                  Netlink uevent socket (udev group)                 │
//! └───────────────────────────────┬─────────────────────────────────────┘
//!                                 │ libudev frames
//!                     ┌───────────┴───────────┐
//!                     │   Decoder + Listener  │  bounded queue
//!                     └───────────┬───────────┘
//!                   ┌─────────────┼─────────────┐
//!              ┌────┴────┐   ┌────┴────┐   ┌────┴────┐
//!              │ worker  │   │ worker  │   │ worker  │   (threadiness)
//!              └────┬────┘   └────┬────┘   └────┬────┘
//!                   └─────────────┼─────────────┘
//!   Device builder (sysfs, udev data, procfs) → identity matcher
//!                                 │
//!              ┌──────────────────┴──────────────────┐
//!              │           Drive reconciler          │
//!              │   add / update / remove, anomalies  │
//!              └──────────────────┬──────────────────┘
//!                                 │ conflict-retried writes
//!                   ┌─────────────┴─────────────┐
//!                   │  Resource store (Drives,  │
//!                   │  Volumes): kube or memory │
//!                   └───────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`uevent`]: wire decoder, netlink socket and listener worker pool
//! - [`device`]: device snapshots and host probing
//! - [`drive`]: identity matcher, drive reconciler, event handler
//! - [`volume`]: volume label sync and volume release
//! - [`crd`]: Drive and Volume custom resources
//! - [`domain`]: resource store port
//! - [`store`]: Kubernetes and in-memory store adapters
//! - [`retry`]: conflict retry
//! - [`config`]: agent configuration
//! - [`metrics`]: Prometheus counters
//! - [`error`]: error types and handling

pub mod config;
pub mod crd;
pub mod device;
pub mod domain;
pub mod drive;
pub mod error;
pub mod metrics;
pub mod retry;
pub mod store;
pub mod uevent;
pub mod volume;

// Re-export commonly used types
pub use config::{
    AgentConfig, ListenerConfig, ProbeConfig, ReconcilerConfig, MIN_SUPPORTED_DEVICE_SIZE,
};

pub use crd::{Drive, DriveSpec, DriveState, DriveStatus, Volume, VolumeSpec, VolumeStatus};

pub use device::{Device, DeviceBuilder, DeviceSource, SysfsProbe};

pub use domain::ports::{DriveStoreRef, ListFilter, ResourceStore, VolumeStoreRef};

pub use drive::{DriveEventHandler, DriveReconciler, MatchDecision, MatchOutcome};

pub use error::{Error, ErrorAction, Result};

pub use retry::{retry_on_conflict, RetryPolicy};

pub use store::{KubeStore, MemoryStore};

pub use uevent::{Action, Listener, UEvent, UeventHandler, UeventSocket};

pub use volume::{ReleaseOutcome, VolumeReleaser};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
