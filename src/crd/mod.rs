//! Custom Resource Definitions for the node agent
//!
//! This module contains all CRD types:
//! - Drive: a managed block device and its capacity bookkeeping
//! - Volume: a capacity reservation on a drive
//!
//! plus the label and finalizer conventions linking the two.

pub mod drive;
pub mod labels;
pub mod volume;

pub use drive::*;
pub use volume::*;
