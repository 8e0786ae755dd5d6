//! Error types for the node agent
//!
//! Provides structured error types for every stage of device handling:
//! wire decoding, snapshot building, identity matching, resource store
//! access and volume release.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the agent
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Wire Decode Errors
    // =========================================================================
    #[error("uevent message too short: {len} bytes, need at least {min}")]
    MessageTooShort { len: usize, min: usize },

    #[error("libudev signature not found")]
    MissingSignature,

    #[error("libudev magic mismatch; expected: {expected:#x}, found: {found:#x}")]
    MagicMismatch { expected: u32, found: u32 },

    #[error("invalid payload offset {offset} for message length {len}")]
    InvalidPayloadOffset { offset: usize, len: usize },

    #[error("uevent is not for a block device (subsystem {subsystem:?})")]
    NonBlockDevice { subsystem: String },

    #[error("invalid uevent action: {action:?}")]
    InvalidAction { action: String },

    #[error("uevent does not have a valid DEVPATH")]
    MissingDevPath,

    // =========================================================================
    // Device Snapshot Errors
    // =========================================================================
    #[error("invalid {field} value {value:?}")]
    InvalidNumber { field: String, value: String },

    #[error("Device probe failed for {device}: {reason}")]
    DeviceProbe { device: String, reason: String },

    // =========================================================================
    // Matching Errors
    // =========================================================================
    #[error("device {device} has too many matches ({count} drives)")]
    AmbiguousMatch { device: String, count: usize },

    // =========================================================================
    // Resource Store Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    ResourceExists { kind: String, name: String },

    #[error("Conflicting write to {kind}/{name}")]
    Conflict { kind: String, name: String },

    #[error("Gave up updating {kind}/{name} after {attempts} conflicting attempts")]
    RetryExhausted {
        kind: String,
        name: String,
        attempts: u32,
    },

    // =========================================================================
    // Volume Errors
    // =========================================================================
    #[error("volume {name} is still published; waiting for release before cleanup")]
    VolumePublished { name: String },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Kube(_) | Error::Conflict { .. } | Error::Io(_) => {
                ErrorAction::RequeueWithBackoff
            }

            // Waiting on another actor to unpublish
            Error::VolumePublished { .. } => ErrorAction::RequeueAfter(Duration::from_secs(30)),

            // Budget spent - give the other writer time to settle
            Error::RetryExhausted { .. } => ErrorAction::RequeueAfter(Duration::from_secs(60)),

            // Operator attention required or malformed input - never retry automatically
            Error::AmbiguousMatch { .. }
            | Error::Configuration(_)
            | Error::InvalidNumber { .. }
            | Error::MessageTooShort { .. }
            | Error::MissingSignature
            | Error::MagicMismatch { .. }
            | Error::InvalidPayloadOffset { .. }
            | Error::NonBlockDevice { .. }
            | Error::InvalidAction { .. }
            | Error::MissingDevPath => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 409,
            _ => false,
        }
    }

    /// Check if the referenced resource does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::ResourceNotFound { .. } => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    /// Check if this error came out of the uevent wire decoder
    pub fn is_decode_error(&self) -> bool {
        matches!(
            self,
            Error::MessageTooShort { .. }
                | Error::MissingSignature
                | Error::MagicMismatch { .. }
                | Error::InvalidPayloadOffset { .. }
                | Error::NonBlockDevice { .. }
                | Error::InvalidAction { .. }
                | Error::MissingDevPath
        )
    }
}

/// Result type alias for the agent
pub type Result<T> = std::result::Result<T, Error>;
