//! The error type returned by every engine operation.
//!
//! Variants map one-to-one onto the failure classes an operator has to tell
//! apart: a missing tool, a malformed image, a failing pipeline stage, a
//! target that is too small, a kernel that never showed the new partitions,
//! and hashing failures. Nothing in the engine downgrades one of these to a
//! partial success.
use crate::command::Stage;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Error types for clone, backup, restore and verify operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Required tool not found: {0}")]
    ToolMissing(String),

    #[error("{0}")]
    ImageFormat(String),

    #[error("{stage} stage failed ({status}) running `{command}`: {detail}")]
    CommandFailed {
        stage: Stage,
        command: String,
        status: String,
        detail: String,
    },

    #[error("Target too small: {required} bytes required, target has {target} bytes")]
    SizeInsufficient { required: u64, target: u64 },

    #[error(
        "Expected {expected} partitions but the kernel reports {observed} (attempts: {})",
        .attempts.join("; ")
    )]
    PartitionCountMismatch {
        expected: usize,
        observed: usize,
        attempts: Vec<String>,
    },

    #[error("Hashing {target} timed out after {}s", .timeout.as_secs())]
    HashTimeout { target: String, timeout: Duration },

    #[error("Verification failed: {partition} does not match its source")]
    HashMismatch { partition: String },

    #[error(
        "Nothing could be verified: {} hold partclone images that cannot be compared",
        .skipped.join(", ")
    )]
    NothingVerified { skipped: Vec<String> },

    #[error("Target is not a removable drive: {0}")]
    NotRemovable(String),

    #[error("Source and target are the same device: {}", .0.display())]
    SameDevice(PathBuf),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to unmount {0}")]
    UnmountFailed(String),

    #[error("Cannot pair partitions: {0}")]
    PartitionMapping(String),

    #[error("Partition layout error: {0}")]
    Layout(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid configuration: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Could not parse device listing: {0}")]
    DeviceListing(#[from] serde_json::Error),

    #[error("System call failed: {0}")]
    Sys(#[from] nix::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The pipeline stage blamed for a [`Error::CommandFailed`].
    pub fn failed_stage(&self) -> Option<Stage> {
        match self {
            Error::CommandFailed { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_failure_names_stage_and_detail() {
        let err = Error::CommandFailed {
            stage: Stage::Decompress,
            command: "gzip -dc".into(),
            status: "exit status: 1".into(),
            detail: "gzip: stdin: not in gzip format".into(),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("decompress stage failed"));
        assert!(msg.ends_with("not in gzip format"));
        assert_eq!(err.failed_stage(), Some(Stage::Decompress));
    }

    #[test]
    fn mismatch_lists_attempts() {
        let err = Error::PartitionCountMismatch {
            expected: 2,
            observed: 0,
            attempts: vec!["sgdisk: 0".into(), "sf: 1".into()],
        };
        assert!(err.to_string().contains("sgdisk: 0; sf: 1"));
    }

    #[test]
    fn nothing_verified_names_skipped_partitions() {
        let err = Error::NothingVerified {
            skipped: vec!["sda1".into(), "sda2".into()],
        };
        assert!(err.to_string().contains("sda1, sda2"));
    }
}
