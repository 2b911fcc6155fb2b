//! Runtime error types of the monitoring pipeline.
//!
//! None of these stop the sampling loop: read errors skip a cycle, delivery
//! errors fall back to the offline queue and queue errors are logged.

use std::io;

use stacklight_mqtt::TransferError;
use thiserror::Error;

/// A reading could not be obtained.
#[derive(Debug, Error)]
pub enum SampleError {
    #[error("sample source I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed reading {line:?}: {reason}")]
    Malformed { line: String, reason: String },

    /// The source reached end of stream.
    #[error("sample source closed")]
    Closed,

    #[error("no reading within {0:?}")]
    Timeout(std::time::Duration),

    /// Every sub-reading of an averaged sample failed.
    #[error("all {0} sub-readings failed")]
    NoValidReadings(u32),
}

impl SampleError {
    pub(crate) fn malformed(line: &str, reason: impl Into<String>) -> Self {
        SampleError::Malformed {
            line: line.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("offline queue I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}
