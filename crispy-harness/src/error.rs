//! Error types for crispy-harness.

use std::io;
use thiserror::Error;

/// Result type for crispy-harness operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for crispy-harness operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (files, pipes, mount points).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Malformed JSON from an external tool (lsblk).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A USB identity or mass-storage volume never appeared.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// An external program reported failure.
    #[error("Command failed: {command}\n{output}")]
    CommandFailed {
        /// The rendered command line.
        command: String,
        /// Combined stdout and stderr of the failed run.
        output: String,
    },

    /// A bounded wait exceeded its deadline.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A UF2 frame or image failed validation.
    #[error("Invalid UF2 image: {0}")]
    InvalidImage(String),

    /// Textual output from a device or tool could not be interpreted.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Unsupported operation.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether this error means the device or volume never showed up.
    pub fn is_device_not_found(&self) -> bool {
        matches!(self, Self::DeviceNotFound(_))
    }

    /// Whether this error is a deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}
