//! Error types for bootlink.

use std::io;
use thiserror::Error;

/// Result type for bootlink operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for bootlink operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Firmware file rejected: missing, unreadable, empty, or oversize.
    #[error("File error: {0}")]
    File(String),

    /// Frame failed to decode.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Payload exceeds the 16-bit length field of a frame.
    #[error("Payload too large: {0} bytes (max 65535)")]
    OversizedPayload(usize),

    /// Fragment index past the end of the loaded image.
    #[error("Fragment {index} out of range (image has {count})")]
    FragmentOutOfRange {
        /// Requested fragment index.
        index: u32,
        /// Number of fragments in the image.
        count: u32,
    },

    /// Attempt to use a closed byte stream.
    #[error("Transport closed")]
    TransportClosed,

    /// No expected reply within the configured retry budget.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Target returned an error response; carries the decoded payload.
    #[error("Device error: {0}")]
    Device(String),

    /// A scheduler run is already in progress.
    #[error("A command run is already in progress")]
    QueueBusy,

    /// Stored digest or CRC no longer matches the image buffer.
    #[error("Integrity check failed: {0}")]
    Integrity(String),

    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation requires a loaded firmware image.
    #[error("No firmware image loaded")]
    NoFirmware,
}
