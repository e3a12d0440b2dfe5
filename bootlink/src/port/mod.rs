//! Byte-stream port abstraction.
//!
//! The protocol layer never touches a serial port directly: it goes through
//! the [`Port`] trait, so the same transport runs over real hardware
//! ([`native::NativePort`]) or a scripted in-memory stream
//! ([`mock::MockPort`]) in tests.

pub mod mock;
pub mod native;

use std::io::{Read, Write};
use std::time::Duration;

use crate::error::Result;

/// Serial port configuration.
///
/// Framing is fixed at 8N1 with no flow control; the resident bootloaders
/// this crate targets speak nothing else.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read/write timeout.
    pub timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 115_200,
            timeout: Duration::from_millis(50),
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the read/write timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Serial port information from enumeration.
#[derive(Debug, Clone, Default)]
pub struct PortInfo {
    /// Port name/path.
    pub name: String,
    /// USB vendor ID (if available).
    pub vid: Option<u16>,
    /// USB product ID (if available).
    pub pid: Option<u16>,
    /// Manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial_number: Option<String>,
}

/// Unified trait for the byte stream the transport owns.
pub trait Port: Read + Write + Send {
    /// Set the read timeout for subsequent reads.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Get the current read timeout.
    fn timeout(&self) -> Duration;

    /// Clear input/output buffers.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Create a second handle onto the same stream for a background read
    /// loop. Reads on the clone observe the same byte stream as the
    /// original.
    fn try_clone_reader(&self) -> Result<Box<dyn Port>>;

    /// Close the port and release resources. Further I/O fails.
    fn close(&mut self) -> Result<()>;
}
