//! # bootlink
//!
//! A library for driving embedded resident bootloaders over a serial link.
//!
//! bootlink is the host side of a firmware update: it negotiates boot-mode
//! entry, streams an image in CRC-protected fragments, asks the target to
//! verify the result, and commands the jump into the new application.
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: CRC-32 engine and the framed request/reply codec
//! - **Image**: firmware store with digest and per-fragment CRC map
//! - **Port**: byte-stream abstraction (native serial, scripted mock)
//! - **Transport**: background reader, frame mailbox, send-and-await
//! - **Scheduler**: FIFO command queue with per-command response policies
//! - **Session**: high-level workflows and the boot status machine
//! - **Event**: tagged event channel for UI decoupling
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use bootlink::{LogSink, NativePort, TransferConfig, UpdateSession};
//!
//! fn main() -> bootlink::Result<()> {
//!     let port = NativePort::open_simple("/dev/ttyUSB0", 115_200)?;
//!     let session = UpdateSession::open(
//!         Box::new(port),
//!         TransferConfig::default(),
//!         Arc::new(LogSink),
//!     )?;
//!
//!     session.load_firmware("app.bin", 1024, 0x0800_0000)?;
//!     let result = session.flash()?;
//!     if !result.success {
//!         eprintln!("update failed: {}", result.error);
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod event;
pub mod host;
pub mod image;
pub mod port;
pub mod protocol;
pub mod scheduler;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use {
    error::{Error, Result},
    event::{BootStatus, EventSink, LogSink, NullSink, UpdaterEvent},
    host::{discover_ports, find_port},
    image::firmware::{FirmwareImage, FirmwareSummary, MAX_FRAGMENT_SIZE, MAX_IMAGE_SIZE},
    port::{mock::MockPort, native::NativePort, Port, PortInfo, SerialConfig},
    protocol::frame::{CommandKind, DeviceInfo, Frame},
    scheduler::{CommandItem, CommandResult, ResponseAction, Scheduler},
    session::{
        enter_boot_policy, run_app_policy, upload_policy, verify_policy, UpdateSession,
    },
    transport::{TransferConfig, Transport},
};
