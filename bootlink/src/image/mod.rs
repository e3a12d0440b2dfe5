//! Firmware image handling.

pub mod firmware;

pub use firmware::{FirmwareImage, FirmwareSummary, MAX_IMAGE_SIZE};
