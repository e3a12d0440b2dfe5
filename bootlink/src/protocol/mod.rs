//! Wire protocol: CRC engine and frame codec.

pub mod crc;
pub mod frame;

// Re-export common types
pub use frame::{CommandKind, DeviceInfo, Frame, DEVICE_INFO_LEN, FRAME_HEADER, MAX_PAYLOAD};
