//! Bootloader frame codec.
//!
//! All host/target traffic uses a single frame format:
//!
//! ```text
//! +--------+-----+--------+---------------+-------+
//! | Header | Cmd | Length |    Payload    | Cksum |
//! +--------+-----+--------+---------------+-------+
//! | 2      | 1   | 2 LE   |   variable    | 1     |
//! +--------+-----+--------+---------------+-------+
//! | AA 55  | cmd | len    |  payload[len] | ~sum  |
//! +--------+-----+--------+---------------+-------+
//! ```
//!
//! The checksum is the bitwise complement of the 8-bit sum of every byte
//! from the command byte through the last payload byte, header excluded.

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use crate::error::{Error, Result};

/// Fixed two-byte frame header.
pub const FRAME_HEADER: [u8; 2] = [0xAA, 0x55];

/// Bytes of framing around the payload: header(2) + cmd(1) + len(2) + cksum(1).
pub const FRAME_OVERHEAD: usize = 6;

/// Maximum payload carried by one frame (16-bit length field).
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// Size of the device information record in an enter-boot reply.
pub const DEVICE_INFO_LEN: usize = 60;

/// Command byte values, stable on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandKind {
    /// Request boot-mode entry; reply carries a [`DeviceInfo`] record.
    EnterBoot = 0x01,
    /// Carry one firmware fragment.
    Upload = 0x02,
    /// Request verification of the delivered image.
    Verify = 0x03,
    /// Command a jump to the new application.
    RunApp = 0x04,
    /// Positive acknowledgement.
    Ack = 0x05,
    /// Negative acknowledgement.
    Nack = 0x06,
    /// Device-side failure; payload is free-form UTF-8 text.
    ErrorResponse = 0x07,
}

impl CommandKind {
    /// Map a wire byte to a command kind. Unknown bytes are parse rejections.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::EnterBoot),
            0x02 => Some(Self::Upload),
            0x03 => Some(Self::Verify),
            0x04 => Some(Self::RunApp),
            0x05 => Some(Self::Ack),
            0x06 => Some(Self::Nack),
            0x07 => Some(Self::ErrorResponse),
            _ => None,
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::EnterBoot => "EnterBoot",
            Self::Upload => "Upload",
            Self::Verify => "Verify",
            Self::RunApp => "RunApp",
            Self::Ack => "Ack",
            Self::Nack => "Nack",
            Self::ErrorResponse => "ErrorResponse",
        };
        write!(f, "{name}")
    }
}

/// One protocol frame: a command kind plus its payload.
///
/// Header, length field, and checksum are derived during encoding, never
/// stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    kind: CommandKind,
    payload: Vec<u8>,
}

impl Frame {
    /// Create a frame, rejecting payloads the length field cannot express.
    pub fn new(kind: CommandKind, payload: Vec<u8>) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD {
            return Err(Error::OversizedPayload(payload.len()));
        }
        Ok(Self { kind, payload })
    }

    /// Create a payload-less frame.
    pub fn empty(kind: CommandKind) -> Self {
        Self {
            kind,
            payload: Vec::new(),
        }
    }

    /// The command kind.
    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    /// The payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Serialize to wire bytes. Cannot fail: payload size was checked at
    /// construction.
    #[allow(clippy::cast_possible_truncation)]
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRAME_OVERHEAD + self.payload.len());
        buf.extend_from_slice(&FRAME_HEADER);
        buf.push(self.kind as u8);
        buf.write_u16::<LittleEndian>(self.payload.len() as u16).unwrap();
        buf.extend_from_slice(&self.payload);
        buf.push(checksum(&buf[2..]));
        buf
    }

    /// Parse a complete frame buffer.
    ///
    /// Rejects short buffers, header mismatches, length-field disagreement,
    /// checksum mismatches, and unrecognized command bytes. Partial-frame
    /// assembly happens upstream in the transport.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < FRAME_OVERHEAD {
            return Err(Error::MalformedFrame(format!(
                "truncated: {} bytes, need at least {FRAME_OVERHEAD}",
                buf.len()
            )));
        }
        if buf[0..2] != FRAME_HEADER {
            return Err(Error::MalformedFrame(format!(
                "bad header: {:02X} {:02X}",
                buf[0], buf[1]
            )));
        }
        let declared = LittleEndian::read_u16(&buf[3..5]) as usize;
        if buf.len() != FRAME_OVERHEAD + declared {
            return Err(Error::MalformedFrame(format!(
                "length mismatch: declared {declared}, buffer holds {}",
                buf.len() - FRAME_OVERHEAD
            )));
        }
        let expected = checksum(&buf[2..buf.len() - 1]);
        let actual = buf[buf.len() - 1];
        if actual != expected {
            return Err(Error::MalformedFrame(format!(
                "checksum mismatch: expected {expected:#04X}, got {actual:#04X}"
            )));
        }
        let kind = CommandKind::from_byte(buf[2]).ok_or_else(|| {
            Error::MalformedFrame(format!("unknown command byte {:#04X}", buf[2]))
        })?;
        Ok(Self {
            kind,
            payload: buf[5..buf.len() - 1].to_vec(),
        })
    }
}

/// Bitwise complement of the 8-bit sum of `body` (command byte through last
/// payload byte).
fn checksum(body: &[u8]) -> u8 {
    !body.iter().fold(0u8, |sum, &b| sum.wrapping_add(b))
}

/// Device information returned in the payload of an enter-boot reply.
///
/// Fixed 60-byte little-endian record:
///
/// ```text
/// model:32 UTF-8 NUL-padded | flash_size:4 | app_addr:4 | frag_size:4 |
/// boot_version:16 UTF-8 NUL-padded
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Device model string, trailing NULs stripped.
    pub model: String,
    /// Flash size in bytes.
    pub flash_size: u32,
    /// Application load address.
    pub app_addr: u32,
    /// Fragment size the bootloader prefers.
    pub fragment_size: u32,
    /// Bootloader version string, trailing NULs stripped.
    pub boot_version: String,
}

impl DeviceInfo {
    const MODEL_LEN: usize = 32;
    const VERSION_LEN: usize = 16;

    /// Parse a device information record from an enter-boot reply payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() != DEVICE_INFO_LEN {
            return Err(Error::MalformedFrame(format!(
                "device info is {} bytes, expected {DEVICE_INFO_LEN}",
                payload.len()
            )));
        }
        let model = read_padded_str(&payload[0..Self::MODEL_LEN]);
        let flash_size = LittleEndian::read_u32(&payload[32..36]);
        let app_addr = LittleEndian::read_u32(&payload[36..40]);
        let fragment_size = LittleEndian::read_u32(&payload[40..44]);
        let boot_version = read_padded_str(&payload[44..44 + Self::VERSION_LEN]);
        Ok(Self {
            model,
            flash_size,
            app_addr,
            fragment_size,
            boot_version,
        })
    }

    /// Serialize back to the 60-byte wire record, restoring NUL padding.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.model.len() > Self::MODEL_LEN {
            return Err(Error::Config(format!(
                "model string exceeds {} bytes",
                Self::MODEL_LEN
            )));
        }
        if self.boot_version.len() > Self::VERSION_LEN {
            return Err(Error::Config(format!(
                "boot version string exceeds {} bytes",
                Self::VERSION_LEN
            )));
        }
        let mut buf = Vec::with_capacity(DEVICE_INFO_LEN);
        write_padded_str(&mut buf, &self.model, Self::MODEL_LEN);
        buf.write_u32::<LittleEndian>(self.flash_size).unwrap();
        buf.write_u32::<LittleEndian>(self.app_addr).unwrap();
        buf.write_u32::<LittleEndian>(self.fragment_size).unwrap();
        write_padded_str(&mut buf, &self.boot_version, Self::VERSION_LEN);
        Ok(buf)
    }
}

impl std::fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (flash {} bytes, app @ 0x{:08X}, fragment size {}, bootloader {})",
            self.model, self.flash_size, self.app_addr, self.fragment_size, self.boot_version
        )
    }
}

/// Decode a NUL-padded UTF-8 field, stripping the padding.
fn read_padded_str(field: &[u8]) -> String {
    let end = field.iter().position(|&c| c == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).to_string()
}

/// Encode a string into a fixed-width NUL-padded field.
fn write_padded_str(buf: &mut Vec<u8>, value: &str, width: usize) {
    buf.extend_from_slice(value.as_bytes());
    buf.resize(buf.len() + width - value.len(), 0);
}
