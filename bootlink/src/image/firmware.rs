//! Firmware image store.
//!
//! Loads a firmware file into memory, computes its integrity data (MD5
//! digest, whole-image CRC-32, per-fragment CRC-32 map), and materializes the
//! upload payloads the bootloader expects. A [`FirmwareImage`] is immutable
//! once loaded; a new load replaces it wholesale.

use byteorder::{LittleEndian, WriteBytesExt};
use log::{debug, warn};
use md5::{Digest, Md5};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::error::{Error, Result};
use crate::protocol::crc;
use crate::protocol::frame::MAX_PAYLOAD;

/// Upper bound on firmware file size. A policy limit, not a wire limit.
pub const MAX_IMAGE_SIZE: usize = 10 * 1024 * 1024;

/// Fixed bytes in an upload payload around the fragment data:
/// index(4) + total(4) + crc32(4).
const FRAGMENT_FRAMING: usize = 12;

/// Largest fragment size for which an upload payload still fits one frame.
pub const MAX_FRAGMENT_SIZE: usize = MAX_PAYLOAD - FRAGMENT_FRAMING;

/// An immutable, integrity-checked firmware image.
#[derive(Clone)]
pub struct FirmwareImage {
    name: String,
    path: PathBuf,
    data: Vec<u8>,
    modified: SystemTime,
    digest: String,
    crc32: u32,
    fragment_size: usize,
    fragment_crcs: Vec<u32>,
    load_addr: u32,
}

impl FirmwareImage {
    /// Load a firmware file and compute its integrity data.
    ///
    /// Fails on an empty path, a missing or unreadable file, an empty file,
    /// or a file larger than [`MAX_IMAGE_SIZE`].
    pub fn load<P: AsRef<Path>>(path: P, fragment_size: usize, load_addr: u32) -> Result<Self> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(Error::File("no firmware path given".into()));
        }
        if fragment_size == 0 || fragment_size > MAX_FRAGMENT_SIZE {
            return Err(Error::Config(format!(
                "fragment size must be 1..={MAX_FRAGMENT_SIZE}, got {fragment_size}"
            )));
        }

        debug!("Loading firmware from: {}", path.display());
        let data = fs::read(path)
            .map_err(|e| Error::File(format!("cannot read {}: {e}", path.display())))?;
        if data.is_empty() {
            return Err(Error::File(format!("{} is empty", path.display())));
        }
        if data.len() > MAX_IMAGE_SIZE {
            return Err(Error::File(format!(
                "{} is {} bytes, exceeds the {MAX_IMAGE_SIZE} byte limit",
                path.display(),
                data.len()
            )));
        }

        let modified = fs::metadata(path)
            .and_then(|m| m.modified())
            .unwrap_or_else(|_| SystemTime::now());

        let digest = hex_digest(&data);
        debug!("Image MD5: {digest}");
        let whole_crc = crc::crc32(&data);
        debug!("Image CRC32: {whole_crc:#010X}");
        let fragment_crcs = crc::fragment_crcs(&data, fragment_size);
        debug!(
            "Fragment CRC map: {} entries of {fragment_size} bytes",
            fragment_crcs.len()
        );

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        Ok(Self {
            name,
            path: path.to_path_buf(),
            data,
            modified,
            digest,
            crc32: whole_crc,
            fragment_size,
            fragment_crcs,
            load_addr,
        })
    }

    /// Recompute digest, whole-image CRC, and every fragment CRC from the
    /// in-memory buffer and compare against the stored values.
    ///
    /// Passes only when all three checks pass. A failure names the check that
    /// failed and leaves the image untouched.
    pub fn validate(&self) -> Result<()> {
        let digest = hex_digest(&self.data);
        if digest != self.digest {
            warn!("Validation failed: digest {digest} != stored {}", self.digest);
            return Err(Error::Integrity("image digest mismatch".into()));
        }
        let whole_crc = crc::crc32(&self.data);
        if whole_crc != self.crc32 {
            warn!(
                "Validation failed: CRC32 {whole_crc:#010X} != stored {:#010X}",
                self.crc32
            );
            return Err(Error::Integrity("image CRC32 mismatch".into()));
        }
        for (index, chunk) in self.data.chunks(self.fragment_size).enumerate() {
            if !crc::verify(chunk, self.fragment_crcs[index]) {
                warn!("Validation failed: fragment {index} CRC mismatch");
                return Err(Error::Integrity(format!("fragment {index} CRC mismatch")));
            }
        }
        debug!("Image validation passed ({} fragments)", self.fragment_count());
        Ok(())
    }

    /// Number of fragments: ceil(len / fragment_size).
    #[allow(clippy::cast_possible_truncation)]
    pub fn fragment_count(&self) -> u32 {
        self.data.len().div_ceil(self.fragment_size) as u32
    }

    /// The data slice of fragment `index`, shorter than the fragment size for
    /// the final fragment of an uneven image.
    pub fn fragment_data(&self, index: u32) -> Result<&[u8]> {
        let count = self.fragment_count();
        if index >= count {
            return Err(Error::FragmentOutOfRange { index, count });
        }
        let start = index as usize * self.fragment_size;
        let end = (start + self.fragment_size).min(self.data.len());
        Ok(&self.data[start..end])
    }

    /// Build the upload payload for fragment `index`:
    ///
    /// ```text
    /// index:4 LE | total:4 LE | data | crc32:4 LE
    /// ```
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn build_fragment(&self, index: u32) -> Result<Vec<u8>> {
        let data = self.fragment_data(index)?;
        let mut payload = Vec::with_capacity(FRAGMENT_FRAMING + data.len());
        payload.write_u32::<LittleEndian>(index).unwrap();
        payload.write_u32::<LittleEndian>(self.fragment_count()).unwrap();
        payload.extend_from_slice(data);
        payload
            .write_u32::<LittleEndian>(self.fragment_crcs[index as usize])
            .unwrap();
        Ok(payload)
    }

    /// File name of the loaded image (diagnostic only).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path the image was loaded from (diagnostic only).
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raw image bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Last-modified timestamp of the source file.
    pub fn modified(&self) -> SystemTime {
        self.modified
    }

    /// MD5 digest of the image, lowercase hex without separators.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// CRC-32 of the whole image.
    pub fn crc32(&self) -> u32 {
        self.crc32
    }

    /// Configured fragment size in bytes.
    pub fn fragment_size(&self) -> usize {
        self.fragment_size
    }

    /// CRC-32 of fragment `index`, if in range.
    pub fn fragment_crc(&self, index: u32) -> Option<u32> {
        self.fragment_crcs.get(index as usize).copied()
    }

    /// Target load address for the image.
    pub fn load_addr(&self) -> u32 {
        self.load_addr
    }

    /// Lightweight descriptor for event consumers.
    pub fn summary(&self) -> FirmwareSummary {
        FirmwareSummary {
            name: self.name.clone(),
            size: self.data.len(),
            digest: self.digest.clone(),
            crc32: self.crc32,
            fragment_count: self.fragment_count(),
            fragment_size: self.fragment_size,
            load_addr: self.load_addr,
        }
    }
}

impl std::fmt::Debug for FirmwareImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FirmwareImage")
            .field("name", &self.name)
            .field("size", &self.data.len())
            .field("digest", &self.digest)
            .field("crc32", &format_args!("{:#010X}", self.crc32))
            .field("fragment_size", &self.fragment_size)
            .field("fragments", &self.fragment_crcs.len())
            .field("load_addr", &format_args!("{:#010X}", self.load_addr))
            .finish()
    }
}

/// Descriptor published with firmware-loaded events.
#[derive(Debug, Clone)]
pub struct FirmwareSummary {
    /// File name of the image.
    pub name: String,
    /// Image size in bytes.
    pub size: usize,
    /// MD5 digest, lowercase hex.
    pub digest: String,
    /// Whole-image CRC-32.
    pub crc32: u32,
    /// Number of fragments.
    pub fragment_count: u32,
    /// Fragment size in bytes.
    pub fragment_size: usize,
    /// Target load address.
    pub load_addr: u32,
}

fn hex_digest(data: &[u8]) -> String {
    Md5::digest(data)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
