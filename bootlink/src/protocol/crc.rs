//! CRC-32 checksum calculation.
//!
//! Reflected CRC-32 over polynomial 0x04C11DB7 (0xEDB88320 in reflected
//! form), initial value 0xFFFFFFFF, final XOR 0xFFFFFFFF. This matches the
//! Ethernet CRC-32 as computed by ST-style hardware CRC peripherals, which is
//! what the resident bootloaders check fragment payloads against.

/// Reflected form of the 0x04C11DB7 polynomial.
const POLY_REFLECTED: u32 = 0xEDB8_8320;

/// 256-entry lookup table, one byte of input per step.
static CRC_TABLE: [u32; 256] = build_table();

const fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ POLY_REFLECTED
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Compute the CRC-32 of a byte slice.
///
/// Empty input yields 0, used as a sentinel; callers must not treat 0 as a
/// valid checksum for non-empty data.
pub fn crc32(data: &[u8]) -> u32 {
    if data.is_empty() {
        return 0;
    }
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC_TABLE[index];
    }
    !crc
}

/// Compute the CRC-32 of each fragment of `data`, in fragment order.
///
/// The last fragment may be shorter than `fragment_size`. `fragment_size`
/// must be positive; callers validate it before building a fragment map.
pub fn fragment_crcs(data: &[u8], fragment_size: usize) -> Vec<u32> {
    debug_assert!(fragment_size > 0);
    data.chunks(fragment_size).map(crc32).collect()
}

/// Check a byte slice against an expected CRC-32 value.
pub fn verify(data: &[u8], expected: u32) -> bool {
    crc32(data) == expected
}
