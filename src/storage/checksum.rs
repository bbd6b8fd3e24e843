//! # CRC-32 Implementation
//!
//! CRC-32 checksum used for read-after-write verification of staged samples.
//!
//! **Polynomial**: 0x04C11DB7 (MSB-first, not reflected)
//! **Initial Value**: 0xFFFFFFFF
//! **Final XOR**: 0xFFFFFFFF

/// CRC-32 polynomial (IEEE 802.3, normal form)
const CRC32_POLY: u32 = 0x04C1_1DB7;

/// Precomputed CRC32 lookup table for fast calculation
const CRC32_TABLE: [u32; 256] = generate_crc32_table();

/// Generate CRC32 lookup table at compile time
const fn generate_crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;

    while i < 256 {
        let mut crc = (i as u32) << 24;
        let mut j = 0;

        while j < 8 {
            if (crc & 0x8000_0000) != 0 {
                crc = (crc << 1) ^ CRC32_POLY;
            } else {
                crc <<= 1;
            }
            j += 1;
        }

        table[i] = crc;
        i += 1;
    }

    table
}

/// Calculate the CRC-32 of a byte slice using the lookup table
///
/// # Examples
///
/// ```
/// use thermal_logger::storage::checksum::crc32;
///
/// assert_eq!(crc32(b"123456789"), 0xFC89_1918);
/// ```
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;

    for &byte in data {
        let index = ((crc >> 24) ^ byte as u32) as usize;
        crc = (crc << 8) ^ CRC32_TABLE[index];
    }

    crc ^ 0xFFFF_FFFF
}

/// Bit-by-bit CRC-32 (slow, used to check the table)
#[cfg(test)]
fn crc32_slow(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;

    for &byte in data {
        crc ^= (byte as u32) << 24;
        for _ in 0..8 {
            if (crc & 0x8000_0000) != 0 {
                crc = (crc << 1) ^ CRC32_POLY;
            } else {
                crc <<= 1;
            }
        }
    }

    crc ^ 0xFFFF_FFFF
}
