//! CRC-32 integrity checks.
//!
//! The protocol uses one checksum function at two independent scopes:
//!
//! - **Per frame**: the trailer of every frame covers that frame's payload only.
//! - **Whole image**: computed once over the firmware and carried in the
//!   HEADER payload so the receiver can verify the reassembled image.
//!
//! The algorithm is CRC-32/ISO-HDLC, the same one zlib and most bootloaders
//! use (reflected polynomial `0x04C11DB7`, init and xorout `0xFFFFFFFF`).

use crc::{CRC_32_ISO_HDLC, Crc};

static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Calculate the CRC-32 of a byte range.
pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_check_value() {
        // Standard check value for CRC-32/ISO-HDLC.
        assert_eq!(crc32(b"123456789"), 0xCBF43926);
    }

    #[test]
    fn test_crc32_empty() {
        assert_eq!(crc32(&[]), 0);
    }

    #[test]
    fn test_crc32_detects_single_bit_flips() {
        let data = vec![0x5Au8; 128];
        let reference = crc32(&data);
        for byte in 0..data.len() {
            for bit in 0..8 {
                let mut corrupted = data.clone();
                corrupted[byte] ^= 1 << bit;
                assert_ne!(crc32(&corrupted), reference, "flip at {byte}:{bit}");
            }
        }
    }
}
