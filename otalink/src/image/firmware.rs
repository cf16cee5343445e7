//! Raw firmware images.
//!
//! A [`FirmwareImage`] is loaded once and never modified. Its whole-image
//! CRC-32 is computed at load time and sent to the device in the HEADER frame.
//! The image is split into fixed-size chunks, one per DATA frame; only the
//! last chunk may be shorter.

use crate::error::{Error, Result};
use crate::protocol::crc::crc32;
use log::debug;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::Arc;

/// Payload size of a DATA frame.
pub const CHUNK_SIZE: usize = 128;

/// An immutable firmware image ready for transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    bytes: Arc<[u8]>,
    size: u32,
    checksum: u32,
    version: u32,
}

impl FirmwareImage {
    /// Create an image from raw bytes.
    ///
    /// Fails if the image is empty or does not fit in a 32-bit size field.
    pub fn new(bytes: impl Into<Vec<u8>>, version: u32) -> Result<Self> {
        let bytes: Vec<u8> = bytes.into();

        if bytes.is_empty() {
            return Err(Error::InvalidFirmware("image is empty".into()));
        }

        let size = u32::try_from(bytes.len()).map_err(|_| {
            Error::InvalidFirmware(format!(
                "image of {} bytes exceeds the 32-bit size field",
                bytes.len()
            ))
        })?;

        let checksum = crc32(&bytes);
        debug!("Firmware image: {size} bytes, CRC32 {checksum:#010X}, version {version}");

        Ok(Self {
            bytes: bytes.into(),
            size,
            checksum,
            version,
        })
    }

    /// Load an image from a file.
    pub fn from_file<P: AsRef<Path>>(path: P, version: u32) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading firmware from: {}", path.display());

        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;

        Self::new(data, version)
    }

    /// Image contents.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Image size in bytes.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Whole-image CRC-32.
    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    /// Firmware version carried in the HEADER frame.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Number of chunks of `chunk_size` bytes needed for the image.
    pub fn total_chunks(&self, chunk_size: usize) -> usize {
        self.bytes.len().div_ceil(chunk_size)
    }

    /// Iterate over the image in chunks of `chunk_size` bytes.
    pub fn chunks(&self, chunk_size: usize) -> std::slice::Chunks<'_, u8> {
        self.bytes.chunks(chunk_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunking_300_bytes() {
        let image = FirmwareImage::new(vec![0xAB; 300], 0).unwrap();
        assert_eq!(image.total_chunks(CHUNK_SIZE), 3);
        let lens: Vec<usize> = image.chunks(CHUNK_SIZE).map(<[u8]>::len).collect();
        assert_eq!(lens, vec![128, 128, 44]);
    }

    #[test]
    fn test_chunking_bounds() {
        for size in [1usize, 127, 128, 129, 255, 256, 257, 4096, 5000] {
            let image = FirmwareImage::new(vec![0u8; size], 0).unwrap();
            let total = image.total_chunks(CHUNK_SIZE);
            assert_eq!(total, size.div_ceil(CHUNK_SIZE));

            let last = image.chunks(CHUNK_SIZE).last().unwrap().len();
            assert_eq!(last, size - CHUNK_SIZE * (total - 1));
            assert!((1..=CHUNK_SIZE).contains(&last));
            assert_eq!(image.chunks(CHUNK_SIZE).count(), total);
        }
    }

    #[test]
    fn test_checksum_computed_at_load() {
        let data = b"firmware payload".to_vec();
        let image = FirmwareImage::new(data.clone(), 3).unwrap();
        assert_eq!(image.checksum(), crc32(&data));
        assert_eq!(image.size(), 16);
        assert_eq!(image.version(), 3);
        assert_eq!(image.bytes(), data.as_slice());
    }

    #[test]
    fn test_empty_image_rejected() {
        assert!(matches!(
            FirmwareImage::new(Vec::new(), 0),
            Err(Error::InvalidFirmware(_))
        ));
    }

    #[test]
    fn test_from_file_missing() {
        assert!(matches!(
            FirmwareImage::from_file("/nonexistent/firmware.bin", 0),
            Err(Error::Io(_))
        ));
    }
}
