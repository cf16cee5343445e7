//! Firmware image handling.

pub mod firmware;

pub use firmware::{CHUNK_SIZE, FirmwareImage};
