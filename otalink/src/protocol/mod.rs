//! OTA wire protocol: integrity check, frame codec and response waiting.

pub mod ack;
pub mod crc;
pub mod frame;

// Re-export common types
pub use ack::{AckOutcome, AckWaiter};
pub use crc::crc32;
pub use frame::{Frame, FrameCodec, FrameProtocol, FramingError, PacketCodes, PacketType};
