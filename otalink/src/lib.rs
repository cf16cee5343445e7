//! # otalink
//!
//! Host-side engine for pushing firmware images to a device over a serial
//! link with a small framed OTA protocol.
//!
//! This crate provides:
//!
//! - A length-delimited frame codec with CRC-32 trailers
//! - A resynchronizing response waiter that tolerates interleaved text
//! - The OTA sequencer state machine (START, HEADER, DATA chunks, END)
//! - Arbitration of one link between device text output and framed sessions
//! - A background text drain that delivers device log lines
//!
//! ## Features
//!
//! - `native` (default): Serial port support via the `serialport` crate
//! - `serde`: Serialization support for configuration and report types
//!
//! ## Example
//!
//! ```rust,no_run
//! use otalink::{ChannelArbiter, FirmwareImage, SerialConfig, TransferConfig, run_ota};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = FirmwareImage::from_file("app.bin", 1)?;
//!
//!     #[cfg(feature = "native")]
//!     {
//!         let port = otalink::NativePort::open(&SerialConfig::new("/dev/ttyACM0", 115200))?;
//!         let arbiter = ChannelArbiter::new(port);
//!
//!         let report = run_ota(&arbiter, &image, TransferConfig::default(), |done, total| {
//!             println!("{done}/{total} bytes");
//!         })?;
//!         println!("Sent {} chunks", report.chunks_sent);
//!
//!         arbiter.send_text("run")?;
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod error;
pub mod image;
pub mod monitor;
pub mod ota;
pub mod port;
pub mod protocol;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::{NativePort, NativePortEnumerator};
pub use {
    channel::{ChannelArbiter, FrameModeGuard},
    error::{Error, Result},
    image::{CHUNK_SIZE, FirmwareImage},
    monitor::{LineAssembler, TextDrain, clean_monitor_text, drain_utf8_lossy},
    ota::{
        FailureReason, OtaSequencer, RetryPolicy, SequencerState, TransferConfig, TransferReport,
        TransferSession, TransferStage, run_ota,
    },
    port::{Port, PortEnumerator, PortInfo, SerialConfig},
    protocol::{
        AckOutcome, AckWaiter, Frame, FrameCodec, FrameProtocol, FramingError, PacketType, crc32,
    },
};
