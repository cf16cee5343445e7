//! Error types for otalink.

use crate::ota::{FailureReason, SequencerState, TransferStage};
use crate::protocol::frame::FramingError;
use std::io;
use thiserror::Error;

/// Result type for otalink operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for otalink operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// A frame could not be built or parsed.
    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    /// The firmware image cannot be transferred.
    #[error("Invalid firmware: {0}")]
    InvalidFirmware(String),

    /// The transfer session was aborted.
    #[error("Transfer failed during {stage}: {reason}")]
    Transfer {
        /// Stage that was in progress when the session aborted.
        stage: TransferStage,
        /// Why the session aborted.
        reason: FailureReason,
    },

    /// The sequencer already ran its session to a terminal state.
    #[error("Transfer session already finished ({0:?}); start a new session")]
    SessionFinished(SequencerState),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Stage at which a transfer aborted, if this is a transfer failure.
    pub fn transfer_stage(&self) -> Option<TransferStage> {
        match self {
            Self::Transfer { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}
