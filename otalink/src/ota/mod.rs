//! OTA session model and sequencer.
//!
//! A session walks a fixed state machine. Every transition writes exactly one
//! frame; every await state blocks in one [`AckWaiter`] wait.
//!
//! ```text
//! Idle -> AwaitStartAck -> AwaitHeaderAck -> SendingChunks <-> AwaitChunkAck
//!                                                  |
//!                                                  v
//!                                             SendingEnd -> Complete
//!
//! any await state --(NACK / timeout / malformed)--> Failed
//! ```
//!
//! [`AckWaiter`]: crate::protocol::ack::AckWaiter

pub mod sequencer;

pub use sequencer::{OtaSequencer, run_ota};

use crate::image::CHUNK_SIZE;
use crate::protocol::ack::AckOutcome;
use crate::protocol::frame::FrameProtocol;
use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Default time to wait for each response frame.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// Sequencer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SequencerState {
    /// Nothing sent yet.
    Idle,
    /// START sent, waiting for its response.
    AwaitStartAck,
    /// HEADER sent, waiting for its response.
    AwaitHeaderAck,
    /// About to send the next DATA chunk.
    SendingChunks,
    /// DATA chunk sent, waiting for its response.
    AwaitChunkAck,
    /// All chunks acknowledged, sending END.
    SendingEnd,
    /// END sent. Terminal.
    Complete,
    /// A wait did not end in an ACK. Terminal.
    Failed,
}

impl SequencerState {
    /// Whether the session can no longer advance.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

/// The frame a session was working on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TransferStage {
    /// START command.
    Start,
    /// Firmware header.
    Header,
    /// DATA chunk with its zero-based index.
    Data {
        /// Chunk index.
        index: u32,
    },
    /// END command.
    End,
}

impl fmt::Display for TransferStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "START"),
            Self::Header => write!(f, "HEADER"),
            Self::Data { index } => write!(f, "DATA chunk {index}"),
            Self::End => write!(f, "END"),
        }
    }
}

/// Why a session aborted.
#[derive(Debug, Error)]
pub enum FailureReason {
    /// The device rejected the frame.
    #[error("device answered NACK")]
    Nack,

    /// No response arrived within the ack timeout.
    #[error("no response before the ack timeout")]
    Timeout,

    /// The response frame could not be understood.
    #[error("malformed response")]
    Malformed,

    /// The link itself failed.
    #[error("transport error: {0}")]
    Transport(#[source] io::Error),
}

impl FailureReason {
    /// Failure reason for a non-ACK outcome; `None` for [`AckOutcome::Ack`].
    pub fn from_outcome(outcome: AckOutcome) -> Option<Self> {
        match outcome {
            AckOutcome::Ack => None,
            AckOutcome::Nack => Some(Self::Nack),
            AckOutcome::Timeout => Some(Self::Timeout),
            AckOutcome::Malformed => Some(Self::Malformed),
        }
    }
}

/// Per-chunk retry policy.
///
/// Applies to DATA chunks only. START, HEADER and END are never re-sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RetryPolicy {
    /// Extra attempts per chunk after the first one fails.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub backoff: Duration,
    /// Double the delay on every further retry.
    pub exponential: bool,
}

impl RetryPolicy {
    /// No retries: the first non-ACK response aborts the session.
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            backoff: Duration::ZERO,
            exponential: false,
        }
    }

    /// Fixed-delay retries.
    pub const fn fixed(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
            exponential: false,
        }
    }

    /// Retries whose delay doubles each time, starting at `backoff`.
    pub const fn exponential(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
            exponential: true,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if !self.exponential || attempt <= 1 {
            return self.backoff;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.backoff.saturating_mul(factor)
    }
}

/// Settings for one transfer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TransferConfig {
    /// Time to wait for each response frame.
    pub ack_timeout: Duration,
    /// DATA chunk retry policy.
    pub retry: RetryPolicy,
    /// Protocol revision spoken on the link.
    pub protocol: FrameProtocol,
    /// Firmware bytes per DATA frame.
    pub chunk_size: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            retry: RetryPolicy::none(),
            protocol: FrameProtocol::standard(),
            chunk_size: CHUNK_SIZE,
        }
    }
}

impl TransferConfig {
    /// Set the per-response timeout.
    #[must_use]
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Set the DATA retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the protocol revision.
    #[must_use]
    pub fn with_protocol(mut self, protocol: FrameProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Set the chunk size.
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }
}

/// Progress of the session owned by one sequencer.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TransferSession {
    /// Current state.
    pub state: SequencerState,
    /// Index of the chunk being sent or awaited.
    pub chunk_index: u32,
    /// Number of DATA chunks in the image.
    pub total_chunks: u32,
    /// Firmware bytes per DATA frame.
    pub chunk_size: usize,
}

impl TransferSession {
    /// A fresh session in [`SequencerState::Idle`].
    pub fn new(chunk_size: usize) -> Self {
        Self {
            state: SequencerState::Idle,
            chunk_index: 0,
            total_chunks: 0,
            chunk_size,
        }
    }
}

/// Summary of a completed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TransferReport {
    /// DATA chunks acknowledged.
    pub chunks_sent: u32,
    /// Firmware bytes acknowledged.
    pub bytes_sent: usize,
    /// DATA frames re-sent under the retry policy.
    pub retries: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_display() {
        assert_eq!(TransferStage::Start.to_string(), "START");
        assert_eq!(TransferStage::Data { index: 4 }.to_string(), "DATA chunk 4");
    }

    #[test]
    fn test_failure_reason_from_outcome() {
        assert!(FailureReason::from_outcome(AckOutcome::Ack).is_none());
        assert!(matches!(
            FailureReason::from_outcome(AckOutcome::Timeout),
            Some(FailureReason::Timeout)
        ));
        assert!(matches!(
            FailureReason::from_outcome(AckOutcome::Malformed),
            Some(FailureReason::Malformed)
        ));
    }

    #[test]
    fn test_fixed_backoff() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(20));
        assert_eq!(policy.delay_for(1), Duration::from_millis(20));
        assert_eq!(policy.delay_for(3), Duration::from_millis(20));
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy::exponential(4, Duration::from_millis(10));
        assert_eq!(policy.delay_for(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for(2), Duration::from_millis(20));
        assert_eq!(policy.delay_for(4), Duration::from_millis(80));
        // Saturates instead of overflowing.
        assert!(policy.delay_for(200) >= Duration::from_millis(10));
    }

    #[test]
    fn test_default_config() {
        let config = TransferConfig::default();
        assert_eq!(config.ack_timeout, Duration::from_secs(2));
        assert_eq!(config.retry.max_retries, 0);
        assert_eq!(config.protocol, FrameProtocol::standard());
        assert_eq!(config.chunk_size, 128);
    }

    #[test]
    fn test_terminal_states() {
        assert!(SequencerState::Complete.is_terminal());
        assert!(SequencerState::Failed.is_terminal());
        assert!(!SequencerState::AwaitChunkAck.is_terminal());
    }
}
