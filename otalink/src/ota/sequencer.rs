//! Host-side OTA transfer sequencer.

use crate::channel::ChannelArbiter;
use crate::error::{Error, Result};
use crate::image::FirmwareImage;
use crate::ota::{
    FailureReason, SequencerState, TransferConfig, TransferReport, TransferSession, TransferStage,
};
use crate::port::Port;
use crate::protocol::ack::{AckOutcome, AckWaiter};
use crate::protocol::frame::{FrameCodec, MAX_PAYLOAD_LEN};
use log::{debug, error, info, trace, warn};
use std::io;
use std::thread;
use std::time::Duration;

/// Text command that switches the device into OTA mode.
pub const OTA_COMMAND: &str = "ota";

/// Pause after the OTA command so the device can get ready for frames.
pub const ENTER_DELAY: Duration = Duration::from_millis(100);

/// Drives one transfer session over a port.
///
/// A sequencer runs at most one session. Once it has reached
/// [`SequencerState::Complete`] or [`SequencerState::Failed`], further calls
/// to [`transfer`](Self::transfer) return [`Error::SessionFinished`].
pub struct OtaSequencer<'a, P: Port> {
    port: &'a mut P,
    codec: FrameCodec,
    config: TransferConfig,
    session: TransferSession,
}

impl<'a, P: Port> OtaSequencer<'a, P> {
    /// Create a sequencer that owns the port for the duration of a session.
    pub fn new(port: &'a mut P, config: TransferConfig) -> Self {
        Self {
            port,
            codec: FrameCodec::new(config.protocol),
            session: TransferSession::new(config.chunk_size),
            config,
        }
    }

    /// Current session.
    pub fn session(&self) -> &TransferSession {
        &self.session
    }

    /// Current state.
    pub fn state(&self) -> SequencerState {
        self.session.state
    }

    /// Transfer `image` to the device.
    ///
    /// `progress` receives `(bytes_acked, total_bytes)` after every
    /// acknowledged DATA chunk.
    pub fn transfer<F>(&mut self, image: &FirmwareImage, mut progress: F) -> Result<TransferReport>
    where
        F: FnMut(usize, usize),
    {
        if self.session.state != SequencerState::Idle {
            return Err(Error::SessionFinished(self.session.state));
        }

        let chunk_size = self.session.chunk_size;
        if chunk_size == 0 || chunk_size > MAX_PAYLOAD_LEN {
            return Err(Error::Config(format!(
                "chunk size must be between 1 and {MAX_PAYLOAD_LEN}, got {chunk_size}"
            )));
        }

        let result = self.run(image, &mut progress);
        if result.is_err() {
            self.session.state = SequencerState::Failed;
        }
        result
    }

    #[allow(clippy::cast_possible_truncation)]
    fn run<F>(&mut self, image: &FirmwareImage, progress: &mut F) -> Result<TransferReport>
    where
        F: FnMut(usize, usize),
    {
        let chunk_size = self.session.chunk_size;
        let total_bytes = image.bytes().len();
        // Safe cast: image size fits in u32, so the chunk count does too
        self.session.total_chunks = image.total_chunks(chunk_size) as u32;

        info!(
            "Starting OTA transfer on {}: {} bytes in {} chunks (CRC32 0x{:08X}, version {})",
            self.port.name(),
            total_bytes,
            self.session.total_chunks,
            image.checksum(),
            image.version()
        );

        let frame = self.codec.start();
        self.write_frame(TransferStage::Start, &frame)?;
        self.enter(SequencerState::AwaitStartAck);
        self.expect_ack(TransferStage::Start)?;

        let frame = self.codec.header(image);
        self.write_frame(TransferStage::Header, &frame)?;
        self.enter(SequencerState::AwaitHeaderAck);
        self.expect_ack(TransferStage::Header)?;

        let mut report = TransferReport::default();
        for (index, chunk) in image.chunks(chunk_size).enumerate() {
            // Safe cast: bounded by total_chunks
            let index = index as u32;
            self.session.chunk_index = index;
            self.enter(SequencerState::SendingChunks);

            let frame = self.codec.data(chunk)?;
            report.retries += self.send_chunk(TransferStage::Data { index }, &frame)?;
            report.chunks_sent += 1;
            report.bytes_sent += chunk.len();
            progress(report.bytes_sent, total_bytes);
        }

        self.enter(SequencerState::SendingEnd);
        let frame = self.codec.end();
        self.write_frame(TransferStage::End, &frame)?;
        self.enter(SequencerState::Complete);

        info!(
            "OTA transfer complete: {} chunks, {} bytes, {} retries",
            report.chunks_sent, report.bytes_sent, report.retries
        );
        Ok(report)
    }

    /// Send one DATA frame until it is acknowledged or the retry budget runs out.
    ///
    /// Returns the number of retries used.
    fn send_chunk(&mut self, stage: TransferStage, frame: &[u8]) -> Result<u32> {
        let policy = self.config.retry;
        let mut attempt = 0;

        loop {
            self.write_frame(stage, frame)?;
            self.enter(SequencerState::AwaitChunkAck);

            let outcome = self.wait(stage)?;
            let Some(reason) = FailureReason::from_outcome(outcome) else {
                return Ok(attempt);
            };

            if attempt >= policy.max_retries {
                return Err(self.fail(stage, reason));
            }

            attempt += 1;
            let delay = policy.delay_for(attempt);
            warn!(
                "{stage} failed ({outcome}), retrying ({attempt}/{}) in {delay:?}",
                policy.max_retries
            );

            thread::sleep(delay);
            // A late answer to the previous attempt may have arrived during the backoff.
            if let Err(e) = self.port.clear_buffers() {
                return Err(self.fail(stage, transport_reason(e)));
            }
            self.enter(SequencerState::SendingChunks);
        }
    }

    fn expect_ack(&mut self, stage: TransferStage) -> Result<()> {
        let outcome = self.wait(stage)?;
        match FailureReason::from_outcome(outcome) {
            None => Ok(()),
            Some(reason) => Err(self.fail(stage, reason)),
        }
    }

    fn wait(&mut self, stage: TransferStage) -> Result<AckOutcome> {
        let result = AckWaiter::new(&mut *self.port, self.codec).wait(self.config.ack_timeout);
        match result {
            Ok(outcome) => {
                debug!("{stage}: {outcome}");
                Ok(outcome)
            },
            Err(e) => Err(self.fail(stage, transport_reason(e))),
        }
    }

    fn write_frame(&mut self, stage: TransferStage, frame: &[u8]) -> Result<()> {
        trace!("Sending {stage} frame ({} bytes)", frame.len());
        if let Err(e) = self.port.write_all_bytes(frame) {
            return Err(self.fail(stage, transport_reason(e)));
        }
        Ok(())
    }

    fn enter(&mut self, state: SequencerState) {
        trace!("{:?} -> {state:?}", self.session.state);
        self.session.state = state;
    }

    fn fail(&mut self, stage: TransferStage, reason: FailureReason) -> Error {
        error!("OTA transfer aborted during {stage}: {reason}");
        self.enter(SequencerState::Failed);
        Error::Transfer { stage, reason }
    }
}

fn transport_reason(err: Error) -> FailureReason {
    match err {
        Error::Io(e) => FailureReason::Transport(e),
        other => FailureReason::Transport(io::Error::other(other)),
    }
}

/// Switch the device into OTA mode and run a session through the arbiter.
///
/// Sends the `ota` text command, waits briefly, then takes the port in frame
/// mode for the whole session. Text mode resumes when this returns, on success
/// or failure.
pub fn run_ota<P, F>(
    arbiter: &ChannelArbiter<P>,
    image: &FirmwareImage,
    config: TransferConfig,
    progress: F,
) -> Result<TransferReport>
where
    P: Port,
    F: FnMut(usize, usize),
{
    if let Err(e) = arbiter.send_text(OTA_COMMAND) {
        return Err(enter_failed(e));
    }
    thread::sleep(ENTER_DELAY);

    let mut port = arbiter.frame_mode();
    if let Err(e) = port.clear_buffers() {
        return Err(enter_failed(e));
    }
    OtaSequencer::new(&mut *port, config).transfer(image, progress)
}

fn enter_failed(err: Error) -> Error {
    let reason = transport_reason(err);
    error!("Could not switch the device into OTA mode: {reason}");
    Error::Transfer {
        stage: TransferStage::Start,
        reason,
    }
}
