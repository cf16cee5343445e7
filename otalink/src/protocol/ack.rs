//! Waiting for the device's response frame.
//!
//! The link is shared with free-text diagnostic output, so the bytes in front
//! of a response are not necessarily part of it. [`AckWaiter`] keeps a
//! resynchronizing buffer: anything that does not start with the start marker
//! is discarded until a marker shows up, and only then is a fixed-length RESP
//! frame assembled and classified.
//!
//! ```text
//! +-----+------+-----------+--------+---------+-----+
//! | SOF | RESP | 0x01 0x00 | status |  CRC32  | EOF |
//! +-----+------+-----------+--------+---------+-----+
//! ```

use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::frame::{FrameCodec, FrameProtocol, RESP_FRAME_LEN};
use log::{debug, trace};
use std::fmt;
use std::io::ErrorKind;
use std::time::{Duration, Instant};

/// Classification of one response wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Device accepted the frame.
    Ack,
    /// Device rejected the frame.
    Nack,
    /// No complete response frame arrived in time.
    Timeout,
    /// A complete frame arrived but could not be understood.
    Malformed,
}

impl AckOutcome {
    /// Classify a RESP status byte.
    pub fn from_status(status: u8, protocol: &FrameProtocol) -> Self {
        if status == protocol.ack_status {
            Self::Ack
        } else if status == protocol.nack_status {
            Self::Nack
        } else {
            Self::Malformed
        }
    }
}

impl fmt::Display for AckOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ack => write!(f, "ACK"),
            Self::Nack => write!(f, "NACK"),
            Self::Timeout => write!(f, "timeout"),
            Self::Malformed => write!(f, "malformed response"),
        }
    }
}

/// Reads one response frame from a port.
pub struct AckWaiter<'a, P: Port> {
    port: &'a mut P,
    codec: FrameCodec,
    buffer: Vec<u8>,
}

impl<'a, P: Port> AckWaiter<'a, P> {
    /// Create a waiter reading from `port`.
    pub fn new(port: &'a mut P, codec: FrameCodec) -> Self {
        Self {
            port,
            codec,
            buffer: Vec::with_capacity(RESP_FRAME_LEN),
        }
    }

    /// Block until a response frame is recognized or `timeout` elapses.
    ///
    /// The port's read timeout is lowered to the remaining budget before every
    /// read, so the call never outlives `timeout`. Read timeouts are not
    /// errors; any other I/O failure is returned as `Err`.
    pub fn wait(&mut self, timeout: Duration) -> Result<AckOutcome> {
        let deadline = Instant::now() + timeout;
        self.buffer.clear();
        let mut chunk = [0u8; RESP_FRAME_LEN];

        loop {
            if let Some(outcome) = self.scan() {
                trace!("Response: {outcome}");
                return Ok(outcome);
            }

            let now = Instant::now();
            if now >= deadline {
                debug!("No response within {timeout:?}");
                return Ok(AckOutcome::Timeout);
            }
            self.port.set_timeout(deadline - now)?;

            // Never read past the end of one response frame.
            let want = RESP_FRAME_LEN - self.buffer.len();
            match self.port.read(&mut chunk[..want]) {
                Ok(0) => {},
                Ok(n) => {
                    trace!("Received {n} bytes");
                    self.buffer.extend_from_slice(&chunk[..n]);
                },
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                    ) => {},
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    /// Resynchronize the buffer and classify a complete frame, if any.
    fn scan(&mut self) -> Option<AckOutcome> {
        let protocol = *self.codec.protocol();

        loop {
            match self
                .buffer
                .iter()
                .position(|b| *b == protocol.start_marker)
            {
                Some(0) => {},
                Some(skip) => {
                    trace!("Skipping {skip} noise bytes");
                    self.buffer.drain(..skip);
                },
                None => {
                    if !self.buffer.is_empty() {
                        trace!("Skipping {} noise bytes", self.buffer.len());
                        self.buffer.clear();
                    }
                    return None;
                },
            }

            // A marker byte that is not followed by a RESP header is noise too.
            let bad_type = self.buffer.len() >= 2 && self.buffer[1] != protocol.packet_codes.resp;
            let bad_len = self.buffer.len() >= 4 && self.buffer[2..4] != [0x01, 0x00];
            if bad_type || bad_len {
                self.buffer.drain(..1);
                continue;
            }

            if self.buffer.len() < RESP_FRAME_LEN {
                return None;
            }

            let frame = self.codec.decode(&self.buffer[..RESP_FRAME_LEN]);
            self.buffer.drain(..RESP_FRAME_LEN);

            return Some(match frame {
                Ok((frame, _)) => {
                    if protocol.verify_response_checksum && !frame.checksum_ok(&protocol) {
                        debug!("Response checksum mismatch");
                        AckOutcome::Malformed
                    } else {
                        let outcome = AckOutcome::from_status(frame.payload[0], &protocol);
                        if outcome == AckOutcome::Malformed {
                            debug!("Unrecognized response status {:#04X}", frame.payload[0]);
                        }
                        outcome
                    }
                },
                Err(e) => {
                    debug!("Malformed response: {e}");
                    AckOutcome::Malformed
                },
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::{MockPort, Reply};

    const SHORT: Duration = Duration::from_millis(50);

    fn codec() -> FrameCodec {
        FrameCodec::default()
    }

    fn wait_on(port: &mut MockPort, timeout: Duration) -> AckOutcome {
        AckWaiter::new(port, codec()).wait(timeout).unwrap()
    }

    #[test]
    fn test_ack_and_nack() {
        let mut port = MockPort::new();
        port.push_incoming(&codec().response(0xAB));
        assert_eq!(wait_on(&mut port, SHORT), AckOutcome::Ack);

        port.push_incoming(&codec().response(0xCD));
        assert_eq!(wait_on(&mut port, SHORT), AckOutcome::Nack);
    }

    #[test]
    fn test_unknown_status_is_malformed() {
        let mut port = MockPort::new();
        port.push_incoming(&codec().response(0x42));
        assert_eq!(wait_on(&mut port, SHORT), AckOutcome::Malformed);
    }

    #[test]
    fn test_bad_end_marker_is_malformed() {
        let mut port = MockPort::new();
        let mut frame = codec().response(0xAB);
        let last = frame.len() - 1;
        frame[last] = 0x00;
        port.push_incoming(&frame);
        assert_eq!(wait_on(&mut port, SHORT), AckOutcome::Malformed);
    }

    #[test]
    fn test_timeout_on_silence() {
        let mut port = MockPort::new();
        let start = Instant::now();
        assert_eq!(wait_on(&mut port, SHORT), AckOutcome::Timeout);
        assert!(start.elapsed() >= SHORT);
    }

    #[test]
    fn test_timeout_on_partial_frame() {
        let mut port = MockPort::new();
        let frame = codec().response(0xAB);
        port.push_incoming(&frame[..6]);
        assert_eq!(wait_on(&mut port, SHORT), AckOutcome::Timeout);
    }

    #[test]
    fn test_resync_after_noise() {
        let mut port = MockPort::new();
        port.push_incoming(&[0x13, 0x77, 0x00, 0xFF, 0x42]);
        port.push_incoming(&codec().response(0xAB));
        assert_eq!(wait_on(&mut port, SHORT), AckOutcome::Ack);
        assert_eq!(port.pending_incoming(), 0);
    }

    #[test]
    fn test_resync_after_text_line_and_stray_marker() {
        let mut port = MockPort::new();
        port.push_incoming(b"[BL] writing slot 1\r\n");
        // Stray start marker followed by a non-RESP type byte.
        port.push_incoming(&[0xA5, 0x03, 0x10]);
        port.push_incoming(&codec().response(0xCD));
        assert_eq!(wait_on(&mut port, SHORT), AckOutcome::Nack);
    }

    #[test]
    fn test_does_not_consume_past_one_frame() {
        let mut port = MockPort::new();
        port.push_incoming(&codec().response(0xAB));
        port.push_incoming(&codec().response(0xCD));
        assert_eq!(wait_on(&mut port, SHORT), AckOutcome::Ack);
        assert_eq!(port.pending_incoming(), RESP_FRAME_LEN);
        assert_eq!(wait_on(&mut port, SHORT), AckOutcome::Nack);
    }

    #[test]
    fn test_read_timeout_never_exceeds_budget() {
        let mut port = MockPort::new();
        let _ = wait_on(&mut port, SHORT);
        assert!(!port.timeouts.is_empty());
        assert!(port.timeouts.iter().all(|t| *t <= SHORT));
    }

    #[test]
    fn test_transport_error_propagates() {
        let mut port = MockPort::new().with_replies([Reply::ReadError(ErrorKind::BrokenPipe)]);
        std::io::Write::write_all(&mut port, b"x").unwrap();
        let result = AckWaiter::new(&mut port, codec()).wait(SHORT);
        assert!(matches!(result, Err(Error::Io(e)) if e.kind() == ErrorKind::BrokenPipe));
    }

    #[test]
    fn test_response_checksum_verification() {
        let mut protocol = FrameProtocol::standard();
        protocol.verify_response_checksum = true;
        let codec = FrameCodec::new(protocol);

        let mut port = MockPort::new();
        let mut frame = codec.response(0xAB);
        frame[5] ^= 0x01;
        port.push_incoming(&frame);
        let outcome = AckWaiter::new(&mut port, codec).wait(SHORT).unwrap();
        assert_eq!(outcome, AckOutcome::Malformed);

        port.push_incoming(&codec.response(0xAB));
        let outcome = AckWaiter::new(&mut port, codec).wait(SHORT).unwrap();
        assert_eq!(outcome, AckOutcome::Ack);
    }

    #[test]
    fn test_legacy_protocol_response() {
        let codec = FrameCodec::new(FrameProtocol::legacy());
        let mut port = MockPort::new();
        port.push_incoming(&codec.response(0xAB));
        let outcome = AckWaiter::new(&mut port, codec).wait(SHORT).unwrap();
        assert_eq!(outcome, AckOutcome::Ack);
    }
}
