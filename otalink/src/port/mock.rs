//! Scripted in-memory port for tests.
//!
//! Reads and writes are independent. Each write pops the next scripted
//! [`Reply`] and queues the matching response bytes for reading, which models
//! a device answering one frame at a time.

use crate::error::Result;
use crate::port::Port;
use crate::protocol::frame::FrameCodec;
use std::collections::VecDeque;
use std::io;
use std::time::{Duration, Instant};

/// Longest a read on an empty mock blocks before reporting a timeout.
const IDLE_READ: Duration = Duration::from_millis(2);

/// Device behavior for one written frame.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    /// RESP frame with the ACK status.
    Ack,
    /// RESP frame with the NACK status.
    Nack,
    /// RESP frame with an arbitrary status.
    Status(u8),
    /// Raw bytes, verbatim.
    Raw(Vec<u8>),
    /// The inner reply, arriving only after the delay.
    Late(Duration, Box<Reply>),
    /// Nothing at all.
    Silent,
    /// The next read fails with this error kind.
    ReadError(io::ErrorKind),
}

pub(crate) struct MockPort {
    codec: FrameCodec,
    incoming: VecDeque<u8>,
    late: Vec<(Instant, Vec<u8>)>,
    write_error: Option<io::ErrorKind>,
    replies: VecDeque<Reply>,
    read_error: Option<io::ErrorKind>,
    pub(crate) writes: Vec<Vec<u8>>,
    pub(crate) timeouts: Vec<Duration>,
    pub(crate) clears: usize,
    timeout: Duration,
}

impl MockPort {
    pub(crate) fn new() -> Self {
        Self {
            codec: FrameCodec::default(),
            incoming: VecDeque::new(),
            late: Vec::new(),
            write_error: None,
            replies: VecDeque::new(),
            read_error: None,
            writes: Vec::new(),
            timeouts: Vec::new(),
            clears: 0,
            timeout: Duration::from_millis(100),
        }
    }

    pub(crate) fn with_codec(mut self, codec: FrameCodec) -> Self {
        self.codec = codec;
        self
    }

    pub(crate) fn with_replies(mut self, replies: impl IntoIterator<Item = Reply>) -> Self {
        self.replies.extend(replies);
        self
    }

    /// Fail every write with `kind`.
    pub(crate) fn with_write_error(mut self, kind: io::ErrorKind) -> Self {
        self.write_error = Some(kind);
        self
    }

    /// Queue bytes that are readable right away.
    pub(crate) fn push_incoming(&mut self, data: &[u8]) {
        self.incoming.extend(data.iter().copied());
    }

    pub(crate) fn pending_incoming(&self) -> usize {
        self.incoming.len()
    }

    /// Move late replies whose time has come into the input buffer.
    fn deliver_due(&mut self) {
        let now = Instant::now();
        let (due, pending): (Vec<_>, Vec<_>) = self.late.drain(..).partition(|(at, _)| *at <= now);
        self.late = pending;
        for (_, bytes) in due {
            self.push_incoming(&bytes);
        }
    }

    fn reply_bytes(&mut self, reply: Reply) -> Option<Vec<u8>> {
        let protocol = *self.codec.protocol();
        let bytes = match reply {
            Reply::Ack => self.codec.response(protocol.ack_status),
            Reply::Nack => self.codec.response(protocol.nack_status),
            Reply::Status(status) => self.codec.response(status),
            Reply::Raw(bytes) => bytes,
            Reply::Late(delay, inner) => {
                if let Some(bytes) = self.reply_bytes(*inner) {
                    self.late.push((Instant::now() + delay, bytes));
                }
                return None;
            },
            Reply::Silent => return None,
            Reply::ReadError(kind) => {
                self.read_error = Some(kind);
                return None;
            },
        };
        Some(bytes)
    }
}

impl io::Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(kind) = self.read_error.take() {
            return Err(io::Error::new(kind, "scripted read failure"));
        }
        self.deliver_due();
        if self.incoming.is_empty() {
            std::thread::sleep(self.timeout.min(IDLE_READ));
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(self.incoming.len());
        for (slot, byte) in buf.iter_mut().zip(self.incoming.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl io::Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(kind) = self.write_error {
            return Err(io::Error::new(kind, "scripted write failure"));
        }
        // Late answers to earlier frames reach the host before this frame's answer.
        self.deliver_due();
        self.writes.push(buf.to_vec());
        if let Some(bytes) = self.replies.pop_front().and_then(|r| self.reply_bytes(r)) {
            self.push_incoming(&bytes);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for MockPort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeouts.push(timeout);
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.clears += 1;
        self.deliver_due();
        self.incoming.clear();
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }
}
