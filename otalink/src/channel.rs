//! Shared-link arbitration between the text channel and framed sessions.
//!
//! One serial link carries both newline-terminated text (device logs, shell
//! commands) and binary OTA frames. While a session runs, nothing else may
//! read from the link, or response bytes would be consumed as text.
//!
//! [`ChannelArbiter`] owns the port. Background readers go through
//! [`ChannelArbiter::read_text`], which yields nothing while text mode is
//! suppressed. A session takes the port with [`ChannelArbiter::frame_mode`];
//! the returned guard gives exclusive access and restores text mode when it
//! is dropped, whichever way the session ends.

use crate::error::{Error, Result};
use crate::port::Port;
use log::trace;
use std::io::ErrorKind;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Read timeout used for text polling.
pub const DEFAULT_TEXT_POLL: Duration = Duration::from_millis(50);

/// Owner of a port shared by a text reader and framed sessions.
pub struct ChannelArbiter<P: Port> {
    port: Mutex<P>,
    text_mode: AtomicBool,
    frame_users: AtomicUsize,
    text_poll: Duration,
}

impl<P: Port> ChannelArbiter<P> {
    /// Wrap a port. Text mode starts enabled.
    pub fn new(port: P) -> Self {
        Self {
            port: Mutex::new(port),
            text_mode: AtomicBool::new(true),
            frame_users: AtomicUsize::new(0),
            text_poll: DEFAULT_TEXT_POLL,
        }
    }

    /// Set the read timeout used by [`read_text`](Self::read_text).
    ///
    /// This bounds how long a text read can hold the port.
    #[must_use]
    pub fn with_text_poll(mut self, poll: Duration) -> Self {
        self.text_poll = poll;
        self
    }

    /// Whether background text reads are currently allowed.
    ///
    /// False while text mode is explicitly suppressed or any frame-mode
    /// guard is alive or waiting for the port.
    pub fn is_text_mode(&self) -> bool {
        self.frame_users.load(Ordering::SeqCst) == 0 && self.text_mode.load(Ordering::SeqCst)
    }

    /// Stop background text reads.
    pub fn suppress_text_mode(&self) {
        trace!("Text mode suppressed");
        self.text_mode.store(false, Ordering::SeqCst);
    }

    /// Allow background text reads again.
    pub fn resume_text_mode(&self) {
        trace!("Text mode resumed");
        self.text_mode.store(true, Ordering::SeqCst);
    }

    /// Take exclusive frame-mode access to the port.
    ///
    /// Text mode is suppressed before the lock is taken, so a pending text
    /// read finishes its current poll and backs off. Text mode comes back
    /// once the last guard is dropped, unless it was suppressed explicitly.
    pub fn frame_mode(&self) -> FrameModeGuard<'_, P> {
        self.frame_users.fetch_add(1, Ordering::SeqCst);
        trace!("Entering frame mode");
        FrameModeGuard {
            port: self.lock(),
            frame_users: &self.frame_users,
        }
    }

    /// Read raw text bytes for the background reader.
    ///
    /// Returns `Ok(None)` while text mode is suppressed and `Ok(Some(0))` when
    /// the poll elapsed without data.
    pub fn read_text(&self, buf: &mut [u8]) -> Result<Option<usize>> {
        if !self.is_text_mode() {
            return Ok(None);
        }

        let mut port = self.lock();
        // Frame mode may have started while we waited for the lock.
        if !self.is_text_mode() {
            return Ok(None);
        }

        port.set_timeout(self.text_poll)?;
        match port.read(buf) {
            Ok(n) => Ok(Some(n)),
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                Ok(Some(0))
            },
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Send one text command, terminated by a newline.
    pub fn send_text(&self, line: &str) -> Result<()> {
        let mut data = line.trim_end_matches(['\r', '\n']).as_bytes().to_vec();
        data.push(b'\n');
        trace!("Sending text command {:?}", line.trim_end());
        self.lock().write_all_bytes(&data)
    }

    /// Consume the arbiter and return the port.
    pub fn into_inner(self) -> P {
        self.port.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock(&self) -> MutexGuard<'_, P> {
        // A panic mid-session leaves the port usable; the guard already restored text mode.
        self.port.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive port access in frame mode. Derefs to the port.
pub struct FrameModeGuard<'a, P: Port> {
    port: MutexGuard<'a, P>,
    frame_users: &'a AtomicUsize,
}

impl<P: Port> Deref for FrameModeGuard<'_, P> {
    type Target = P;

    fn deref(&self) -> &P {
        &self.port
    }
}

impl<P: Port> DerefMut for FrameModeGuard<'_, P> {
    fn deref_mut(&mut self) -> &mut P {
        &mut self.port
    }
}

impl<P: Port> Drop for FrameModeGuard<'_, P> {
    fn drop(&mut self) {
        trace!("Leaving frame mode");
        self.frame_users.fetch_sub(1, Ordering::SeqCst);
    }
}
