//! Background text drain for device output.
//!
//! Outside of OTA sessions the device prints free-form log lines. A
//! [`TextDrain`] polls the [`ChannelArbiter`] from a background thread,
//! assembles complete lines and hands them to the foreground over a channel.
//! Reads go through [`ChannelArbiter::read_text`], so the drain goes quiet on
//! its own while a session holds frame mode.

use crate::channel::ChannelArbiter;
use crate::error::{Error, Result};
use crate::port::Port;
use log::{debug, warn};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Back-off while text mode is suppressed.
const SUPPRESSED_BACKOFF: Duration = Duration::from_millis(10);

/// Handle to a running background text reader.
///
/// Lines arrive on [`lines`](Self::lines). Call [`stop`](Self::stop) to end
/// the thread and collect its result; dropping the handle also stops it.
pub struct TextDrain {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<Result<()>>>,
    lines: Receiver<String>,
}

impl TextDrain {
    /// Start draining text from `arbiter` on a new thread.
    pub fn spawn<P>(arbiter: Arc<ChannelArbiter<P>>) -> Result<Self>
    where
        P: Port + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, lines) = mpsc::channel();

        let handle = {
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("otalink-text-drain".into())
                .spawn(move || drain_loop(&arbiter, &stop, &tx))?
        };

        Ok(Self {
            stop,
            handle: Some(handle),
            lines,
        })
    }

    /// Receiver of complete device lines.
    pub fn lines(&self) -> &Receiver<String> {
        &self.lines
    }

    /// Lines received so far, without blocking.
    pub fn try_lines(&self) -> Vec<String> {
        self.lines.try_iter().collect()
    }

    /// Stop the thread and wait for it to exit.
    ///
    /// Returns the transport error that ended the drain early, if any.
    pub fn stop(mut self) -> Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| Error::Io(io::Error::other("text drain thread panicked")))?,
            None => Ok(()),
        }
    }
}

impl Drop for TextDrain {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn drain_loop<P: Port>(
    arbiter: &ChannelArbiter<P>,
    stop: &AtomicBool,
    tx: &Sender<String>,
) -> Result<()> {
    let mut assembler = LineAssembler::default();
    let mut buf = [0u8; 256];

    while !stop.load(Ordering::SeqCst) {
        match arbiter.read_text(&mut buf) {
            Ok(None) => thread::sleep(SUPPRESSED_BACKOFF),
            Ok(Some(0)) => {},
            Ok(Some(n)) => {
                for line in assembler.push(&buf[..n]) {
                    if tx.send(line).is_err() {
                        debug!("Line receiver gone, stopping text drain");
                        return Ok(());
                    }
                }
            },
            Err(e) => {
                warn!("Text drain stopped: {e}");
                return Err(e);
            },
        }
    }

    if let Some(rest) = assembler.finish() {
        let _ = tx.send(rest);
    }
    Ok(())
}

/// Splits a byte stream into cleaned text lines.
///
/// `\n`, `\r` and `\r\n` all end a line; empty lines are skipped. Partial
/// UTF-8 sequences and unterminated lines are held until more bytes arrive.
#[derive(Debug, Default)]
pub struct LineAssembler {
    bytes: Vec<u8>,
    pending: String,
}

impl LineAssembler {
    /// Feed bytes and return any lines they completed.
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.bytes.extend_from_slice(data);
        let text = drain_utf8_lossy(&mut self.bytes);
        self.pending.push_str(&text);

        let mut lines = Vec::new();
        while let Some(end) = self.pending.find(['\r', '\n']) {
            let line = clean_monitor_text(&self.pending[..end]);
            self.pending.drain(..=end);
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }

    /// Take the unterminated remainder, if any.
    pub fn finish(&mut self) -> Option<String> {
        let line = clean_monitor_text(&std::mem::take(&mut self.pending));
        self.bytes.clear();
        (!line.is_empty()).then_some(line)
    }
}

/// Drain buffered bytes into text without stalling on invalid bytes.
///
/// - Valid UTF-8 is emitted as-is.
/// - Invalid byte sequences emit `�` and decoding continues.
/// - An incomplete UTF-8 suffix stays in `buffer` for the next read.
pub fn drain_utf8_lossy(buffer: &mut Vec<u8>) -> String {
    let mut output = String::new();

    loop {
        match std::str::from_utf8(buffer) {
            Ok(valid) => {
                output.push_str(valid);
                buffer.clear();
                break;
            },
            Err(err) => {
                let valid_up_to = err.valid_up_to();
                if let Ok(valid) = std::str::from_utf8(&buffer[..valid_up_to]) {
                    output.push_str(valid);
                }

                if let Some(invalid_len) = err.error_len() {
                    output.push('�');
                    let drain_to = valid_up_to.saturating_add(invalid_len).min(buffer.len());
                    buffer.drain(..drain_to);
                } else {
                    buffer.drain(..valid_up_to);
                    break;
                }
            },
        }
    }

    output
}

/// Drop control characters other than tab from device text.
pub fn clean_monitor_text(text: &str) -> String {
    text.chars()
        .filter(|ch| *ch == '\t' || !ch.is_control())
        .collect()
}
