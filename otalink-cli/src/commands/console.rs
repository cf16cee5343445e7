//! Interactive console command implementation.
//!
//! - Background drain: device lines → terminal
//! - Stdin reader thread: one line at a time → main loop
//! - Main loop: text commands go to the device, `send` runs an OTA session
//! - Ctrl-C or `exit`/`quit`: leave

use anyhow::Result;
use console::style;
use dialoguer::{Confirm, Input, theme::ColorfulTheme};
use log::{debug, warn};
use otalink::{ChannelArbiter, NativePort, TextDrain, TransferConfig};
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::thread;
use std::time::Duration;

use super::send::{firmware_version, load_image, resolve_transfer_config, transfer_with_progress};
use crate::config::Config;
use crate::serial::map_prompt_error;
use crate::{Cli, TransferArgs, install_interrupt_handler, open_channel, was_interrupted};

/// How often the main loop checks for device output and Ctrl-C.
const POLL: Duration = Duration::from_millis(50);

/// A parsed console input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ConsoleCommand {
    /// Blank line.
    Empty,
    /// Leave the console.
    Exit,
    /// Show local help.
    Help,
    /// Run an OTA session, optionally with a firmware path.
    Send(Option<PathBuf>),
    /// Forward a text command to the device.
    Text(String),
}

impl ConsoleCommand {
    pub(crate) fn parse(line: &str) -> Self {
        let line = line.trim();
        let (head, rest) = line
            .split_once(char::is_whitespace)
            .map_or((line, ""), |(h, r)| (h, r.trim()));

        match head {
            "" => Self::Empty,
            "exit" | "quit" => Self::Exit,
            ":help" | "?" => Self::Help,
            "send" if rest.is_empty() => Self::Send(None),
            "send" => Self::Send(Some(PathBuf::from(rest))),
            _ => Self::Text(line.to_string()),
        }
    }
}

fn print_help() {
    eprintln!("{}", style("Console commands:").bold());
    eprintln!("  send [PATH]   run an OTA transfer (prompts for PATH if omitted)");
    eprintln!("  exit | quit   leave the console (or press Ctrl-C)");
    eprintln!("  :help | ?     show this help");
    eprintln!("  anything else is sent to the device, e.g. ota, run, help");
}

/// Spawn the stdin reader.
///
/// After each line the reader waits for a token on the returned sender, so
/// prompts shown by the main loop get stdin to themselves.
fn spawn_stdin_reader() -> Result<(Receiver<String>, SyncSender<()>)> {
    let (line_tx, line_rx) = mpsc::sync_channel::<String>(0);
    let (resume_tx, resume_rx) = mpsc::sync_channel::<()>(1);

    thread::Builder::new()
        .name("otalink-stdin".into())
        .spawn(move || {
            let stdin = io::stdin();
            let mut line = String::new();
            loop {
                line.clear();
                match stdin.lock().read_line(&mut line) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {},
                }
                if line_tx.send(line.clone()).is_err() || resume_rx.recv().is_err() {
                    break;
                }
            }
            debug!("Stdin reader finished");
        })?;

    Ok((line_rx, resume_tx))
}

struct Session<'a> {
    cli: &'a Cli,
    config: &'a Config,
    transfer: &'a TransferArgs,
    arbiter: &'a ChannelArbiter<NativePort>,
}

impl Session<'_> {
    fn send(&self, path: Option<PathBuf>) -> Result<()> {
        let path = match path {
            Some(path) => path,
            None if self.cli.non_interactive => {
                eprintln!("{} usage: send PATH", style("!").yellow());
                return Ok(());
            },
            None => {
                let input: String = Input::with_theme(&ColorfulTheme::default())
                    .with_prompt("Firmware file path")
                    .interact_text()
                    .map_err(map_prompt_error)?;
                PathBuf::from(input.trim())
            },
        };

        let config: TransferConfig = resolve_transfer_config(self.transfer, self.config)?;
        let version = firmware_version(self.transfer, self.config);
        let image = load_image(&path, version, self.cli.quiet)?;
        let report = transfer_with_progress(self.arbiter, &image, config, true, self.cli.quiet)?;

        eprintln!(
            "{} Sent {} chunks ({} bytes, {} retries)",
            style("✓").green(),
            report.chunks_sent,
            report.bytes_sent,
            report.retries
        );

        if !self.cli.non_interactive {
            let start = Confirm::with_theme(&ColorfulTheme::default())
                .with_prompt("Start the new firmware now?")
                .default(true)
                .interact()
                .map_err(map_prompt_error)?;
            if start {
                self.arbiter.send_text("run")?;
            }
        }
        Ok(())
    }
}

/// Console command implementation.
pub(crate) fn cmd_console(cli: &Cli, config: &mut Config, transfer: &TransferArgs) -> Result<()> {
    // Fail on bad transfer settings before touching the port.
    resolve_transfer_config(transfer, config)?;

    let arbiter = open_channel(cli, config)?;
    let drain = TextDrain::spawn(Arc::clone(&arbiter))?;
    install_interrupt_handler();

    eprintln!(
        "{} Connected. Type {} for console commands, {} to leave.",
        style("✓").green(),
        style(":help").cyan(),
        style("exit").cyan()
    );

    let (lines, resume) = spawn_stdin_reader()?;
    let session = Session {
        cli,
        config,
        transfer,
        arbiter: &arbiter,
    };

    loop {
        for line in drain.try_lines() {
            println!("{line}");
        }

        if was_interrupted() {
            eprintln!("\n{}", style("Exiting.").dim());
            break;
        }

        let input = match lines.recv_timeout(POLL) {
            Ok(input) => input,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        match ConsoleCommand::parse(&input) {
            ConsoleCommand::Empty => {},
            ConsoleCommand::Exit => break,
            ConsoleCommand::Help => print_help(),
            ConsoleCommand::Send(path) => {
                if let Err(e) = session.send(path) {
                    eprintln!("{} {e:#}", style("Error:").red().bold());
                }
            },
            ConsoleCommand::Text(text) => arbiter.send_text(&text)?,
        }

        if resume.send(()).is_err() {
            break;
        }
    }

    if let Err(e) = drain.stop() {
        warn!("Text drain ended with an error: {e}");
    }
    Ok(())
}
