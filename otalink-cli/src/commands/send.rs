//! Send command implementation.

use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use otalink::{
    ChannelArbiter, FirmwareImage, NativePort, OtaSequencer, Port, RetryPolicy, TextDrain,
    TransferConfig, TransferReport, run_ota,
};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::{Cli, TransferArgs, open_channel, use_fancy_output};

/// Pause between END and `run`, while the device finalizes the image.
const RUN_DELAY: Duration = Duration::from_secs(1);

/// How long device output is shown after `run`.
const RUN_ECHO: Duration = Duration::from_secs(3);

/// Resolved options of one `send` invocation.
pub(crate) struct SendOptions<'a> {
    pub firmware: &'a Path,
    pub transfer: &'a TransferArgs,
    pub enter: bool,
    pub run: bool,
    pub settle: Duration,
}

/// Combine config file values with CLI overrides.
pub(crate) fn resolve_transfer_config(args: &TransferArgs, config: &Config) -> Result<TransferConfig> {
    let mut resolved = config.transfer_config()?;

    if let Some(ms) = args.timeout_ms {
        resolved.ack_timeout = Duration::from_millis(ms);
    }
    if let Some(protocol) = args.protocol {
        resolved.protocol = protocol.into();
    }

    let file_retry = resolved.retry;
    resolved.retry = RetryPolicy {
        max_retries: args.retries.unwrap_or(file_retry.max_retries),
        backoff: args
            .backoff_ms
            .map_or(file_retry.backoff, Duration::from_millis),
        exponential: exponential_override(args).unwrap_or(file_retry.exponential),
    };

    Ok(resolved)
}

/// `Some` when the command line picked a backoff shape.
fn exponential_override(args: &TransferArgs) -> Option<bool> {
    if args.exponential {
        Some(true)
    } else if args.no_exponential {
        Some(false)
    } else {
        None
    }
}

/// Firmware version from CLI, then config, then zero.
pub(crate) fn firmware_version(args: &TransferArgs, config: &Config) -> u32 {
    args.fw_version
        .or(config.transfer.fw_version)
        .unwrap_or(0)
}

/// Load an image and describe it on stderr.
pub(crate) fn load_image(path: &Path, version: u32, quiet: bool) -> Result<FirmwareImage> {
    let image = FirmwareImage::from_file(path, version)
        .with_context(|| format!("Failed to load firmware {}", path.display()))?;

    if !quiet {
        eprintln!(
            "{} {} ({} bytes, CRC-32 0x{:08X}, version {})",
            style("📦").cyan(),
            path.display(),
            image.size(),
            image.checksum(),
            image.version()
        );
    }
    Ok(image)
}

/// Byte progress bar on stderr, hidden when quiet or not on a terminal.
pub(crate) fn progress_bar(total: u64, quiet: bool) -> ProgressBar {
    if quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(total);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb
}

/// Run one OTA session on an open channel, with a progress bar.
pub(crate) fn transfer_with_progress(
    arbiter: &ChannelArbiter<NativePort>,
    image: &FirmwareImage,
    config: TransferConfig,
    enter: bool,
    quiet: bool,
) -> Result<TransferReport> {
    let pb = progress_bar(u64::from(image.size()), quiet);
    pb.set_message("sending");
    let progress = |done: usize, _total: usize| pb.set_position(done as u64);

    let result = if enter {
        run_ota(arbiter, image, config, progress)
    } else {
        let mut port = arbiter.frame_mode();
        port.clear_buffers()?;
        OtaSequencer::new(&mut *port, config).transfer(image, progress)
    };

    match result {
        Ok(report) => {
            pb.finish_with_message("done");
            Ok(report)
        },
        Err(e) => {
            pb.abandon_with_message("failed");
            Err(e).context("OTA transfer failed")
        },
    }
}

/// Print device lines for `window`.
fn echo_device_output(drain: &TextDrain, window: Duration) {
    let deadline = Instant::now() + window;
    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        match drain.lines().recv_timeout(remaining) {
            Ok(line) => println!("{} {line}", style("device>").dim()),
            Err(_) => break,
        }
    }
}

/// Send command implementation.
pub(crate) fn cmd_send(cli: &Cli, config: &mut Config, options: &SendOptions<'_>) -> Result<()> {
    let transfer = resolve_transfer_config(options.transfer, config)?;
    let version = firmware_version(options.transfer, config);
    let image = load_image(options.firmware, version, cli.quiet)?;

    let arbiter = open_channel(cli, config)?;
    if !options.settle.is_zero() {
        info!("Waiting {:?} for the device to settle", options.settle);
        thread::sleep(options.settle);
        arbiter.frame_mode().clear_buffers()?;
    }

    let drain = TextDrain::spawn(Arc::clone(&arbiter))?;
    let result = transfer_with_progress(&arbiter, &image, transfer, options.enter, cli.quiet);

    // Device text printed around the session.
    for line in drain.try_lines() {
        println!("{} {line}", style("device>").dim());
    }

    let report = match result {
        Ok(report) => report,
        Err(e) => {
            if let Err(stop_err) = drain.stop() {
                warn!("Text drain ended with an error: {stop_err}");
            }
            return Err(e);
        },
    };

    if !cli.quiet {
        eprintln!(
            "{} Sent {} chunks ({} bytes, {} retries)",
            style("✓").green(),
            report.chunks_sent,
            report.bytes_sent,
            report.retries
        );
    }

    if options.run {
        thread::sleep(RUN_DELAY);
        arbiter.send_text("run")?;
        if !cli.quiet {
            eprintln!("{} Sent 'run', device output follows", style("▶").cyan());
        }
        echo_device_output(&drain, RUN_ECHO);
    }

    drain.stop().context("Serial link failed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use otalink::FrameProtocol;

    fn transfer_args(argv: &[&str]) -> TransferArgs {
        #[derive(Parser)]
        struct Wrapper {
            #[command(flatten)]
            transfer: TransferArgs,
        }

        let mut full = vec!["test"];
        full.extend_from_slice(argv);
        Wrapper::try_parse_from(full).unwrap().transfer
    }

    #[test]
    fn test_resolve_defaults() {
        let args = TransferArgs::default();
        let resolved = resolve_transfer_config(&args, &Config::default()).unwrap();
        assert_eq!(resolved, TransferConfig::default());
    }

    #[test]
    fn test_cli_overrides_config() {
        let mut config = Config::default();
        config.transfer.ack_timeout_ms = Some(900);
        config.transfer.max_retries = Some(1);
        config.transfer.backoff_ms = Some(30);
        config.transfer.protocol = Some("legacy".into());

        let args = transfer_args(&["--timeout-ms", "250", "--retries", "4", "--protocol", "standard"]);
        let resolved = resolve_transfer_config(&args, &config).unwrap();

        assert_eq!(resolved.ack_timeout, Duration::from_millis(250));
        assert_eq!(resolved.retry.max_retries, 4);
        assert_eq!(resolved.retry.backoff, Duration::from_millis(30));
        assert_eq!(resolved.protocol, FrameProtocol::standard());
    }

    #[test]
    fn test_config_used_without_flags() {
        let mut config = Config::default();
        config.transfer.exponential = Some(true);
        config.transfer.protocol = Some("legacy".into());

        let resolved = resolve_transfer_config(&TransferArgs::default(), &config).unwrap();
        assert!(resolved.retry.exponential);
        assert_eq!(resolved.protocol, FrameProtocol::legacy());
    }

    #[test]
    fn test_cli_can_turn_off_exponential_backoff() {
        let mut config = Config::default();
        config.transfer.exponential = Some(true);

        let resolved = resolve_transfer_config(&transfer_args(&["--no-exponential"]), &config).unwrap();
        assert!(!resolved.retry.exponential);

        // The last of the two flags wins.
        let args = transfer_args(&["--no-exponential", "--exponential"]);
        assert!(resolve_transfer_config(&args, &Config::default()).unwrap().retry.exponential);
    }

    #[test]
    fn test_firmware_version_precedence() {
        let mut config = Config::default();
        assert_eq!(firmware_version(&TransferArgs::default(), &config), 0);

        config.transfer.fw_version = Some(3);
        assert_eq!(firmware_version(&TransferArgs::default(), &config), 3);

        let args = transfer_args(&["--fw-version", "12"]);
        assert_eq!(firmware_version(&args, &config), 12);
    }

    #[test]
    fn test_load_image_errors_on_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_image(&dir.path().join("nope.bin"), 0, true).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to load firmware"));
    }
}
