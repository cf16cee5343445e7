//! otalink CLI - Command-line tool for OTA firmware transfer.
//!
//! ## Features
//!
//! - Send firmware images over the framed OTA protocol
//! - Interactive console mixing device text output and OTA sessions
//! - Firmware image inspection
//! - Interactive serial port selection
//! - Shell completion generation
//! - Environment variable and config file support

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use otalink::{ChannelArbiter, FrameProtocol, NativePort, SerialConfig};
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

mod commands;
mod config;
mod serial;

use config::Config;
use serial::{SerialOptions, ask_remember_port, select_serial_port};

/// Default baud rate when neither flag, environment nor config sets one.
const DEFAULT_BAUD: u32 = 115_200;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Install the Ctrl-C handler. Without it, Ctrl-C terminates the process.
fn install_interrupt_handler() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::SeqCst)) {
            log::warn!("Failed to install Ctrl-C handler: {e}");
        }
    });
}

fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// CLI error classes that map to distinct exit codes.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Invalid invocation or missing setup (exit code 2).
    #[error("{0}")]
    Usage(String),
    /// The user cancelled an operation (exit code 130).
    #[error("{0}")]
    Cancelled(String),
}

impl CliError {
    fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => 2,
            Self::Cancelled(_) => 130,
        }
    }
}

/// otalink - Push firmware to a device over a framed serial OTA protocol.
///
/// Environment variables:
///   OTALINK_PORT              - Default serial port
///   OTALINK_BAUD              - Default baud rate (default: 115200)
///   OTALINK_TIMEOUT_MS        - Response timeout in milliseconds (default: 2000)
///   OTALINK_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "otalink")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub(crate) struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "OTALINK_PORT")]
    port: Option<String>,

    /// Baud rate.
    #[arg(short, long, global = true, env = "OTALINK_BAUD")]
    baud: Option<u32>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "OTALINK_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Protocol revision spoken by the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub(crate) enum ProtocolArg {
    /// SOF 0xA5 / EOF 0xB6 with CRC-32 trailers (default).
    Standard,
    /// SOF 0xAA / EOF 0xBB with zeroed checksums.
    Legacy,
}

impl From<ProtocolArg> for FrameProtocol {
    fn from(arg: ProtocolArg) -> Self {
        match arg {
            ProtocolArg::Standard => FrameProtocol::standard(),
            ProtocolArg::Legacy => FrameProtocol::legacy(),
        }
    }
}

/// Transfer session options shared by `send` and `console`.
#[derive(Args, Debug, Clone, Default)]
pub(crate) struct TransferArgs {
    /// Time to wait for each device response, in milliseconds.
    #[arg(long, env = "OTALINK_TIMEOUT_MS", value_name = "MS")]
    timeout_ms: Option<u64>,

    /// Retries per DATA chunk after a NACK or timeout.
    #[arg(long, value_name = "N")]
    retries: Option<u32>,

    /// Delay before retrying a chunk, in milliseconds.
    #[arg(long, value_name = "MS")]
    backoff_ms: Option<u64>,

    /// Double the retry delay each time.
    #[arg(long, overrides_with = "no_exponential")]
    exponential: bool,

    /// Keep the retry delay fixed, even if the config file asks for exponential backoff.
    #[arg(long, overrides_with = "exponential")]
    no_exponential: bool,

    /// Protocol revision.
    #[arg(long, value_enum)]
    protocol: Option<ProtocolArg>,

    /// Firmware version announced in the header.
    #[arg(long, value_name = "N")]
    fw_version: Option<u32>,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a firmware image to the device.
    Send {
        /// Path to the raw firmware image.
        firmware: PathBuf,

        #[command(flatten)]
        transfer: TransferArgs,

        /// Do not send the `ota` text command first (device already waits for frames).
        #[arg(long)]
        no_enter: bool,

        /// Send `run` after a successful transfer and show the device output.
        #[arg(long)]
        run: bool,

        /// Wait this long after opening the port before talking to the device.
        #[arg(long, value_name = "MS", default_value_t = 0)]
        settle_ms: u64,
    },

    /// Interactive console: device output plus text commands and OTA sends.
    Console {
        #[command(flatten)]
        transfer: TransferArgs,
    },

    /// Show firmware image information.
    Info {
        /// Path to the raw firmware image.
        firmware: PathBuf,

        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List available serial ports.
    ListPorts {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completions.
    Completions {
        /// Shell type (detected from $SHELL if omitted).
        #[arg(value_enum)]
        shell: Option<Shell>,
    },
}

fn main() {
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    debug!(
        "otalink v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(err) = run(&cli) {
        eprintln!("{} {err:#}", style("Error:").red().bold());
        let code = err
            .downcast_ref::<CliError>()
            .map_or(1, CliError::exit_code);
        std::process::exit(code);
    }
}

fn init_logging(verbose: u8, quiet: bool) {
    let log_level = if quiet {
        "warn"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(verbose >= 2)
        .format_timestamp(if verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();
}

fn run(cli: &Cli) -> Result<()> {
    let mut config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Send {
            firmware,
            transfer,
            no_enter,
            run: run_after,
            settle_ms,
        } => commands::send::cmd_send(
            cli,
            &mut config,
            &commands::send::SendOptions {
                firmware,
                transfer,
                enter: !*no_enter,
                run: *run_after,
                settle: Duration::from_millis(*settle_ms),
            },
        ),
        Commands::Console { transfer } => commands::console::cmd_console(cli, &mut config, transfer),
        Commands::Info { firmware, json } => commands::info::cmd_info(firmware, *json),
        Commands::ListPorts { json } => commands::info::cmd_list_ports(*json),
        Commands::Completions { shell } => commands::completions::cmd_completions(*shell),
    }
}

/// Resolve the serial port from CLI args, config or interactive selection.
fn get_port(cli: &Cli, config: &mut Config) -> Result<String> {
    let options = SerialOptions {
        port: cli.port.clone(),
        non_interactive: cli.non_interactive,
    };

    let selected = select_serial_port(&options, config)?;
    if selected.prompted && !cli.non_interactive {
        ask_remember_port(&selected.name, config)?;
    }

    Ok(selected.name)
}

/// Baud rate from CLI/environment, then config, then the default.
fn baud_rate(cli: &Cli, config: &Config) -> u32 {
    cli.baud
        .or(config.connection.baud)
        .unwrap_or(DEFAULT_BAUD)
}

/// Open the selected port and wrap it for shared text/frame use.
fn open_channel(cli: &Cli, config: &mut Config) -> Result<Arc<ChannelArbiter<NativePort>>> {
    let port_name = get_port(cli, config)?;
    let baud = baud_rate(cli, config);

    if !cli.quiet {
        eprintln!(
            "{} Using port {} at {} baud",
            style("🔌").cyan(),
            style(&port_name).bold(),
            baud
        );
    }

    let port = NativePort::open(&SerialConfig::new(&port_name, baud))
        .with_context(|| format!("Failed to open {port_name}"))?;
    Ok(Arc::new(ChannelArbiter::new(port)))
}

#[cfg(test)]
mod cli_tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_send_with_options() {
        let cli = Cli::try_parse_from([
            "otalink",
            "--port",
            "/dev/ttyACM0",
            "send",
            "app.bin",
            "--retries",
            "3",
            "--backoff-ms",
            "50",
            "--exponential",
            "--protocol",
            "legacy",
            "--fw-version",
            "7",
            "--run",
        ])
        .unwrap();

        assert_eq!(cli.port.as_deref(), Some("/dev/ttyACM0"));
        match cli.command {
            Commands::Send {
                firmware,
                transfer,
                no_enter,
                run,
                settle_ms,
            } => {
                assert_eq!(firmware, PathBuf::from("app.bin"));
                assert_eq!(transfer.retries, Some(3));
                assert_eq!(transfer.backoff_ms, Some(50));
                assert!(transfer.exponential);
                assert_eq!(transfer.protocol, Some(ProtocolArg::Legacy));
                assert_eq!(transfer.fw_version, Some(7));
                assert!(!no_enter);
                assert!(run);
                assert_eq!(settle_ms, 0);
            },
            _ => panic!("expected send"),
        }
    }

    #[test]
    fn test_parse_info_json() {
        let cli = Cli::try_parse_from(["otalink", "info", "fw.bin", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::Info { json: true, .. }));
    }

    #[test]
    fn test_unknown_protocol_rejected() {
        assert!(Cli::try_parse_from(["otalink", "send", "fw.bin", "--protocol", "v2"]).is_err());
    }

    #[test]
    fn test_verbose_count() {
        let cli = Cli::try_parse_from(["otalink", "-vv", "list-ports"]).unwrap();
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_baud_precedence() {
        let mut config = Config::default();
        let cli = Cli::try_parse_from(["otalink", "list-ports"]).unwrap();
        if cli.baud.is_none() {
            assert_eq!(baud_rate(&cli, &config), DEFAULT_BAUD);
            config.connection.baud = Some(9600);
            assert_eq!(baud_rate(&cli, &config), 9600);
        }

        let cli = Cli::try_parse_from(["otalink", "-b", "230400", "list-ports"]).unwrap();
        assert_eq!(baud_rate(&cli, &config), 230_400);
    }

    #[test]
    fn test_protocol_arg_conversion() {
        assert_eq!(FrameProtocol::from(ProtocolArg::Legacy), FrameProtocol::legacy());
        assert_eq!(FrameProtocol::from(ProtocolArg::Standard), FrameProtocol::standard());
    }

    #[test]
    fn test_cli_error_exit_codes() {
        assert_eq!(CliError::Usage("x".into()).exit_code(), 2);
        assert_eq!(CliError::Cancelled("x".into()).exit_code(), 130);
    }
}
