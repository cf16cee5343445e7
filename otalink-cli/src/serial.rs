//! Serial port selection.
//!
//! Order of precedence: `--port`/`OTALINK_PORT`, the configured port, then
//! the ports present on the host. A single candidate is used directly;
//! several candidates need an interactive prompt.

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    console::style,
    dialoguer::{Confirm, Error as DialoguerError, Select, theme::ColorfulTheme},
    log::{debug, info},
    otalink::{NativePortEnumerator, PortEnumerator, PortInfo},
    std::io::IsTerminal,
};

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI or environment.
    pub port: Option<String>,
    /// Non-interactive mode (fail if a choice is needed).
    pub non_interactive: bool,
}

/// The chosen port and whether the user picked it from a prompt.
pub struct SelectedPort {
    /// Port name/path.
    pub name: String,
    /// Whether the port came from an interactive choice.
    pub prompted: bool,
}

fn usage_err(message: &str) -> anyhow::Error {
    CliError::Usage(message.to_string()).into()
}

/// Select the serial port to use.
pub fn select_serial_port(options: &SerialOptions, config: &Config) -> Result<SelectedPort> {
    if let Some(name) = &options.port {
        return Ok(SelectedPort {
            name: name.clone(),
            prompted: false,
        });
    }

    if let Some(name) = &config.connection.serial {
        debug!("Using port from config: {name}");
        return Ok(SelectedPort {
            name: name.clone(),
            prompted: false,
        });
    }

    let ports = NativePortEnumerator::list_ports()?;
    choose_port(ports, options.non_interactive)
}

fn choose_port(mut ports: Vec<PortInfo>, non_interactive: bool) -> Result<SelectedPort> {
    match ports.len() {
        0 => Err(usage_err(
            "No serial ports found. Connect the device or pass --port.",
        )),
        1 => {
            let port = ports.remove(0);
            info!("Auto-selected port: {}", port.name);
            Ok(SelectedPort {
                name: port.name,
                prompted: false,
            })
        },
        _ if non_interactive => Err(usage_err(
            "Found multiple serial ports; pass --port in non-interactive mode.",
        )),
        _ => {
            ensure_interactive_terminal()?;
            select_port_interactive(ports)
        },
    }
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "Multiple serial ports found and no terminal to prompt on; pass --port.",
        ))
    }
}

pub(crate) fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                CliError::Cancelled("Selection cancelled".to_string()).into()
            } else {
                usage_err(&format!("Prompt failed: {io_err}"))
            }
        },
    }
}

/// Describe a port for prompts and listings.
pub fn describe_port(port: &PortInfo) -> String {
    let mut label = port.name.clone();
    if let Some(product) = &port.product {
        label.push_str(&format!(" - {product}"));
    }
    if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
        label.push_str(&format!(" ({vid:04X}:{pid:04X})"));
    }
    label
}

fn select_port_interactive(ports: Vec<PortInfo>) -> Result<SelectedPort> {
    let items: Vec<String> = ports.iter().map(describe_port).collect();

    let index = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select a serial port")
        .items(&items)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match index {
        Some(i) => Ok(SelectedPort {
            name: ports[i].name.clone(),
            prompted: true,
        }),
        None => Err(CliError::Cancelled("Selection cancelled".to_string()).into()),
    }
}

/// Offer to store an interactively chosen port in the local config.
pub fn ask_remember_port(name: &str, config: &mut Config) -> Result<()> {
    let remember = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Remember {} for next time?", style(name).cyan()))
        .default(false)
        .interact()
        .map_err(map_prompt_error)?;

    if remember {
        config.save_port(name)?;
    }
    Ok(())
}
