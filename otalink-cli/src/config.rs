//! Configuration file support for otalink.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (OTALINK_*)
//! 3. Local config file (./otalink.toml)
//! 4. Global config file (~/.config/otalink/config.toml)
//!
//! ```toml
//! [connection]
//! serial = "/dev/ttyACM0"
//! baud = 115200
//!
//! [transfer]
//! ack_timeout_ms = 2000
//! max_retries = 2
//! backoff_ms = 100
//! exponential = true
//! protocol = "standard"
//! ```

use anyhow::{Result, bail};
use directories::ProjectDirs;
use log::{debug, info, warn};
use otalink::{FrameProtocol, RetryPolicy, TransferConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Local configuration file name.
pub const LOCAL_CONFIG_FILE: &str = "otalink.toml";

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyACM0" or "COM3").
    pub serial: Option<String>,
    /// Default baud rate.
    pub baud: Option<u32>,
}

/// Transfer session defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferSection {
    /// Time to wait for each device response, in milliseconds.
    pub ack_timeout_ms: Option<u64>,
    /// Retries per DATA chunk.
    pub max_retries: Option<u32>,
    /// Delay before the first retry, in milliseconds.
    pub backoff_ms: Option<u64>,
    /// Double the retry delay each time.
    pub exponential: Option<bool>,
    /// Protocol revision name (`standard` or `legacy`).
    pub protocol: Option<String>,
    /// Firmware version announced in the HEADER frame.
    pub fw_version: Option<u32>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Transfer settings.
    #[serde(default)]
    pub transfer: TransferSection,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "otalink").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one. Values set in `other` win.
    fn merge(&mut self, other: Self) {
        let Self {
            connection,
            transfer,
        } = other;

        if connection.serial.is_some() {
            self.connection.serial = connection.serial;
        }
        if connection.baud.is_some() {
            self.connection.baud = connection.baud;
        }

        if transfer.ack_timeout_ms.is_some() {
            self.transfer.ack_timeout_ms = transfer.ack_timeout_ms;
        }
        if transfer.max_retries.is_some() {
            self.transfer.max_retries = transfer.max_retries;
        }
        if transfer.backoff_ms.is_some() {
            self.transfer.backoff_ms = transfer.backoff_ms;
        }
        if transfer.exponential.is_some() {
            self.transfer.exponential = transfer.exponential;
        }
        if transfer.protocol.is_some() {
            self.transfer.protocol = transfer.protocol;
        }
        if transfer.fw_version.is_some() {
            self.transfer.fw_version = transfer.fw_version;
        }
    }

    /// Build library transfer settings from the file values.
    pub fn transfer_config(&self) -> Result<TransferConfig> {
        let mut config = TransferConfig::default();
        let section = &self.transfer;

        if let Some(ms) = section.ack_timeout_ms {
            config.ack_timeout = Duration::from_millis(ms);
        }
        if let Some(name) = &section.protocol {
            let Some(protocol) = FrameProtocol::from_name(name) else {
                bail!("unknown protocol revision '{name}' (expected 'standard' or 'legacy')");
            };
            config.protocol = protocol;
        }

        config.retry = RetryPolicy {
            max_retries: section.max_retries.unwrap_or(0),
            backoff: Duration::from_millis(section.backoff_ms.unwrap_or(0)),
            exponential: section.exponential.unwrap_or(false),
        };

        Ok(config)
    }

    /// Remember a serial port in the local config file.
    pub fn save_port(&mut self, serial: &str) -> Result<()> {
        let path = Path::new(LOCAL_CONFIG_FILE);
        let mut on_disk = Self::load_from_file(path).unwrap_or_default();
        on_disk.connection.serial = Some(serial.to_string());
        self.connection.serial = Some(serial.to_string());

        fs::write(path, toml::to_string_pretty(&on_disk)?)?;
        info!("Saved port configuration to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.connection.serial.is_none());
        assert!(config.connection.baud.is_none());
        assert_eq!(config.transfer, TransferSection::default());
    }

    #[test]
    fn test_parse_full_file() {
        let config: Config = toml::from_str(
            r#"
            [connection]
            serial = "/dev/ttyACM0"
            baud = 230400

            [transfer]
            ack_timeout_ms = 500
            max_retries = 3
            backoff_ms = 20
            exponential = true
            protocol = "legacy"
            fw_version = 9
            "#,
        )
        .unwrap();

        assert_eq!(config.connection.serial.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(config.connection.baud, Some(230400));
        assert_eq!(config.transfer.fw_version, Some(9));

        let transfer = config.transfer_config().unwrap();
        assert_eq!(transfer.ack_timeout, Duration::from_millis(500));
        assert_eq!(transfer.retry, RetryPolicy::exponential(3, Duration::from_millis(20)));
        assert_eq!(transfer.protocol, FrameProtocol::legacy());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: Config = toml::from_str("[connection]\nbaud = 9600\n").unwrap();
        let transfer = config.transfer_config().unwrap();
        assert_eq!(transfer, TransferConfig::default());
    }

    #[test]
    fn test_unknown_protocol_is_rejected() {
        let mut config = Config::default();
        config.transfer.protocol = Some("v3".into());
        assert!(config.transfer_config().is_err());
    }

    #[test]
    fn test_merge_prefers_other() {
        let mut base = Config::default();
        base.connection.serial = Some("/dev/ttyUSB0".into());
        base.transfer.max_retries = Some(1);

        let mut other = Config::default();
        other.connection.serial = Some("/dev/ttyACM1".into());
        other.transfer.ack_timeout_ms = Some(750);

        base.merge(other);
        assert_eq!(base.connection.serial.as_deref(), Some("/dev/ttyACM1"));
        assert_eq!(base.transfer.max_retries, Some(1));
        assert_eq!(base.transfer.ack_timeout_ms, Some(750));
    }

    #[test]
    fn test_merge_empty_keeps_base() {
        let mut base = Config::default();
        base.connection.baud = Some(57600);
        base.transfer.protocol = Some("standard".into());
        let expected = base.clone();

        base.merge(Config::default());
        assert_eq!(base, expected);
    }

    #[test]
    fn test_load_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        fs::write(&path, "[transfer]\nmax_retries = 4\n").unwrap();

        let config = Config::load_from_path(&path);
        assert_eq!(config.transfer.max_retries, Some(4));
    }

    #[test]
    fn test_load_from_invalid_path_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[transfer\nmax_retries = ").unwrap();

        assert_eq!(Config::load_from_path(&path), Config::default());
        assert_eq!(
            Config::load_from_path(&dir.path().join("missing.toml")),
            Config::default()
        );
    }

    #[test]
    fn test_serialize_roundtrip() {
        let mut config = Config::default();
        config.connection.serial = Some("COM3".into());
        config.transfer.exponential = Some(true);

        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_global_config_path_ends_with_config_toml() {
        if let Some(path) = Config::global_config_path() {
            assert!(path.ends_with("config.toml"));
        }
    }
}
