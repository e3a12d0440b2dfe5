//! Configuration file support for bootlink.
//!
//! Configuration is loaded from multiple sources with the following priority
//! (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (BOOTLINK_*)
//! 3. Local config file (./bootlink.toml)
//! 4. Global config file (~/.config/bootlink/config.toml)

use directories::ProjectDirs;
use log::{debug, warn};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Connection configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub port: Option<String>,
    /// Default baud rate.
    pub baud: Option<u32>,
}

/// Flash configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FlashConfig {
    /// Default fragment size in bytes.
    pub fragment_size: Option<usize>,
    /// Skip verification by default.
    #[serde(default)]
    pub skip_verify: bool,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Flash settings.
    #[serde(default)]
    pub flash: FlashConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Global config first, local overrides it.
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                if let Some(global) = Self::load_from_file(&global_path) {
                    debug!("Loaded global config from {}", global_path.display());
                    config.merge(global);
                }
            }
        }

        if let Some(local) = Self::load_from_file(Path::new("bootlink.toml")) {
            debug!("Loaded local config from bootlink.toml");
            config.merge(local);
        }

        config
    }

    /// Fragment size with config fallback applied.
    pub fn effective_fragment_size(&self, arg: Option<usize>) -> usize {
        arg.or(self.flash.fragment_size).unwrap_or(1024)
    }

    fn global_config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "bootlink")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        let contents = fs::read_to_string(path).ok()?;
        match toml::from_str(&contents) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!("Ignoring invalid TOML in {}: {e}", path.display());
                None
            }
        }
    }

    fn merge(&mut self, other: Self) {
        if other.connection.port.is_some() {
            self.connection.port = other.connection.port;
        }
        if other.connection.baud.is_some() {
            self.connection.baud = other.connection.baud;
        }
        if other.flash.fragment_size.is_some() {
            self.flash.fragment_size = other.flash.fragment_size;
        }
        self.flash.skip_verify |= other.flash.skip_verify;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let config: Config = toml::from_str(
            r#"
            [connection]
            port = "/dev/ttyUSB1"
            baud = 921600

            [flash]
            fragment_size = 512
            skip_verify = true
            "#,
        )
        .unwrap();
        assert_eq!(config.connection.port.as_deref(), Some("/dev/ttyUSB1"));
        assert_eq!(config.connection.baud, Some(921_600));
        assert_eq!(config.flash.fragment_size, Some(512));
        assert!(config.flash.skip_verify);
    }

    #[test]
    fn test_parse_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.connection.port.is_none());
        assert!(!config.flash.skip_verify);
    }

    #[test]
    fn test_merge_prefers_other() {
        let mut base: Config = toml::from_str("[connection]\nport = \"COM1\"").unwrap();
        let local: Config = toml::from_str("[connection]\nport = \"COM7\"").unwrap();
        base.merge(local);
        assert_eq!(base.connection.port.as_deref(), Some("COM7"));
    }

    #[test]
    fn test_effective_fragment_size_precedence() {
        let config: Config = toml::from_str("[flash]\nfragment_size = 512").unwrap();
        assert_eq!(config.effective_fragment_size(Some(256)), 256);
        assert_eq!(config.effective_fragment_size(None), 512);
        assert_eq!(Config::default().effective_fragment_size(None), 1024);
    }
}
