//! bootlink CLI - command-line firmware updater for serial bootloaders.
//!
//! ## Features
//!
//! - One-shot flash pipeline: enter boot, upload, verify, run
//! - Individual workflow steps for scripted use
//! - Firmware image inspection
//! - Serial port listing
//! - Shell completion generation
//! - Environment variable support

use anyhow::{bail, Context, Result};
use bootlink::{NativePort, SerialConfig, TransferConfig, UpdateSession};
use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use env_logger::Env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

mod commands;
mod config;

use commands::sink::CliSink;
use config::Config;

/// bootlink - drive an embedded resident bootloader over a serial link.
///
/// Environment variables:
///   BOOTLINK_PORT        - Default serial port
///   BOOTLINK_BAUD        - Default baud rate (default: 115200)
///   BOOTLINK_TIMEOUT_MS  - Per-command reply timeout in milliseconds
///   BOOTLINK_RETRIES     - Transport send attempts per command
#[derive(Parser)]
#[command(name = "bootlink")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Serial port to use (first available if not specified).
    #[arg(short, long, global = true, env = "BOOTLINK_PORT")]
    port: Option<String>,

    /// Baud rate (default: 115200, or the configured value).
    #[arg(short, long, global = true, env = "BOOTLINK_BAUD")]
    baud: Option<u32>,

    /// Per-command reply timeout in milliseconds.
    #[arg(long, global = true, default_value = "3000", env = "BOOTLINK_TIMEOUT_MS")]
    timeout_ms: u64,

    /// Transport send attempts per command, including the first.
    #[arg(long, global = true, default_value = "3", env = "BOOTLINK_RETRIES")]
    retries: u32,

    /// Byte suffix appended to every outbound frame.
    #[arg(long, global = true, value_enum, default_value = "none")]
    line_ending: LineEnding,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Line-ending suffix for transports that require one.
#[derive(Clone, Copy, Debug, ValueEnum)]
enum LineEnding {
    /// No suffix.
    None,
    /// A single `\n`.
    Lf,
    /// `\r\n`.
    Crlf,
}

impl LineEnding {
    fn bytes(self) -> Vec<u8> {
        match self {
            Self::None => Vec::new(),
            Self::Lf => b"\n".to_vec(),
            Self::Crlf => b"\r\n".to_vec(),
        }
    }
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Run the full update pipeline: enter boot, upload, verify, run.
    Flash {
        /// Firmware image file.
        firmware: PathBuf,

        /// Fragment size in bytes (default: 1024, or the configured value).
        #[arg(long, env = "BOOTLINK_FRAGMENT_SIZE")]
        fragment_size: Option<usize>,

        /// Target load address (decimal or 0x-prefixed hex).
        #[arg(long, default_value = "0x08000000", value_parser = parse_u32_maybe_hex)]
        load_addr: u32,

        /// Skip the verify stage.
        #[arg(long)]
        skip_verify: bool,

        /// Leave the target in boot mode instead of running the application.
        #[arg(long)]
        no_run: bool,
    },

    /// Negotiate boot-mode entry and print the device information.
    EnterBoot,

    /// Command the target to jump to the application.
    Run,

    /// Ask the bootloader to verify a previously uploaded image.
    Verify {
        /// Firmware image file the target should hold.
        firmware: PathBuf,

        /// Fragment size used during upload.
        #[arg(long, env = "BOOTLINK_FRAGMENT_SIZE")]
        fragment_size: Option<usize>,

        /// Target load address (decimal or 0x-prefixed hex).
        #[arg(long, default_value = "0x08000000", value_parser = parse_u32_maybe_hex)]
        load_addr: u32,
    },

    /// Inspect a firmware image without touching any hardware.
    Info {
        /// Firmware image file.
        firmware: PathBuf,

        /// Fragment size used to build the CRC map.
        #[arg(long, env = "BOOTLINK_FRAGMENT_SIZE")]
        fragment_size: Option<usize>,
    },

    /// List available serial ports.
    ListPorts,

    /// Generate shell completions to stdout.
    Completions {
        /// Target shell.
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn parse_u32_maybe_hex(s: &str) -> std::result::Result<u32, String> {
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        s.parse()
    };
    parsed.map_err(|e| format!("invalid address '{s}': {e}"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(default_level)).init();

    let config = Config::load();

    match &cli.command {
        Commands::Flash {
            firmware,
            fragment_size,
            load_addr,
            skip_verify,
            no_run,
        } => {
            let session = open_session(&cli, &config)?;
            commands::flash::cmd_flash(
                &session,
                firmware,
                config.effective_fragment_size(*fragment_size),
                *load_addr,
                *skip_verify || config.flash.skip_verify,
                *no_run,
            )
        }
        Commands::EnterBoot => {
            let session = open_session(&cli, &config)?;
            commands::flash::cmd_enter_boot(&session)
        }
        Commands::Run => {
            let session = open_session(&cli, &config)?;
            commands::flash::cmd_run_app(&session)
        }
        Commands::Verify {
            firmware,
            fragment_size,
            load_addr,
        } => {
            let session = open_session(&cli, &config)?;
            commands::flash::cmd_verify(
                &session,
                firmware,
                config.effective_fragment_size(*fragment_size),
                *load_addr,
            )
        }
        Commands::Info {
            firmware,
            fragment_size,
        } => commands::info::cmd_info(firmware, config.effective_fragment_size(*fragment_size)),
        Commands::ListPorts => commands::info::cmd_list_ports(),
        Commands::Completions { shell } => {
            commands::completions::cmd_completions::<Cli>(*shell);
            Ok(())
        }
    }
}

/// Resolve the serial port and open an update session over it.
fn open_session(cli: &Cli, config: &Config) -> Result<UpdateSession> {
    let port_name = match cli.port.clone().or_else(|| config.connection.port.clone()) {
        Some(name) => name,
        None => {
            let ports = bootlink::discover_ports().context("cannot enumerate serial ports")?;
            match ports.first() {
                Some(info) => info.name.clone(),
                None => bail!("no serial ports available; pass one with --port"),
            }
        }
    };
    let baud = cli.baud.or(config.connection.baud).unwrap_or(115_200);

    if !cli.quiet {
        eprintln!("Using port {port_name} at {baud} baud");
    }

    let serial = SerialConfig::new(&port_name, baud);
    let port = NativePort::open(&serial)
        .with_context(|| format!("cannot open serial port {port_name}"))?;

    let transfer = TransferConfig::default()
        .with_timeout(Duration::from_millis(cli.timeout_ms))
        .with_retry_count(cli.retries)
        .with_line_ending(cli.line_ending.bytes());

    let sink = Arc::new(CliSink::new(cli.quiet));
    UpdateSession::open(Box::new(port), transfer, sink).context("cannot open update session")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_u32_maybe_hex() {
        assert_eq!(parse_u32_maybe_hex("1024").unwrap(), 1024);
        assert_eq!(parse_u32_maybe_hex("0x08000000").unwrap(), 0x0800_0000);
        assert_eq!(parse_u32_maybe_hex("0XFF").unwrap(), 255);
        assert!(parse_u32_maybe_hex("notanumber").is_err());
        assert!(parse_u32_maybe_hex("0xZZ").is_err());
    }

    #[test]
    fn test_cli_parses() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_line_ending_bytes() {
        assert!(LineEnding::None.bytes().is_empty());
        assert_eq!(LineEnding::Lf.bytes(), b"\n");
        assert_eq!(LineEnding::Crlf.bytes(), b"\r\n");
    }
}
