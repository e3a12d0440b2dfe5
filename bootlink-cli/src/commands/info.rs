//! Firmware inspection and port listing command implementations.

use anyhow::{Context, Result};
use bootlink::{discover_ports, FirmwareImage};
use console::style;
use std::path::Path;

/// How many fragment CRCs to print before eliding the rest.
const FRAGMENT_PREVIEW: u32 = 8;

/// Info command implementation.
pub(crate) fn cmd_info(firmware: &Path, fragment_size: usize) -> Result<()> {
    let image = FirmwareImage::load(firmware, fragment_size, 0)
        .with_context(|| format!("cannot load firmware from {}", firmware.display()))?;

    eprintln!("{}", style("Firmware image").bold().underlined());
    eprintln!("  name:       {}", image.name());
    eprintln!("  size:       {} bytes", image.data().len());
    eprintln!("  md5:        {}", image.digest());
    eprintln!("  crc32:      {:#010X}", image.crc32());
    eprintln!(
        "  fragments:  {} x {} bytes",
        image.fragment_count(),
        image.fragment_size()
    );

    eprintln!("\n{}", style("Fragment CRCs").bold().underlined());
    let count = image.fragment_count();
    for index in 0..count.min(FRAGMENT_PREVIEW) {
        // In range by construction.
        if let Some(crc) = image.fragment_crc(index) {
            eprintln!("  [{index:4}] {crc:#010X}");
        }
    }
    if count > FRAGMENT_PREVIEW {
        eprintln!("  ... {} more", count - FRAGMENT_PREVIEW);
    }

    Ok(())
}

/// List ports command implementation.
pub(crate) fn cmd_list_ports() -> Result<()> {
    let ports = discover_ports().context("cannot enumerate serial ports")?;

    eprintln!("{}", style("Available serial ports").bold().underlined());
    if ports.is_empty() {
        eprintln!("  {}", style("none found").dim());
        return Ok(());
    }

    for port in &ports {
        let vid_pid = match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => format!(" ({vid:04X}:{pid:04X})"),
            _ => String::new(),
        };
        let product = port
            .product
            .as_deref()
            .map(|p| format!(" - {}", style(p).dim()))
            .unwrap_or_default();
        eprintln!(
            "  {} {}{vid_pid}{product}",
            style("*").green(),
            style(&port.name).cyan()
        );
    }

    Ok(())
}
