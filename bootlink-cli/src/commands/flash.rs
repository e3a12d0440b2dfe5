//! Flash, enter-boot, verify, and run command implementations.

use anyhow::{bail, Context, Result};
use bootlink::{CommandResult, UpdateSession};
use console::style;
use std::path::Path;

/// Full update pipeline: enter boot, upload all fragments, verify, run.
pub(crate) fn cmd_flash(
    session: &UpdateSession,
    firmware: &Path,
    fragment_size: usize,
    load_addr: u32,
    skip_verify: bool,
    no_run: bool,
) -> Result<()> {
    session
        .load_firmware(firmware, fragment_size, load_addr)
        .with_context(|| format!("cannot load firmware from {}", firmware.display()))?;

    expect_success(session.enter_boot()?, "boot-mode entry")?;
    expect_success(session.upload_all()?, "fragment upload")?;
    if skip_verify {
        eprintln!("{} verification skipped", style("!").yellow());
    } else {
        expect_success(session.verify()?, "image verification")?;
    }
    if !no_run {
        expect_success(session.run_app()?, "application start")?;
    }

    eprintln!("{} update complete", style("ok").green());
    Ok(())
}

/// Negotiate boot-mode entry; the device information arrives as a log event.
pub(crate) fn cmd_enter_boot(session: &UpdateSession) -> Result<()> {
    expect_success(session.enter_boot()?, "boot-mode entry")?;
    eprintln!("{} target is in boot mode", style("ok").green());
    Ok(())
}

/// Ask the bootloader to verify the image it holds against `firmware`.
pub(crate) fn cmd_verify(
    session: &UpdateSession,
    firmware: &Path,
    fragment_size: usize,
    load_addr: u32,
) -> Result<()> {
    session
        .load_firmware(firmware, fragment_size, load_addr)
        .with_context(|| format!("cannot load firmware from {}", firmware.display()))?;
    expect_success(session.verify()?, "image verification")?;
    eprintln!("{} image verified", style("ok").green());
    Ok(())
}

/// Command the jump into the application.
pub(crate) fn cmd_run_app(session: &UpdateSession) -> Result<()> {
    expect_success(session.run_app()?, "application start")?;
    eprintln!("{} application started", style("ok").green());
    Ok(())
}

/// Turn a failed [`CommandResult`] into a CLI error.
fn expect_success(result: CommandResult, stage: &str) -> Result<()> {
    if result.success {
        Ok(())
    } else {
        bail!("{stage} failed: {}", result.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bootlink::CommandResult;

    fn result(success: bool, error: &str) -> CommandResult {
        CommandResult {
            success,
            error: error.into(),
            responses: Vec::new(),
            executed: 0,
            total: 0,
        }
    }

    #[test]
    fn test_expect_success_passes_through() {
        assert!(expect_success(result(true, ""), "stage").is_ok());
    }

    #[test]
    fn test_expect_success_reports_stage_and_error() {
        let err = expect_success(result(false, "communication lost"), "fragment upload")
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("fragment upload"));
        assert!(message.contains("communication lost"));
    }
}
