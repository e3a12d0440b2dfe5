//! Event rendering for the terminal.

use bootlink::{EventSink, UpdaterEvent};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};

/// Renders session events: a progress bar for fragment uploads, styled
/// stderr lines for everything else.
pub(crate) struct CliSink {
    quiet: bool,
    fancy: bool,
    bar: ProgressBar,
}

impl CliSink {
    pub(crate) fn new(quiet: bool) -> Self {
        let fancy = !quiet && console::user_attended_stderr();
        let bar = if fancy {
            let bar = ProgressBar::new(100);
            #[allow(clippy::unwrap_used)] // Static template string
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}% {msg}")
                    .unwrap()
                    .progress_chars("#>-"),
            );
            bar.set_draw_target(indicatif::ProgressDrawTarget::stderr());
            bar
        } else {
            ProgressBar::hidden()
        };
        Self { quiet, fancy, bar }
    }

    /// Print a line without tearing the progress bar.
    fn line(&self, text: String) {
        if self.fancy {
            self.bar.println(text);
        } else {
            eprintln!("{text}");
        }
    }
}

impl EventSink for CliSink {
    fn on_event(&self, event: &UpdaterEvent) {
        match event {
            UpdaterEvent::Progress {
                label, percent, ..
            } => {
                self.bar.set_position(u64::from(*percent));
                self.bar.set_message(label.clone());
            }
            UpdaterEvent::Log(message) => {
                if !self.quiet {
                    self.line(format!("{} {message}", style("i").blue()));
                }
            }
            UpdaterEvent::Error(message) => {
                self.line(format!("{} {message}", style("x").red()));
            }
            UpdaterEvent::DeviceError(message) => {
                self.line(format!("{} device: {message}", style("x").red()));
            }
            UpdaterEvent::Status(status) => {
                if !self.quiet {
                    self.line(format!("{} {status}", style("*").dim()));
                }
            }
            UpdaterEvent::FirmwareLoaded(summary) => {
                if !self.quiet {
                    self.line(format!(
                        "{} {} ({} bytes, {} fragments, md5 {})",
                        style("+").green(),
                        summary.name,
                        summary.size,
                        summary.fragment_count,
                        summary.digest
                    ));
                }
            }
        }
    }
}
