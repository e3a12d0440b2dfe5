//! Event channel for UI decoupling.
//!
//! The library never talks to an operator surface directly. Every publisher
//! (transport, scheduler, session) is handed an [`EventSink`] at construction
//! and emits tagged [`UpdaterEvent`] variants through it. A CLI renders them,
//! a GUI subscribes to them, tests record them.

use std::fmt;

use crate::image::firmware::FirmwareSummary;

/// Coarse-grained lifecycle of an update session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootStatus {
    /// No transport open.
    Disconnected,
    /// Transport open, target state unknown.
    Connected,
    /// Target acknowledged boot-mode entry.
    InBootMode,
    /// Command run in flight (enter-boot, upload, run-app).
    Transfer,
    /// Image verification in flight.
    Verifying,
    /// Last run finished successfully.
    Completed,
    /// Last run failed.
    Error,
}

impl fmt::Display for BootStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootStatus::Disconnected => write!(f, "Disconnected"),
            BootStatus::Connected => write!(f, "Connected"),
            BootStatus::InBootMode => write!(f, "In Boot Mode"),
            BootStatus::Transfer => write!(f, "Transfer"),
            BootStatus::Verifying => write!(f, "Verifying"),
            BootStatus::Completed => write!(f, "Completed"),
            BootStatus::Error => write!(f, "Error"),
        }
    }
}

/// Events emitted by the update session and its subsystems.
#[derive(Debug, Clone)]
pub enum UpdaterEvent {
    /// Operator-facing log line.
    Log(String),
    /// Operator-facing error line.
    Error(String),
    /// Session status changed.
    Status(BootStatus),
    /// Progress update for the current command run.
    Progress {
        /// 1-based index of the command being dispatched.
        current: usize,
        /// Total commands in this run (grows when retries enqueue).
        total: usize,
        /// Descriptive label of the command.
        label: String,
        /// Completion percentage, 0..=100.
        percent: u8,
    },
    /// A firmware image was loaded and its integrity data computed.
    FirmwareLoaded(FirmwareSummary),
    /// Target returned an error response; carries the decoded text.
    DeviceError(String),
}

/// Sink for receiving updater events.
///
/// Implement this in the embedding application to observe the session.
pub trait EventSink: Send + Sync {
    /// Called for every event, on the thread that produced it.
    fn on_event(&self, event: &UpdaterEvent);
}

/// No-op sink that discards all events.
pub struct NullSink;

impl EventSink for NullSink {
    fn on_event(&self, _event: &UpdaterEvent) {}
}

/// Sink that forwards events to the `log` facade.
pub struct LogSink;

impl EventSink for LogSink {
    fn on_event(&self, event: &UpdaterEvent) {
        match event {
            UpdaterEvent::Log(message) => log::info!("{message}"),
            UpdaterEvent::Error(message) => log::error!("{message}"),
            UpdaterEvent::Status(status) => log::info!("status: {status}"),
            UpdaterEvent::Progress {
                current,
                total,
                label,
                percent,
            } => log::debug!("[{current}/{total}] {label} ({percent}%)"),
            UpdaterEvent::FirmwareLoaded(summary) => log::info!(
                "firmware loaded: {} ({} bytes, {} fragments)",
                summary.name,
                summary.size,
                summary.fragment_count
            ),
            UpdaterEvent::DeviceError(message) => log::error!("device error: {message}"),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Sink that records every event for later assertions.
    pub struct RecordingSink {
        events: Mutex<Vec<UpdaterEvent>>,
    }

    impl RecordingSink {
        pub fn new() -> Self {
            Self {
                events: Mutex::new(Vec::new()),
            }
        }

        pub fn events(&self) -> Vec<UpdaterEvent> {
            self.events.lock().unwrap().clone()
        }

        pub fn device_errors(&self) -> Vec<String> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    UpdaterEvent::DeviceError(msg) => Some(msg),
                    _ => None,
                })
                .collect()
        }
    }

    impl EventSink for RecordingSink {
        fn on_event(&self, event: &UpdaterEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }
}
