//! High-level update session.
//!
//! Composes the firmware store, transport, and scheduler into the workflows
//! an operator actually runs: enter boot mode, upload every fragment, verify
//! the delivered image, jump to the application. Tracks a coarse
//! [`BootStatus`] around each run and fans all observable activity out
//! through the event sink.

use byteorder::{LittleEndian, WriteBytesExt};
use log::{debug, info};
use std::sync::{Arc, Mutex, RwLock};

use crate::error::{Error, Result};
use crate::event::{BootStatus, EventSink, UpdaterEvent};
use crate::image::firmware::{FirmwareImage, FirmwareSummary};
use crate::port::Port;
use crate::protocol::frame::{CommandKind, Frame};
use crate::scheduler::{CommandItem, CommandResult, ResponseAction, Scheduler};
use crate::transport::{TransferConfig, Transport};

/// Response policy for enter-boot commands: accept the device-info reply,
/// stop on anything else.
pub fn enter_boot_policy(frame: &Frame) -> ResponseAction {
    match frame.kind() {
        CommandKind::EnterBoot => ResponseAction::Continue,
        CommandKind::Nack | CommandKind::ErrorResponse => ResponseAction::Stop,
        _ => ResponseAction::Stop,
    }
}

/// Response policy for fragment uploads: a device error earns the fragment a
/// schedule-level retry.
pub fn upload_policy(frame: &Frame) -> ResponseAction {
    match frame.kind() {
        CommandKind::Ack => ResponseAction::Continue,
        CommandKind::ErrorResponse => ResponseAction::Retry,
        _ => ResponseAction::Stop,
    }
}

/// Response policy for run-app commands.
pub fn run_app_policy(frame: &Frame) -> ResponseAction {
    match frame.kind() {
        CommandKind::Ack => ResponseAction::Continue,
        CommandKind::ErrorResponse => ResponseAction::Stop,
        _ => ResponseAction::Stop,
    }
}

/// Response policy for verify commands.
pub fn verify_policy(frame: &Frame) -> ResponseAction {
    match frame.kind() {
        CommandKind::Ack => ResponseAction::Continue,
        _ => ResponseAction::Stop,
    }
}

/// One firmware update session over one transport.
///
/// Owns the transport, the scheduler, and at most one loaded firmware image.
pub struct UpdateSession {
    transport: Arc<Transport>,
    scheduler: Scheduler,
    firmware: RwLock<Option<FirmwareImage>>,
    status: Mutex<BootStatus>,
    events: Arc<dyn EventSink>,
}

impl UpdateSession {
    /// Open a session over `port`. Status becomes [`BootStatus::Connected`].
    pub fn open(
        port: Box<dyn Port>,
        config: TransferConfig,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let transport = Arc::new(Transport::open(port, config, Arc::clone(&events))?);
        let scheduler = Scheduler::new(Arc::clone(&transport), Arc::clone(&events));
        let session = Self {
            transport,
            scheduler,
            firmware: RwLock::new(None),
            status: Mutex::new(BootStatus::Disconnected),
            events,
        };
        session.set_status(BootStatus::Connected);
        Ok(session)
    }

    /// Load a firmware image, replacing any previously loaded one.
    pub fn load_firmware<P: AsRef<std::path::Path>>(
        &self,
        path: P,
        fragment_size: usize,
        load_addr: u32,
    ) -> Result<FirmwareSummary> {
        let image = FirmwareImage::load(path, fragment_size, load_addr)?;
        let summary = image.summary();
        info!(
            "Loaded {} ({} bytes, {} fragments of {})",
            summary.name, summary.size, summary.fragment_count, summary.fragment_size
        );
        self.events
            .on_event(&UpdaterEvent::FirmwareLoaded(summary.clone()));
        *self.firmware.write().unwrap() = Some(image);
        Ok(summary)
    }

    /// Drop the loaded firmware image.
    pub fn clear_firmware(&self) {
        debug!("Clearing loaded firmware image");
        *self.firmware.write().unwrap() = None;
    }

    /// Descriptor of the loaded image, if any.
    pub fn firmware_summary(&self) -> Option<FirmwareSummary> {
        self.firmware.read().unwrap().as_ref().map(FirmwareImage::summary)
    }

    /// Current session status.
    pub fn status(&self) -> BootStatus {
        *self.status.lock().unwrap()
    }

    /// Request boot-mode entry. On success the target's device-info record
    /// has been received and status is [`BootStatus::InBootMode`].
    pub fn enter_boot(&self) -> Result<CommandResult> {
        self.scheduler.submit(
            CommandItem::new(
                CommandKind::EnterBoot,
                Vec::new(),
                CommandKind::EnterBoot,
                "enter boot mode",
            )
            .with_policy(enter_boot_policy),
        )?;
        self.run_queue(BootStatus::Transfer, BootStatus::InBootMode)
    }

    /// Upload every fragment of the loaded image.
    ///
    /// Each fragment is a single transport attempt with a schedule-level
    /// retry budget of 3; a fragment the device rejects goes to the back of
    /// the queue and is resent.
    pub fn upload_all(&self) -> Result<CommandResult> {
        let items = {
            let guard = self.firmware.read().unwrap();
            let image = guard.as_ref().ok_or(Error::NoFirmware)?;
            let total = image.fragment_count();
            let mut items = Vec::with_capacity(total as usize);
            for index in 0..total {
                items.push(
                    CommandItem::new(
                        CommandKind::Upload,
                        image.build_fragment(index)?,
                        CommandKind::Ack,
                        format!("upload fragment {}/{total}", index + 1),
                    )
                    .with_transport_retries(0)
                    .with_schedule_retries(3)
                    .with_policy(upload_policy),
                );
            }
            items
        };
        info!("Uploading {} fragments", items.len());
        self.scheduler.submit_all(items)?;
        self.run_queue(BootStatus::Transfer, BootStatus::Completed)
    }

    /// Verify the delivered image: re-validate the local copy, then ask the
    /// bootloader to check fragment count and whole-image CRC.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn verify(&self) -> Result<CommandResult> {
        let payload = {
            let guard = self.firmware.read().unwrap();
            let image = guard.as_ref().ok_or(Error::NoFirmware)?;
            image.validate()?;
            let mut payload = Vec::with_capacity(8);
            payload.write_u32::<LittleEndian>(image.fragment_count()).unwrap();
            payload.write_u32::<LittleEndian>(image.crc32()).unwrap();
            payload
        };
        self.scheduler.submit(
            CommandItem::new(CommandKind::Verify, payload, CommandKind::Ack, "verify image")
                .with_policy(verify_policy),
        )?;
        self.run_queue(BootStatus::Verifying, BootStatus::Completed)
    }

    /// Command the target to jump to the new application.
    pub fn run_app(&self) -> Result<CommandResult> {
        self.scheduler.submit(
            CommandItem::new(CommandKind::RunApp, Vec::new(), CommandKind::Ack, "run application")
                .with_policy(run_app_policy),
        )?;
        self.run_queue(BootStatus::Transfer, BootStatus::Completed)
    }

    /// Full update pipeline: enter boot, upload all fragments, verify, run.
    /// Stops at the first failed stage and returns its result.
    pub fn flash(&self) -> Result<CommandResult> {
        let result = self.enter_boot()?;
        if !result.success {
            return Ok(result);
        }
        let result = self.upload_all()?;
        if !result.success {
            return Ok(result);
        }
        let result = self.verify()?;
        if !result.success {
            return Ok(result);
        }
        self.run_app()
    }

    /// Cooperatively stop the current run. The in-flight command is allowed
    /// to complete or time out.
    pub fn stop(&self) {
        self.scheduler.stop();
    }

    fn run_queue(&self, active: BootStatus, on_success: BootStatus) -> Result<CommandResult> {
        self.set_status(active);
        let result = self.scheduler.run()?;
        if result.success {
            self.set_status(on_success);
        } else {
            self.set_status(BootStatus::Error);
            self.events
                .on_event(&UpdaterEvent::Error(result.error.clone()));
        }
        Ok(result)
    }

    /// Transition to `status`, dropping same-state writes.
    fn set_status(&self, status: BootStatus) {
        let mut current = self.status.lock().unwrap();
        if *current == status {
            return;
        }
        debug!("Status: {} -> {status}", *current);
        *current = status;
        self.events.on_event(&UpdaterEvent::Status(status));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::test_support::RecordingSink;
    use crate::port::mock::{MockHandle, MockPort};
    use crate::protocol::frame::DeviceInfo;
    use std::fs;
    use std::io::Write as _;
    use std::path::PathBuf;
    use std::time::Duration;

    fn fixture() -> (UpdateSession, MockHandle, Arc<RecordingSink>) {
        let (port, handle) = MockPort::pair();
        let config = TransferConfig::default()
            .with_timeout(Duration::from_millis(200))
            .with_retry_count(1);
        let sink = Arc::new(RecordingSink::new());
        let session = UpdateSession::open(Box::new(port), config, sink.clone()).unwrap();
        (session, handle, sink)
    }

    fn temp_image(bytes: &[u8]) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.bin");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(bytes).unwrap();
        (dir, path)
    }

    fn ack() -> Vec<u8> {
        Frame::empty(CommandKind::Ack).encode()
    }

    fn device_info_reply() -> Vec<u8> {
        let info = DeviceInfo {
            model: "DEV-X".into(),
            flash_size: 128 * 1024,
            app_addr: 0x0800_0000,
            fragment_size: 1024,
            boot_version: "v1.2.3".into(),
        };
        Frame::new(CommandKind::EnterBoot, info.encode().unwrap())
            .unwrap()
            .encode()
    }

    fn statuses(sink: &RecordingSink) -> Vec<BootStatus> {
        sink.events()
            .into_iter()
            .filter_map(|e| match e {
                UpdaterEvent::Status(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_enter_boot_round_trip() {
        let (session, handle, sink) = fixture();
        handle.reply_with(&device_info_reply());

        let result = session.enter_boot().unwrap();
        assert!(result.success, "error: {}", result.error);
        assert_eq!(result.responses.len(), 1);
        assert_eq!(result.responses[0].kind(), CommandKind::EnterBoot);
        assert_eq!(session.status(), BootStatus::InBootMode);

        let device_line = sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                UpdaterEvent::Log(line) => Some(line),
                _ => None,
            })
            .find(|l| l.contains("DEV-X"))
            .expect("device info log line");
        assert!(device_line.contains("0x08000000"));
        assert!(device_line.contains("1024"));
    }

    #[test]
    fn test_enter_boot_device_error_fails() {
        let (session, handle, _sink) = fixture();
        handle.reply_with(
            &Frame::new(CommandKind::ErrorResponse, b"not now".to_vec())
                .unwrap()
                .encode(),
        );

        let result = session.enter_boot().unwrap();
        assert!(!result.success);
        assert_eq!(result.error, "not now");
        assert_eq!(session.status(), BootStatus::Error);
    }

    #[test]
    fn test_upload_all_without_image_fails() {
        let (session, _handle, _sink) = fixture();
        assert!(matches!(session.upload_all(), Err(Error::NoFirmware)));
    }

    #[test]
    fn test_upload_all_sends_every_fragment() {
        let (session, handle, _sink) = fixture();
        let bytes: Vec<u8> = (0u8..=249).collect();
        let (_dir, path) = temp_image(&bytes);
        session.load_firmware(&path, 100, 0x0800_0000).unwrap();

        for _ in 0..3 {
            handle.reply_with(&ack());
        }
        let result = session.upload_all().unwrap();
        assert!(result.success, "error: {}", result.error);
        assert_eq!(result.executed, 3);
        assert_eq!(session.status(), BootStatus::Completed);

        // Every write is a complete upload frame carrying index and total.
        let writes = handle.writes();
        assert_eq!(writes.len(), 3);
        for (i, bytes) in writes.iter().enumerate() {
            let frame = Frame::decode(bytes).unwrap();
            assert_eq!(frame.kind(), CommandKind::Upload);
            assert_eq!(frame.payload()[0] as usize, i);
            assert_eq!(frame.payload()[4], 3);
        }
    }

    #[test]
    fn test_upload_retry_recovers_from_device_error() {
        let (session, handle, sink) = fixture();
        let (_dir, path) = temp_image(&[0x5Au8; 30]);
        session.load_firmware(&path, 10, 0).unwrap();

        handle.reply_with(&ack());
        handle.reply_with(
            &Frame::new(CommandKind::ErrorResponse, b"bad crc".to_vec())
                .unwrap()
                .encode(),
        );
        handle.reply_with(&ack());
        handle.reply_with(&ack());

        let result = session.upload_all().unwrap();
        assert!(result.success, "error: {}", result.error);
        assert_eq!(result.total, 4);
        assert_eq!(result.executed, 4);
        assert_eq!(sink.device_errors().len(), 1);
        assert_eq!(session.status(), BootStatus::Completed);
    }

    #[test]
    fn test_verify_round_trip() {
        let (session, handle, _sink) = fixture();
        let (_dir, path) = temp_image(b"firmware!");
        session.load_firmware(&path, 4, 0).unwrap();
        handle.reply_with(&ack());

        let result = session.verify().unwrap();
        assert!(result.success);
        assert_eq!(session.status(), BootStatus::Completed);

        // Payload carries fragment count and whole-image CRC.
        let writes = handle.writes();
        let frame = Frame::decode(&writes[0]).unwrap();
        assert_eq!(frame.kind(), CommandKind::Verify);
        assert_eq!(frame.payload().len(), 8);
        assert_eq!(frame.payload()[0], 3); // ceil(9 / 4)
    }

    #[test]
    fn test_run_app_ack_completes() {
        let (session, handle, _sink) = fixture();
        handle.reply_with(&ack());

        let result = session.run_app().unwrap();
        assert!(result.success);
        assert_eq!(session.status(), BootStatus::Completed);
    }

    #[test]
    fn test_timeout_reports_communication_loss() {
        let (session, _handle, sink) = fixture();
        // Silent device.
        let started = std::time::Instant::now();
        let result = session.enter_boot().unwrap();
        assert!(!result.success);
        assert!(result.error.contains("communication lost"));
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(session.status(), BootStatus::Error);

        let errors: Vec<String> = sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                UpdaterEvent::Error(line) => Some(line),
                _ => None,
            })
            .collect();
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn test_flash_pipeline_runs_all_stages() {
        let (session, handle, _sink) = fixture();
        let (_dir, path) = temp_image(&[0x11u8; 20]);
        session.load_firmware(&path, 10, 0).unwrap();

        handle.reply_with(&device_info_reply()); // enter boot
        handle.reply_with(&ack()); // fragment 1
        handle.reply_with(&ack()); // fragment 2
        handle.reply_with(&ack()); // verify
        handle.reply_with(&ack()); // run app

        let result = session.flash().unwrap();
        assert!(result.success, "error: {}", result.error);
        assert_eq!(handle.writes().len(), 5);
        assert_eq!(session.status(), BootStatus::Completed);
    }

    #[test]
    fn test_flash_stops_at_first_failed_stage() {
        let (session, handle, _sink) = fixture();
        let (_dir, path) = temp_image(&[0x11u8; 20]);
        session.load_firmware(&path, 10, 0).unwrap();

        handle.reply_with(
            &Frame::new(CommandKind::ErrorResponse, b"locked".to_vec())
                .unwrap()
                .encode(),
        );

        let result = session.flash().unwrap();
        assert!(!result.success);
        // Only the enter-boot frame went out.
        assert_eq!(handle.writes().len(), 1);
        assert_eq!(session.status(), BootStatus::Error);
    }

    #[test]
    fn test_status_transitions_are_deduplicated() {
        let (session, handle, sink) = fixture();
        handle.reply_with(&ack());
        session.run_app().unwrap();

        let seen = statuses(&sink);
        assert_eq!(
            seen,
            vec![
                BootStatus::Connected,
                BootStatus::Transfer,
                BootStatus::Completed
            ]
        );

        // A second identical terminal state is dropped.
        handle.reply_with(&ack());
        session.run_app().unwrap();
        let seen = statuses(&sink);
        assert_eq!(
            seen,
            vec![
                BootStatus::Connected,
                BootStatus::Transfer,
                BootStatus::Completed,
                BootStatus::Transfer,
                BootStatus::Completed
            ]
        );
    }

    #[test]
    fn test_firmware_loaded_event_and_summary() {
        let (session, _handle, sink) = fixture();
        let (_dir, path) = temp_image(&[1u8, 2, 3, 4, 5]);
        assert!(session.firmware_summary().is_none());

        session.load_firmware(&path, 2, 0x0800_4000).unwrap();
        let summary = session.firmware_summary().expect("summary");
        assert_eq!(summary.size, 5);
        assert_eq!(summary.fragment_count, 3);

        let loaded = sink.events().into_iter().any(|e| {
            matches!(e, UpdaterEvent::FirmwareLoaded(s) if s.load_addr == 0x0800_4000)
        });
        assert!(loaded);

        session.clear_firmware();
        assert!(session.firmware_summary().is_none());
    }
}
