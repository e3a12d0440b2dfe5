//! Frame transport over a byte stream.
//!
//! Owns the port exclusively: a background reader thread drains inbound
//! bytes, reassembles frames, and publishes each decoded frame to a
//! single-slot mailbox holding the most recent unread frame. The outbound
//! side serves one [`Transport::send_and_await`] call at a time, polling the
//! mailbox for the expected reply and resending on timeout.

use log::{debug, trace, warn};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::event::{EventSink, UpdaterEvent};
use crate::port::Port;
use crate::protocol::frame::{CommandKind, Frame, FRAME_HEADER, FRAME_OVERHEAD};

/// Mailbox poll granularity while awaiting a reply.
const MAILBOX_POLL: Duration = Duration::from_millis(5);

/// Pause between send attempts after a timeout.
const RETRY_PAUSE: Duration = Duration::from_millis(100);

/// Reader pause per drain cycle, amortizing bursty deliveries.
const READER_PAUSE: Duration = Duration::from_millis(5);

/// Read timeout on the reader's port handle.
const READER_TIMEOUT: Duration = Duration::from_millis(10);

/// Transfer tuning for one command exchange.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// How long to wait for an expected or error reply.
    pub timeout: Duration,
    /// Send attempts including the first. Clamped to at least one.
    pub retry_count: u32,
    /// Raw bytes appended after every outbound frame (may be empty).
    pub line_ending: Vec<u8>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(3000),
            retry_count: 3,
            line_ending: Vec::new(),
        }
    }
}

impl TransferConfig {
    /// Set the reply timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the number of send attempts (including the first).
    #[must_use]
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Set the byte suffix appended to every outbound frame.
    #[must_use]
    pub fn with_line_ending(mut self, line_ending: Vec<u8>) -> Self {
        self.line_ending = line_ending;
        self
    }
}

/// Reassembles frames from an arbitrary byte stream.
///
/// Tolerates noise before synchronization: bytes preceding a frame header
/// are discarded, and an undecodable frame candidate resyncs one byte past
/// its header.
struct FrameAssembler {
    buf: Vec<u8>,
}

impl FrameAssembler {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Feed received bytes, returning every frame completed by them.
    fn push(&mut self, bytes: &[u8]) -> Vec<Frame> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();
        loop {
            let Some(start) = find_header(&self.buf) else {
                // No header in sight. Keep a trailing 0xAA in case its 0x55
                // arrives in the next read; drop the rest as noise.
                let keep = usize::from(self.buf.last() == Some(&FRAME_HEADER[0]));
                if self.buf.len() > keep {
                    trace!("Discarding {} noise bytes", self.buf.len() - keep);
                }
                self.buf.drain(..self.buf.len() - keep);
                break;
            };
            if start > 0 {
                trace!("Discarding {start} noise bytes before frame header");
                self.buf.drain(..start);
            }
            if self.buf.len() < 5 {
                break;
            }
            let declared = LittleEndian::read_u16(&self.buf[3..5]) as usize;
            let total = FRAME_OVERHEAD + declared;
            if self.buf.len() < total {
                break;
            }
            match Frame::decode(&self.buf[..total]) {
                Ok(frame) => {
                    self.buf.drain(..total);
                    frames.push(frame);
                }
                Err(e) => {
                    // Target noise that happened to look like a header.
                    debug!("Dropping undecodable frame candidate: {e}");
                    self.buf.drain(..1);
                }
            }
        }
        frames
    }
}

fn find_header(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == FRAME_HEADER)
}

/// Frame transport with a background reader.
pub struct Transport {
    writer: Mutex<Box<dyn Port>>,
    mailbox: Arc<Mutex<Option<Frame>>>,
    config: TransferConfig,
    events: Arc<dyn EventSink>,
    last_device_error: Mutex<Option<String>>,
    // Serializes send_and_await: one outstanding exchange at a time.
    op_lock: Mutex<()>,
    shutdown: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl Transport {
    /// Take ownership of a port and start the background reader.
    pub fn open(
        port: Box<dyn Port>,
        config: TransferConfig,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let mut reader_port = port.try_clone_reader()?;
        reader_port.set_timeout(READER_TIMEOUT)?;

        let mailbox: Arc<Mutex<Option<Frame>>> = Arc::new(Mutex::new(None));
        let shutdown = Arc::new(AtomicBool::new(false));

        let reader = {
            let mailbox = Arc::clone(&mailbox);
            let shutdown = Arc::clone(&shutdown);
            thread::Builder::new()
                .name("bootlink-reader".into())
                .spawn(move || reader_loop(reader_port, &mailbox, &shutdown))
                .map_err(Error::Io)?
        };

        Ok(Self {
            writer: Mutex::new(port),
            mailbox,
            config,
            events,
            last_device_error: Mutex::new(None),
            op_lock: Mutex::new(()),
            shutdown,
            reader: Some(reader),
        })
    }

    /// The transport's default transfer configuration.
    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Send a frame and wait for a reply of `expected` kind using the
    /// default configuration.
    pub fn send_and_await(&self, frame: &Frame, expected: CommandKind) -> Result<Frame> {
        let config = self.config.clone();
        self.send_and_await_with(frame, expected, &config)
    }

    /// Send a frame and wait for a reply of `expected` kind.
    ///
    /// Returns the first received frame whose kind equals `expected` or
    /// [`CommandKind::ErrorResponse`]; frames of any other kind are logged
    /// and skipped. On timeout the frame is resent, up to
    /// `config.retry_count` attempts total with a 100 ms pause between them.
    /// A write failure fails the call immediately; only timeouts consume the
    /// retry budget. Per-call configuration is a value: the transport's own
    /// defaults are never mutated.
    pub fn send_and_await_with(
        &self,
        frame: &Frame,
        expected: CommandKind,
        config: &TransferConfig,
    ) -> Result<Frame> {
        let _guard = self.op_lock.lock().unwrap();

        let mut bytes = frame.encode();
        bytes.extend_from_slice(&config.line_ending);

        let attempts = config.retry_count.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            if attempt > 1 {
                thread::sleep(RETRY_PAUSE);
            }
            self.mailbox.lock().unwrap().take();

            {
                let mut writer = self.writer.lock().unwrap();
                if let Err(e) = writer.write_all(&bytes).and_then(|()| writer.flush()) {
                    warn!("Write failed on attempt {attempt}/{attempts}: {e}");
                    return Err(write_error(e));
                }
            }
            trace!(
                "Sent {} ({} bytes), awaiting {expected}",
                frame.kind(),
                bytes.len()
            );

            let deadline = Instant::now() + config.timeout;
            loop {
                if let Some(received) = self.mailbox.lock().unwrap().take() {
                    if received.kind() == expected
                        || received.kind() == CommandKind::ErrorResponse
                    {
                        if received.kind() == CommandKind::ErrorResponse {
                            self.note_device_error(&received);
                        }
                        return Ok(received);
                    }
                    debug!(
                        "Ignoring {} frame while awaiting {expected}",
                        received.kind()
                    );
                    continue;
                }
                if Instant::now() >= deadline {
                    break;
                }
                thread::sleep(MAILBOX_POLL);
            }
            debug!(
                "Attempt {attempt}/{attempts}: no {expected} reply within {} ms",
                config.timeout.as_millis()
            );
            last_err = Some(Error::Timeout(format!(
                "no {expected} reply within {} ms after {attempts} attempts",
                config.timeout.as_millis()
            )));
        }

        Err(last_err.unwrap_or_else(|| Error::Timeout("no reply".into())))
    }

    /// The most recent device error text, if the target ever returned one.
    pub fn last_device_error(&self) -> Option<String> {
        self.last_device_error.lock().unwrap().clone()
    }

    fn note_device_error(&self, frame: &Frame) {
        let text = if frame.payload().is_empty() {
            "device reported an unspecified error".to_string()
        } else {
            match std::str::from_utf8(frame.payload()) {
                Ok(s) => s.to_string(),
                Err(_) => "device error payload is not valid UTF-8".to_string(),
            }
        };
        warn!("Device error: {text}");
        *self.last_device_error.lock().unwrap() = Some(text.clone());
        self.events.on_event(&UpdaterEvent::DeviceError(text));
    }

    /// Stop the reader and close the underlying port.
    pub fn close(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
        let _ = self.writer.lock().unwrap().close();
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}

fn write_error(e: std::io::Error) -> Error {
    match e.kind() {
        std::io::ErrorKind::NotConnected | std::io::ErrorKind::BrokenPipe => {
            Error::TransportClosed
        }
        _ => Error::Io(e),
    }
}

fn reader_loop(
    mut port: Box<dyn Port>,
    mailbox: &Mutex<Option<Frame>>,
    shutdown: &AtomicBool,
) {
    let mut assembler = FrameAssembler::new();
    let mut buf = [0u8; 256];
    while !shutdown.load(Ordering::Relaxed) {
        thread::sleep(READER_PAUSE);
        match port.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                for frame in assembler.push(&buf[..n]) {
                    trace!("Received {} frame ({} bytes payload)", frame.kind(), frame.payload().len());
                    // Overwrite any unread frame: the slot holds the most
                    // recent one only.
                    *mailbox.lock().unwrap() = Some(frame);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                debug!("Reader stopping: {e}");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::test_support::RecordingSink;
    use crate::event::NullSink;
    use crate::port::mock::MockPort;

    fn short_config() -> TransferConfig {
        TransferConfig::default()
            .with_timeout(Duration::from_millis(200))
            .with_retry_count(1)
    }

    fn open_transport(config: TransferConfig) -> (Transport, crate::port::mock::MockHandle) {
        let (port, handle) = MockPort::pair();
        let transport = Transport::open(Box::new(port), config, Arc::new(NullSink)).unwrap();
        (transport, handle)
    }

    #[test]
    fn test_assembler_single_frame() {
        let mut assembler = FrameAssembler::new();
        let frame = Frame::empty(CommandKind::Ack);
        let frames = assembler.push(&frame.encode());
        assert_eq!(frames, vec![frame]);
        assert!(assembler.buf.is_empty());
    }

    #[test]
    fn test_assembler_split_delivery() {
        let mut assembler = FrameAssembler::new();
        let frame = Frame::new(CommandKind::Upload, vec![1, 2, 3]).unwrap();
        let bytes = frame.encode();
        assert!(assembler.push(&bytes[..4]).is_empty());
        assert_eq!(assembler.push(&bytes[4..]), vec![frame]);
    }

    #[test]
    fn test_assembler_skips_leading_noise() {
        let mut assembler = FrameAssembler::new();
        let frame = Frame::empty(CommandKind::Ack);
        let mut bytes = vec![0x00, 0x13, 0x37];
        bytes.extend_from_slice(&frame.encode());
        assert_eq!(assembler.push(&bytes), vec![frame]);
    }

    #[test]
    fn test_assembler_resyncs_past_bad_checksum() {
        let mut assembler = FrameAssembler::new();
        let good = Frame::empty(CommandKind::Ack);
        // A corrupted frame candidate followed by a valid frame.
        let mut bytes = vec![0xAA, 0x55, 0x01, 0x00, 0x00, 0x00];
        bytes.extend_from_slice(&good.encode());
        assert_eq!(assembler.push(&bytes), vec![good]);
    }

    #[test]
    fn test_assembler_two_frames_one_read() {
        let mut assembler = FrameAssembler::new();
        let first = Frame::empty(CommandKind::Nack);
        let second = Frame::new(CommandKind::Ack, vec![7]).unwrap();
        let mut bytes = first.encode();
        bytes.extend_from_slice(&second.encode());
        assert_eq!(assembler.push(&bytes), vec![first, second]);
    }

    #[test]
    fn test_assembler_keeps_trailing_header_byte() {
        let mut assembler = FrameAssembler::new();
        let frame = Frame::empty(CommandKind::Ack);
        let bytes = frame.encode();
        // Noise, then the first header byte only.
        assert!(assembler.push(&[0x42, 0xAA]).is_empty());
        assert_eq!(assembler.push(&bytes[1..]), vec![frame]);
    }

    #[test]
    fn test_send_and_await_expected_reply() {
        let (transport, handle) = open_transport(short_config());
        handle.reply_with(&Frame::empty(CommandKind::Ack).encode());

        let reply = transport
            .send_and_await(&Frame::empty(CommandKind::RunApp), CommandKind::Ack)
            .unwrap();
        assert_eq!(reply.kind(), CommandKind::Ack);
        assert_eq!(handle.writes().len(), 1);
    }

    #[test]
    fn test_send_appends_line_ending() {
        let config = short_config().with_line_ending(b"\r\n".to_vec());
        let (transport, handle) = open_transport(config);
        handle.reply_with(&Frame::empty(CommandKind::Ack).encode());

        transport
            .send_and_await(&Frame::empty(CommandKind::RunApp), CommandKind::Ack)
            .unwrap();
        let writes = handle.writes();
        assert!(writes[0].ends_with(b"\r\n"));
        assert_eq!(&writes[0][..writes[0].len() - 2], &Frame::empty(CommandKind::RunApp).encode()[..]);
    }

    #[test]
    fn test_error_response_returned_and_event_emitted() {
        let (port, handle) = MockPort::pair();
        let sink = Arc::new(RecordingSink::new());
        let transport =
            Transport::open(Box::new(port), short_config(), sink.clone()).unwrap();
        handle.reply_with(
            &Frame::new(CommandKind::ErrorResponse, b"bad crc".to_vec())
                .unwrap()
                .encode(),
        );

        let reply = transport
            .send_and_await(&Frame::empty(CommandKind::RunApp), CommandKind::Ack)
            .unwrap();
        assert_eq!(reply.kind(), CommandKind::ErrorResponse);
        assert_eq!(transport.last_device_error().as_deref(), Some("bad crc"));
        assert_eq!(sink.device_errors(), vec!["bad crc".to_string()]);
    }

    #[test]
    fn test_unexpected_kind_skipped_until_expected() {
        let (transport, handle) = open_transport(short_config());
        let mut reply = Frame::empty(CommandKind::Nack).encode();
        reply.extend_from_slice(&Frame::empty(CommandKind::Ack).encode());
        handle.reply_with(&reply);

        let got = transport
            .send_and_await(&Frame::empty(CommandKind::RunApp), CommandKind::Ack)
            .unwrap();
        assert_eq!(got.kind(), CommandKind::Ack);
    }

    #[test]
    fn test_timeout_retries_then_fails() {
        let config = short_config().with_retry_count(3);
        let (transport, handle) = open_transport(config);
        // Device stays silent.

        let started = Instant::now();
        let err = transport
            .send_and_await(&Frame::empty(CommandKind::EnterBoot), CommandKind::EnterBoot)
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        // Three 200 ms waits plus two 100 ms pauses.
        assert!(started.elapsed() >= Duration::from_millis(600));
        assert_eq!(handle.writes().len(), 3);
    }

    #[test]
    fn test_retry_succeeds_after_silent_attempt() {
        let config = short_config().with_retry_count(2);
        let (transport, handle) = open_transport(config);
        handle.stay_silent();
        handle.reply_with(&Frame::empty(CommandKind::Ack).encode());

        let reply = transport
            .send_and_await(&Frame::empty(CommandKind::RunApp), CommandKind::Ack)
            .unwrap();
        assert_eq!(reply.kind(), CommandKind::Ack);
        assert_eq!(handle.writes().len(), 2);
    }

    #[test]
    fn test_write_on_disconnected_port_fails_immediately() {
        // A generous retry budget must not be spent on write failures.
        let config = short_config().with_retry_count(3);
        let (transport, handle) = open_transport(config);
        handle.disconnect();

        let started = Instant::now();
        let err = transport
            .send_and_await(&Frame::empty(CommandKind::RunApp), CommandKind::Ack)
            .unwrap_err();
        assert!(matches!(err, Error::TransportClosed));
        // No timeout wait and no 100 ms inter-attempt pause happened.
        assert!(started.elapsed() < Duration::from_millis(100));
        assert!(handle.writes().is_empty());
    }

    #[test]
    fn test_concurrent_sends_are_serialized() {
        let config = short_config();
        let (port, handle) = MockPort::pair();
        let transport = Arc::new(
            Transport::open(Box::new(port), config, Arc::new(NullSink)).unwrap(),
        );
        handle.reply_with(&Frame::empty(CommandKind::Ack).encode());
        handle.reply_with(&Frame::empty(CommandKind::Ack).encode());

        let a = {
            let transport = Arc::clone(&transport);
            thread::spawn(move || {
                transport.send_and_await(&Frame::empty(CommandKind::RunApp), CommandKind::Ack)
            })
        };
        let b = {
            let transport = Arc::clone(&transport);
            thread::spawn(move || {
                transport.send_and_await(&Frame::empty(CommandKind::RunApp), CommandKind::Ack)
            })
        };

        assert_eq!(a.join().unwrap().unwrap().kind(), CommandKind::Ack);
        assert_eq!(b.join().unwrap().unwrap().kind(), CommandKind::Ack);
        assert_eq!(handle.writes().len(), 2);
    }
}
