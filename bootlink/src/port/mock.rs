//! Scripted in-memory port for testing the transport and scheduler.
//!
//! A [`MockPort`] behaves like a serial port whose far end is a scripted
//! device: every outbound write consumes one scripted reply (or scripted
//! silence), whose bytes then become readable. A [`MockHandle`] steers the
//! script and inspects captured writes from the test.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::port::Port;

const READ_POLL: Duration = Duration::from_millis(1);

struct MockState {
    /// Bytes available to the host side.
    rx: Mutex<VecDeque<u8>>,
    /// Captured outbound messages, one entry per write call.
    writes: Mutex<Vec<Vec<u8>>>,
    /// Scripted reply per outbound message; `None` keeps the device silent.
    replies: Mutex<VecDeque<Option<Vec<u8>>>>,
    connected: Mutex<bool>,
}

/// In-memory port backed by a reply script.
pub struct MockPort {
    state: Arc<MockState>,
    timeout: Duration,
}

impl MockPort {
    /// Create a connected port and the handle steering it.
    pub fn pair() -> (Self, MockHandle) {
        let state = Arc::new(MockState {
            rx: Mutex::new(VecDeque::new()),
            writes: Mutex::new(Vec::new()),
            replies: Mutex::new(VecDeque::new()),
            connected: Mutex::new(true),
        });
        (
            Self {
                state: Arc::clone(&state),
                timeout: Duration::from_millis(50),
            },
            MockHandle { state },
        )
    }

    fn check_connected(&self) -> std::io::Result<()> {
        if *self.state.connected.lock().unwrap() {
            Ok(())
        } else {
            Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "mock port disconnected",
            ))
        }
    }
}

/// Test-side controller for a [`MockPort`].
pub struct MockHandle {
    state: Arc<MockState>,
}

impl MockHandle {
    /// Script the reply to the next unanswered outbound message.
    pub fn reply_with(&self, bytes: &[u8]) {
        self.state
            .replies
            .lock()
            .unwrap()
            .push_back(Some(bytes.to_vec()));
    }

    /// Script silence for the next unanswered outbound message.
    pub fn stay_silent(&self) {
        self.state.replies.lock().unwrap().push_back(None);
    }

    /// Make bytes readable immediately, without waiting for a write.
    pub fn inject(&self, bytes: &[u8]) {
        self.state.rx.lock().unwrap().extend(bytes.iter().copied());
    }

    /// All captured outbound messages, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state.writes.lock().unwrap().clone()
    }

    /// Simulate the port going away; further I/O fails.
    pub fn disconnect(&self) {
        *self.state.connected.lock().unwrap() = false;
    }
}

impl Port for MockPort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.state.rx.lock().unwrap().clear();
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn try_clone_reader(&self) -> Result<Box<dyn Port>> {
        Ok(Box::new(Self {
            state: Arc::clone(&self.state),
            timeout: self.timeout,
        }))
    }

    fn close(&mut self) -> Result<()> {
        *self.state.connected.lock().unwrap() = false;
        Ok(())
    }
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let deadline = Instant::now() + self.timeout;
        loop {
            self.check_connected()?;
            {
                let mut rx = self.state.rx.lock().unwrap();
                if !rx.is_empty() {
                    let n = rx.len().min(buf.len());
                    for slot in buf.iter_mut().take(n) {
                        *slot = rx.pop_front().unwrap_or_default();
                    }
                    return Ok(n);
                }
            }
            if Instant::now() >= deadline {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "mock read timeout",
                ));
            }
            thread::sleep(READ_POLL);
        }
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.check_connected()?;
        self.state.writes.lock().unwrap().push(buf.to_vec());
        if let Some(reply) = self.state.replies.lock().unwrap().pop_front() {
            if let Some(bytes) = reply {
                self.state.rx.lock().unwrap().extend(bytes.iter().copied());
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.check_connected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_pops_scripted_reply() {
        let (mut port, handle) = MockPort::pair();
        handle.reply_with(b"pong");

        port.write_all(b"ping").unwrap();
        let mut buf = [0u8; 8];
        let n = port.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"pong");
        assert_eq!(handle.writes(), vec![b"ping".to_vec()]);
    }

    #[test]
    fn test_silence_times_out() {
        let (mut port, handle) = MockPort::pair();
        handle.stay_silent();
        port.set_timeout(Duration::from_millis(10)).unwrap();

        port.write_all(b"ping").unwrap();
        let err = port.read(&mut [0u8; 8]).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_inject_without_write() {
        let (mut port, handle) = MockPort::pair();
        handle.inject(b"hello");

        let mut buf = [0u8; 8];
        let n = port.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[test]
    fn test_disconnect_fails_io() {
        let (mut port, handle) = MockPort::pair();
        handle.disconnect();
        assert!(port.write_all(b"x").is_err());
        assert!(port.read(&mut [0u8; 1]).is_err());
    }

    #[test]
    fn test_clone_shares_stream() {
        let (port, handle) = MockPort::pair();
        let mut reader = port.try_clone_reader().unwrap();
        handle.inject(b"shared");

        let mut buf = [0u8; 8];
        let n = reader.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"shared");
    }
}
