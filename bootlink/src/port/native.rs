//! Native serial port implementation using the `serialport` crate.

use log::trace;
use serialport::ClearBuffer;
use std::io::{Read, Write};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::port::{Port, PortInfo, SerialConfig};

/// Native serial port.
pub struct NativePort {
    port: Option<Box<dyn serialport::SerialPort>>,
    name: String,
    timeout: Duration,
}

impl NativePort {
    /// Open a serial port with the given configuration (8N1, no flow
    /// control).
    pub fn open(config: &SerialConfig) -> Result<Self> {
        let port = serialport::new(&config.port_name, config.baud_rate)
            .timeout(config.timeout)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()?;

        Ok(Self {
            port: Some(port),
            name: config.port_name.clone(),
            timeout: config.timeout,
        })
    }

    /// Open a serial port with default settings.
    pub fn open_simple(port_name: &str, baud_rate: u32) -> Result<Self> {
        Self::open(&SerialConfig::new(port_name, baud_rate))
    }

    fn inner(&mut self) -> std::io::Result<&mut Box<dyn serialport::SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"))
    }
}

impl Port for NativePort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        if let Some(ref mut p) = self.port {
            p.set_timeout(timeout)?;
        }
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn clear_buffers(&mut self) -> Result<()> {
        if let Some(ref mut p) = self.port {
            p.clear(ClearBuffer::All)?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn try_clone_reader(&self) -> Result<Box<dyn Port>> {
        let port = self
            .port
            .as_ref()
            .ok_or(Error::TransportClosed)?
            .try_clone()?;
        trace!("Cloned reader handle for {}", self.name);
        Ok(Box::new(Self {
            port: Some(port),
            name: self.name.clone(),
            timeout: self.timeout,
        }))
    }

    fn close(&mut self) -> Result<()> {
        // Drop the handle; the OS closes the descriptor.
        self.port.take();
        Ok(())
    }
}

impl Read for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner().and_then(|p| p.read(buf))
    }
}

impl Write for NativePort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner().and_then(|p| p.write(buf))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner().and_then(|p| p.flush())
    }
}

/// List all available serial ports with USB metadata where present.
pub fn list_ports() -> Result<Vec<PortInfo>> {
    Ok(serialport::available_ports()?
        .into_iter()
        .map(port_info)
        .collect())
}

/// Keep only what callers need from an enumerated port: the name, plus USB
/// identity when the port has one.
fn port_info(port: serialport::SerialPortInfo) -> PortInfo {
    let mut info = PortInfo {
        name: port.port_name,
        ..PortInfo::default()
    };
    if let serialport::SerialPortType::UsbPort(usb) = port.port_type {
        info.vid = Some(usb.vid);
        info.pid = Some(usb.pid);
        info.manufacturer = usb.manufacturer;
        info.product = usb.product;
        info.serial_number = usb.serial_number;
    }
    info
}
