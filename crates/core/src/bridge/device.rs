use std::{
    io::{Read, Write},
    time::Duration,
};

use crate::{BridgeConfig, Result};

/// Byte stream to the wand. Reads must time out (`TimedOut`/`WouldBlock`)
/// rather than block indefinitely; `Ok(0)` means the device went away.
pub trait SerialDevice: Read + Write + Send {}

impl<T: Read + Write + Send + ?Sized> SerialDevice for T {}

/// Opens the device on behalf of the bridge, which owns the handle for as
/// long as the connection lasts.
pub trait DeviceConnector: Send {
    fn connect(&mut self) -> Result<Box<dyn SerialDevice>>;

    /// Human-readable device name for logs.
    fn describe(&self) -> String;
}

/// Connector for a real serial port.
#[derive(Debug, Clone)]
pub struct SerialPortConnector {
    path: String,
    baud_rate: u32,
    read_timeout: Duration,
}

impl SerialPortConnector {
    pub fn new(path: impl Into<String>, baud_rate: u32, read_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            read_timeout,
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(&config.serial_port, config.baud_rate, config.read_timeout())
    }
}

impl DeviceConnector for SerialPortConnector {
    fn connect(&mut self) -> Result<Box<dyn SerialDevice>> {
        let port = serialport::new(&self.path, self.baud_rate)
            .timeout(self.read_timeout)
            .open()?;
        if let Err(err) = port.clear(serialport::ClearBuffer::Input) {
            tracing::debug!(%err, "could not clear serial input buffer");
        }
        Ok(Box::new(port))
    }

    fn describe(&self) -> String {
        format!("{}@{}", self.path, self.baud_rate)
    }
}
