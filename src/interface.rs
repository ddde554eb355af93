//! Wrapper around the serial port used to talk to the device

use std::{io::Read, time::Duration};

use serialport::{FlowControl, SerialPort};

use crate::error::Error;

const DEFAULT_SERIAL_TIMEOUT: Duration = Duration::from_secs(3);

/// A serial port plus the line controls the flashing protocol needs.
pub struct Interface {
    serial_port: Box<dyn SerialPort>,
}

impl Interface {
    /// Open the port at `path` with the given baud rate.
    pub fn open(path: &str, baud: u32) -> Result<Self, Error> {
        let serial_port = serialport::new(path, baud)
            .flow_control(FlowControl::None)
            .timeout(DEFAULT_SERIAL_TIMEOUT)
            .open()?;

        Ok(Interface { serial_port })
    }

    /// Wrap an already-open port.
    pub fn new(serial_port: Box<dyn SerialPort>) -> Self {
        Interface { serial_port }
    }

    pub fn write_data_terminal_ready(&mut self, level: bool) -> serialport::Result<()> {
        self.serial_port.write_data_terminal_ready(level)
    }

    pub fn write_request_to_send(&mut self, level: bool) -> serialport::Result<()> {
        self.serial_port.write_request_to_send(level)
    }

    pub fn name(&self) -> Option<String> {
        self.serial_port.name()
    }

    pub fn serial_port(&self) -> &dyn SerialPort {
        self.serial_port.as_ref()
    }

    pub fn serial_port_mut(&mut self) -> &mut dyn SerialPort {
        self.serial_port.as_mut()
    }

    pub fn into_serial(self) -> Box<dyn SerialPort> {
        self.serial_port
    }
}

// Note: this impl is necessary because using `dyn SerialPort` as `dyn Read`
// requires trait upcasting.
impl Read for Interface {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.serial_port.read(buf)
    }
}
