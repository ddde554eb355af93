//! Client for the ESP8266 ROM bootloader
//!
//! The [Connection] struct owns the SLIP framing and request/response cycle
//! of the mask-ROM serial protocol, and provides the higher-level operations
//! built on it: entering flashing mode, reading the MAC address, uploading
//! code into IRAM, and the reset dances in and out of the bootloader.

use std::{
    io::{BufWriter, Write},
    thread::sleep,
    time::Duration,
};

use log::debug;
use slip_codec::SlipDecoder;

use self::{
    encoder::SlipEncoder,
    reset::{ClassicReset, ResetStrategy},
};
use crate::{
    command::{Command, CommandType},
    error::{ConnectionError, Error, RomError, RomErrorKind},
    interface::Interface,
};

pub mod reset;

/// Baud rate the ROM bootloader listens at.
pub const DEFAULT_ROM_BAUD: u32 = 115_200;

const MAX_CONNECT_ATTEMPTS: usize = 7;
const MAX_SYNC_ATTEMPTS: usize = 5;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
const FLASH_WRITE_SIZE: u32 = 0x400;

const OTP_MAC0_REG: u32 = 0x3FF0_0050;
const OTP_MAC1_REG: u32 = 0x3FF0_0054;

/// A response from the ROM following a command.
#[derive(Debug, Copy, Clone)]
pub struct CommandResponse {
    pub resp: u8,
    pub return_op: u8,
    pub return_length: u16,
    pub value: u32,
    pub error: u8,
    pub status: u8,
}

/// An established connection with the ROM bootloader.
///
/// The control port carries ROM commands and the DTR/RTS reset lines; the
/// optional data port carries the flasher-stub traffic once the stub runs.
pub struct Connection<'a> {
    control: &'a mut Interface,
    data: Option<Interface>,
    decoder: SlipDecoder,
}

impl<'a> Connection<'a> {
    pub fn new(control: &'a mut Interface, data: Option<Interface>) -> Self {
        Connection {
            control,
            data,
            decoder: SlipDecoder::new(),
        }
    }

    /// Reset into the ROM bootloader and synchronize with it.
    ///
    /// Alternates the short and the long GPIO0 strap delay across attempts;
    /// boards with slow capacitors on the reset line only catch the latter.
    pub fn connect(&mut self) -> Result<(), Error> {
        for attempt in 0..MAX_CONNECT_ATTEMPTS {
            debug!("Connect attempt {}", attempt + 1);
            match self.connect_attempt(attempt % 2 == 1) {
                Ok(()) => {
                    self.set_timeout(DEFAULT_TIMEOUT)?;
                    return Ok(());
                }
                Err(err) => {
                    debug!("Failed to connect, error {err:#?}, retrying");
                }
            }
        }

        Err(Error::Connection(ConnectionError::ConnectionFailed))
    }

    fn connect_attempt(&mut self, extra_delay: bool) -> Result<(), Error> {
        ClassicReset::new(extra_delay).reset(self.control)?;

        for _ in 0..MAX_SYNC_ATTEMPTS {
            self.flush()?;

            if self.sync().is_ok() {
                return Ok(());
            }
        }

        Err(Error::Connection(ConnectionError::ConnectionFailed))
    }

    pub(crate) fn sync(&mut self) -> Result<(), Error> {
        self.with_timeout(CommandType::Sync.timeout(), |connection| {
            connection.write_command(Command::Sync)?;
            connection.flush()?;

            sleep(Duration::from_millis(10));

            match connection.read_response()? {
                Some(response) if response.return_op == CommandType::Sync as u8 => {
                    if response.error != 0 {
                        connection.flush().ok();
                        return Err(Error::Rom(RomError::new(
                            CommandType::Sync,
                            RomErrorKind::from(response.error),
                        )));
                    }
                }
                _ => {
                    return Err(Error::Rom(RomError::new(
                        CommandType::Sync,
                        RomErrorKind::InvalidMessage,
                    )))
                }
            }

            Ok(())
        })
    }

    /// Read the two OTP words and compose the factory MAC address.
    pub fn read_mac(&mut self) -> Result<[u8; 6], Error> {
        let mac0 = self.read_reg(OTP_MAC0_REG)?;
        let mac1 = self.read_reg(OTP_MAC1_REG)?;

        let oui: [u8; 3] = match (mac1 >> 16) & 0xFF {
            0 => [0x18, 0xFE, 0x34],
            1 => [0xAC, 0xD0, 0x74],
            _ => return Err(Error::UnknownOui(mac1)),
        };

        Ok([
            oui[0],
            oui[1],
            oui[2],
            (mac1 >> 8) as u8,
            mac1 as u8,
            (mac0 >> 24) as u8,
        ])
    }

    /// Jump to user code without touching the strap lines. Best-effort: the
    /// ROM does not answer the final command.
    pub fn soft_reset(&mut self) -> Result<(), Error> {
        debug!("Soft resetting");

        self.command(Command::FlashBegin {
            size: 0,
            blocks: 0,
            block_size: FLASH_WRITE_SIZE,
            offset: 0,
        })?;
        self.with_timeout(CommandType::FlashEnd.timeout(), |connection| {
            connection.write_command(Command::FlashEnd { reboot: true })
        })
    }

    /// Hardware reset with GPIO0 high, booting the firmware from flash.
    pub fn reboot_into_firmware(&mut self) -> Result<(), Error> {
        reset::hard_reset(self.control)
    }

    /// Set the timeout of the control port.
    pub fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        self.control.serial_port_mut().set_timeout(timeout)?;
        Ok(())
    }

    /// Run `f` with the control-port timeout temporarily overridden.
    pub(crate) fn with_timeout<T, F>(&mut self, timeout: Duration, mut f: F) -> Result<T, Error>
    where
        F: FnMut(&mut Connection<'a>) -> Result<T, Error>,
    {
        let old_timeout = {
            let serial = self.control.serial_port_mut();
            let old_timeout = serial.timeout();
            serial.set_timeout(timeout)?;
            old_timeout
        };

        let result = f(self);

        self.control.serial_port_mut().set_timeout(old_timeout)?;

        result
    }

    pub(crate) fn read_response(&mut self) -> Result<Option<CommandResponse>, Error> {
        match self.read(10)? {
            None => Ok(None),
            Some(response) => {
                if response.len() < 10 {
                    return Ok(None);
                }

                let header = CommandResponse {
                    resp: response[0],
                    return_op: response[1],
                    return_length: u16::from_le_bytes(response[2..4].try_into().unwrap()),
                    value: u32::from_le_bytes(response[4..8].try_into().unwrap()),
                    error: response[response.len() - 2],
                    status: response[response.len() - 1],
                };

                Ok(Some(header))
            }
        }
    }

    pub(crate) fn write_command(&mut self, command: Command<'_>) -> Result<(), Error> {
        debug!("Writing command: {command:?}");
        let serial = self.control.serial_port_mut();

        serial.clear(serialport::ClearBuffer::Input)?;
        let mut writer = BufWriter::new(serial);
        let mut encoder = SlipEncoder::new(&mut writer)?;
        command.write(&mut encoder)?;
        encoder.finish()?;
        writer.flush()?;
        Ok(())
    }

    /// Write a command and read the matching response.
    pub(crate) fn command(&mut self, command: Command<'_>) -> Result<u32, Error> {
        let ty = command.command_type();
        for_command(self.write_command(command), ty)?;

        for _ in 0..100 {
            match for_command(self.read_response(), ty)? {
                Some(response) if response.return_op == ty as u8 => {
                    return if response.error != 0 {
                        self.flush().ok();
                        Err(Error::Rom(RomError::new(
                            ty,
                            RomErrorKind::from(response.error),
                        )))
                    } else {
                        Ok(response.value)
                    };
                }
                _ => {
                    continue;
                }
            }
        }
        Err(Error::Connection(ConnectionError::ConnectionFailed))
    }

    pub fn read_reg(&mut self, reg: u32) -> Result<u32, Error> {
        self.with_timeout(CommandType::ReadReg.timeout(), |connection| {
            connection.command(Command::ReadReg { address: reg })
        })
    }

    pub fn write_reg(&mut self, addr: u32, value: u32, mask: Option<u32>) -> Result<(), Error> {
        self.with_timeout(CommandType::WriteReg.timeout(), |connection| {
            connection.command(Command::WriteReg {
                address: addr,
                value,
                mask,
            })
        })?;

        Ok(())
    }

    fn read(&mut self, len: usize) -> Result<Option<Vec<u8>>, Error> {
        let mut tmp = Vec::with_capacity(1024);
        loop {
            self.decoder
                .decode(&mut self.control, &mut tmp)
                .map_err(ConnectionError::from)?;
            if tmp.len() >= len {
                return Ok(Some(tmp));
            }
        }
    }

    pub fn flush(&mut self) -> Result<(), Error> {
        self.control.serial_port_mut().flush()?;
        Ok(())
    }

    // --- data channel, used by the flasher-stub client -------------------

    pub(crate) fn data_port_mut(&mut self) -> &mut Interface {
        match &mut self.data {
            Some(port) => port,
            None => self.control,
        }
    }

    pub(crate) fn data_baud(&mut self) -> Result<u32, Error> {
        Ok(self.data_port_mut().serial_port().baud_rate()?)
    }

    pub(crate) fn set_data_baud(&mut self, baud: u32) -> Result<(), Error> {
        self.data_port_mut().serial_port_mut().set_baud_rate(baud)?;
        Ok(())
    }

    /// Send one SLIP frame on the data channel.
    pub(crate) fn send_frame(&mut self, payload: &[u8]) -> Result<(), Error> {
        let port = self.data_port_mut().serial_port_mut();
        let mut writer = BufWriter::new(port);
        let mut encoder = SlipEncoder::new(&mut writer)?;
        encoder.write_all(payload)?;
        encoder.finish()?;
        writer.flush()?;
        Ok(())
    }

    /// Receive one SLIP frame from the data channel.
    pub(crate) fn recv_frame(&mut self, timeout: Duration) -> Result<Vec<u8>, Error> {
        let Connection { control, data, decoder } = self;
        let port: &mut Interface = match data {
            Some(port) => port,
            None => control,
        };

        let old_timeout = port.serial_port().timeout();
        port.serial_port_mut().set_timeout(timeout)?;

        let mut frame = Vec::new();
        let result = decoder.decode(port, &mut frame).map_err(ConnectionError::from);

        port.serial_port_mut().set_timeout(old_timeout)?;

        result?;
        Ok(frame)
    }

    /// Write unframed bytes to the data channel.
    pub(crate) fn write_raw(&mut self, data: &[u8]) -> Result<(), Error> {
        self.data_port_mut().serial_port_mut().write_all(data)?;
        Ok(())
    }
}

fn for_command<T>(result: Result<T, Error>, command: CommandType) -> Result<T, Error> {
    match result {
        Err(Error::Connection(ConnectionError::Timeout(_))) => Err(Error::Connection(
            ConnectionError::Timeout(command.into()),
        )),
        result => result,
    }
}

mod encoder {
    use std::io::Write;

    const END: u8 = 0xC0;
    const ESC: u8 = 0xDB;
    const ESC_END: u8 = 0xDC;
    const ESC_ESC: u8 = 0xDD;

    pub struct SlipEncoder<'a, W: Write> {
        writer: &'a mut W,
        len: usize,
    }

    impl<'a, W: Write> SlipEncoder<'a, W> {
        /// Creates a new encoder context
        pub fn new(writer: &'a mut W) -> std::io::Result<Self> {
            let len = writer.write(&[END])?;
            Ok(Self { writer, len })
        }

        pub fn finish(mut self) -> std::io::Result<usize> {
            self.len += self.writer.write(&[END])?;
            Ok(self.len)
        }
    }

    impl<W: Write> Write for SlipEncoder<'_, W> {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            for value in buf.iter() {
                match *value {
                    END => {
                        self.len += self.writer.write(&[ESC, ESC_END])?;
                    }
                    ESC => {
                        self.len += self.writer.write(&[ESC, ESC_ESC])?;
                    }
                    _ => {
                        self.len += self.writer.write(&[*value])?;
                    }
                }
            }

            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.writer.flush()
        }
    }

}
