//! Client for the resident flasher stub
//!
//! Once the stub runs it speaks its own protocol on the data channel: raw
//! SLIP frames with a single command byte, little-endian argument words and
//! MD5 digests guarding every bulk transfer. This is a much faster data path
//! than the ROM's own flash commands.

use std::{cmp, time::Duration};

use log::{debug, info};
use md5::{Digest, Md5};

use crate::{
    connection::Connection,
    error::{ConnectionError, Error},
};

mod loader;
pub use loader::FlashStub;

/// Erase granularity of the SPI flash.
pub const FLASH_SECTOR_SIZE: u32 = 4096;
/// Large-erase granularity of the SPI flash.
pub const FLASH_BLOCK_SIZE: u32 = 65536;

const READ_CHUNK_SIZE: u32 = 1024;
const WRITE_CHUNK_SIZE: usize = 1024;
/// Unacknowledged bytes the stub is willing to buffer during a write.
const WRITE_WINDOW: u32 = 5120;

// Conservative per-block time estimates, used in timeout calculations.
const BLOCK_READ_WRITE_TIME: Duration = Duration::from_millis(250);
const BLOCK_ERASE_TIME: Duration = Duration::from_millis(900);
const ERASE_MIN_TIMEOUT: Duration = Duration::from_secs(5);
const CHIP_ERASE_TIMEOUT: Duration = Duration::from_secs(20);
const SIMPLE_COMMAND_TIMEOUT: Duration = Duration::from_millis(200);
const CHIP_ID_TIMEOUT: Duration = Duration::from_secs(1);
const FRAME_TIMEOUT: Duration = Duration::from_secs(2);

const STUB_GREETING: &[u8] = b"OHAI";

#[derive(Copy, Clone, Debug)]
#[repr(u8)]
enum StubCommand {
    FlashErase = 0,
    FlashWrite = 1,
    FlashRead = 2,
    FlashDigest = 3,
    FlashReadChipId = 4,
    FlashEraseChip = 5,
    BootFirmware = 6,
    Reboot = 7,
}

/// MD5 digests of a flash range: the whole range plus, when a block size was
/// given, one digest per block.
#[derive(Debug, Clone, Default)]
pub struct DigestResult {
    pub digest: [u8; 16],
    pub block_digests: Vec<[u8; 16]>,
}

/// Flash operations offered by a running stub.
///
/// The orchestrator works against this trait; tests drive it with a scripted
/// in-memory implementation.
pub trait FlashClient {
    /// JEDEC-style chip ID: `(mfg << 24) | (type << 16) | (capacity << 8)`.
    fn flash_chip_id(&mut self) -> Result<u32, Error>;

    /// Read a flash region. No alignment requirements.
    fn read(
        &mut self,
        addr: u32,
        size: u32,
        progress: &mut dyn FnMut(u32),
    ) -> Result<Vec<u8>, Error>;

    /// Write a flash region, optionally erasing it first. Address and length
    /// must be sector-aligned.
    fn write(
        &mut self,
        addr: u32,
        data: &[u8],
        erase: bool,
        progress: &mut dyn FnMut(u32),
    ) -> Result<(), Error>;

    /// Erase a sector-aligned flash region.
    fn erase_region(&mut self, addr: u32, size: u32) -> Result<(), Error>;

    /// Erase the entire chip.
    fn erase_chip(&mut self) -> Result<(), Error>;

    /// MD5 of a flash region. No alignment requirements.
    fn digest(&mut self, addr: u32, size: u32, block_size: u32) -> Result<DigestResult, Error>;

    /// Jump to the flash-loader routine, booting the firmware without a
    /// hardware reset.
    fn boot_firmware(&mut self) -> Result<(), Error>;
}

/// A [FlashClient] talking to the real stub over a serial connection.
pub struct StubClient<'c, 'p> {
    connection: &'c mut Connection<'p>,
    old_baud: Option<u32>,
}

impl<'c, 'p> StubClient<'c, 'p> {
    /// Upload the stub, switch the data channel to `baud` and wait for the
    /// stub's greeting.
    pub fn connect(connection: &'c mut Connection<'p>, baud: u32) -> Result<Self, Error> {
        let stub = FlashStub::esp8266();
        let rom_baud = connection.data_baud()?;
        // The stub skips the UART reconfiguration when given a zero baud rate.
        let baud_param = if baud == rom_baud { 0 } else { baud };

        stub.upload(connection, &[baud_param])?;

        let mut client = StubClient {
            connection,
            old_baud: None,
        };
        if baud_param > 0 {
            client.connection.set_data_baud(baud)?;
            client.old_baud = Some(rom_baud);
        }

        let greeting = client.connection.recv_frame(FRAME_TIMEOUT)?;
        if greeting != STUB_GREETING {
            return Err(Error::Connection(ConnectionError::InvalidStubHandshake));
        }
        info!("Connected to flasher stub");

        Ok(client)
    }

    /// Restore the pre-stub baud rate of the data channel. The stub keeps
    /// running.
    pub fn disconnect(&mut self) -> Result<(), Error> {
        if let Some(baud) = self.old_baud.take() {
            self.connection.set_data_baud(baud)?;
        }
        Ok(())
    }

    /// Reboot the chip via the stub.
    pub fn reboot(&mut self) -> Result<(), Error> {
        self.simple_command(StubCommand::Reboot, SIMPLE_COMMAND_TIMEOUT)
    }

    fn simple_command(&mut self, command: StubCommand, timeout: Duration) -> Result<(), Error> {
        debug!("Stub command {command:?}");
        self.connection.send_frame(&[command as u8])?;
        self.connection.recv_frame(timeout)?;
        Ok(())
    }

    fn send_args(&mut self, args: &[u32]) -> Result<(), Error> {
        let bytes: Vec<u8> = args.iter().flat_map(|a| a.to_le_bytes()).collect();
        self.connection.send_frame(&bytes)
    }
}

impl Drop for StubClient<'_, '_> {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}

impl FlashClient for StubClient<'_, '_> {
    fn flash_chip_id(&mut self) -> Result<u32, Error> {
        debug!("Reading flash chip ID");
        self.connection
            .send_frame(&[StubCommand::FlashReadChipId as u8])?;

        let response = self.connection.recv_frame(CHIP_ID_TIMEOUT)?;
        if response.len() != 4 {
            return Err(ConnectionError::UnexpectedResponse {
                expected: "4-byte chip ID",
                got: response.len(),
            }
            .into());
        }
        // Big-endian read preserves the JEDEC byte order.
        let chip_id = u32::from_be_bytes(response[..4].try_into().unwrap());
        if chip_id == 0 {
            return Err(ConnectionError::InvalidChipId.into());
        }

        self.connection.recv_frame(FRAME_TIMEOUT)?;
        Ok(chip_id)
    }

    fn read(
        &mut self,
        addr: u32,
        size: u32,
        progress: &mut dyn FnMut(u32),
    ) -> Result<Vec<u8>, Error> {
        debug!("Reading {size} bytes @ {addr:#x}");
        self.connection.send_frame(&[StubCommand::FlashRead as u8])?;
        self.send_args(&[addr, size, READ_CHUNK_SIZE])?;

        let mut data = Vec::with_capacity(size as usize);
        while (data.len() as u32) < size {
            let chunk = self.connection.recv_frame(FRAME_TIMEOUT)?;
            data.extend_from_slice(&chunk);
            progress(data.len() as u32);
        }
        if data.len() as u32 > size {
            return Err(ConnectionError::UnexpectedResponse {
                expected: "exact read length",
                got: data.len(),
            }
            .into());
        }

        let digest = self.connection.recv_frame(FRAME_TIMEOUT)?;
        if digest.as_slice() != Md5::digest(&data).as_slice() {
            return Err(Error::DigestMismatch { addr });
        }
        // Hash matched, so the trailing status frame carries nothing new.
        self.connection.recv_frame(FRAME_TIMEOUT)?;

        Ok(data)
    }

    fn write(
        &mut self,
        addr: u32,
        data: &[u8],
        erase: bool,
        progress: &mut dyn FnMut(u32),
    ) -> Result<(), Error> {
        debug!("Writing {} bytes @ {:#x} (erase: {})", data.len(), addr, erase);
        self.connection
            .send_frame(&[StubCommand::FlashWrite as u8])?;
        self.send_args(&[addr, data.len() as u32, u32::from(erase)])?;

        let total = data.len() as u32;
        let mut num_sent: u32 = 0;
        let mut num_written: u32 = 0;
        while num_written < total {
            let ack = self.connection.recv_frame(BLOCK_ERASE_TIME)?;
            if ack.len() == 1 {
                return Err(Error::StubWrite { code: ack[0] });
            }
            if ack.len() != 4 {
                return Err(ConnectionError::UnexpectedResponse {
                    expected: "4-byte write progress",
                    got: ack.len(),
                }
                .into());
            }
            num_written = u32::from_le_bytes(ack[..4].try_into().unwrap());
            progress(num_written);

            while num_sent.saturating_sub(num_written) <= WRITE_WINDOW && num_sent < total {
                let to_send = cmp::min(WRITE_CHUNK_SIZE, (total - num_sent) as usize);
                self.connection
                    .write_raw(&data[num_sent as usize..][..to_send])?;
                num_sent += to_send as u32;
            }
        }

        let digest = self.connection.recv_frame(FRAME_TIMEOUT)?;
        if digest.as_slice() != Md5::digest(data).as_slice() {
            return Err(Error::DigestMismatch { addr });
        }

        let status = self.connection.recv_frame(FRAME_TIMEOUT)?;
        if status.len() != 1 {
            return Err(ConnectionError::UnexpectedResponse {
                expected: "1-byte status",
                got: status.len(),
            }
            .into());
        }
        if status[0] != 0 {
            return Err(Error::StubWrite { code: status[0] });
        }

        Ok(())
    }

    fn erase_region(&mut self, addr: u32, size: u32) -> Result<(), Error> {
        debug!("Erasing {size} bytes @ {addr:#x}");
        self.connection
            .send_frame(&[StubCommand::FlashErase as u8])?;
        self.send_args(&[addr, size])?;

        let timeout = cmp::max(
            ERASE_MIN_TIMEOUT,
            BLOCK_ERASE_TIME * (size / FLASH_BLOCK_SIZE + 1),
        );
        self.connection.recv_frame(timeout)?;
        Ok(())
    }

    fn erase_chip(&mut self) -> Result<(), Error> {
        self.simple_command(StubCommand::FlashEraseChip, CHIP_ERASE_TIMEOUT)
    }

    fn digest(&mut self, addr: u32, size: u32, block_size: u32) -> Result<DigestResult, Error> {
        debug!("Digesting {size} bytes @ {addr:#x} (block size {block_size})");
        self.connection
            .send_frame(&[StubCommand::FlashDigest as u8])?;
        self.send_args(&[addr, size, block_size])?;

        let frames = if block_size > 0 {
            10
        } else {
            size / FLASH_BLOCK_SIZE + 1
        };
        let timeout = BLOCK_READ_WRITE_TIME * frames;

        // Digest frames displace their predecessor into the block list; the
        // last one before the terminator is the whole-range digest.
        let mut digest: Option<[u8; 16]> = None;
        let mut block_digests = Vec::new();
        loop {
            let frame = self.connection.recv_frame(timeout)?;
            match frame.len() {
                16 => {
                    if let Some(previous) = digest.replace(frame[..16].try_into().unwrap()) {
                        block_digests.push(previous);
                    }
                }
                1 => {
                    let digest = digest.ok_or(ConnectionError::UnexpectedResponse {
                        expected: "16-byte digest",
                        got: 1,
                    })?;
                    return Ok(DigestResult {
                        digest,
                        block_digests,
                    });
                }
                len => {
                    return Err(ConnectionError::UnexpectedResponse {
                        expected: "digest frame",
                        got: len,
                    }
                    .into());
                }
            }
        }
    }

    fn boot_firmware(&mut self) -> Result<(), Error> {
        self.simple_command(StubCommand::BootFirmware, SIMPLE_COMMAND_TIMEOUT)
    }
}
