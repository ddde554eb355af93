//! Library and application errors

use std::{
    fmt::{Display, Formatter},
    io,
};

use miette::Diagnostic;
use slip_codec::SlipError;
use thiserror::Error;

use crate::command::CommandType;

/// Broad classification of an [Error].
///
/// Diagnostics carry the detail; callers that only need to branch on the
/// outcome class (tests, retry policies, exit codes) match on this instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    FailedPrecondition,
    NotFound,
    Unavailable,
    DataLoss,
    Io,
    Unknown,
}

#[derive(Error, Debug, Diagnostic)]
#[non_exhaustive]
pub enum Error {
    #[error("Error while connecting to device")]
    #[diagnostic(transparent)]
    Connection(#[from] ConnectionError),

    #[error("The bootloader returned an error")]
    #[diagnostic(transparent)]
    Rom(#[from] RomError),

    #[error("Failed to talk to bootloader.")]
    #[diagnostic(
        code(esp8266_flasher::bootloader_unavailable),
        help("Check the wiring of the reset and GPIO0 lines, or put the device into flashing mode (GPIO0 = 0, reset) manually")
    )]
    BootloaderNotResponding,

    #[error("No firmware loaded")]
    #[diagnostic(code(esp8266_flasher::no_firmware))]
    NoFirmware,

    #[error("Port {0} not found")]
    #[diagnostic(
        code(esp8266_flasher::data_port_not_found),
        help("Make sure the flashing data port is connected to the host system")
    )]
    DataPortNotFound(String),

    #[error("part {0} has no address specified")]
    #[diagnostic(code(esp8266_flasher::part_missing_address))]
    PartMissingAddress(String),

    #[error("part {name} has invalid address specified ({value})")]
    #[diagnostic(code(esp8266_flasher::part_invalid_address))]
    PartInvalidAddress { name: String, value: String },

    #[error("Image {len} @ {addr:#x} will not fit in flash (size {flash_size})")]
    #[diagnostic(code(esp8266_flasher::image_out_of_bounds))]
    ImageOutOfBounds {
        addr: u32,
        len: usize,
        flash_size: u32,
    },

    #[error("Image starting address ({addr:#x}) is not on flash sector boundary (sector size {sector_size})")]
    #[diagnostic(code(esp8266_flasher::image_misaligned))]
    ImageMisaligned { addr: u32, sector_size: u32 },

    #[error("Invalid magic byte in the first image")]
    #[diagnostic(
        code(esp8266_flasher::bad_image_magic),
        help("The image mapped at offset 0 must begin with the 0xE9 firmware magic")
    )]
    BadImageMagic,

    #[error("Image {addr:#x} overlaps with system params area ({area_size} @ {area_start:#x})")]
    #[diagnostic(code(esp8266_flasher::sys_params_overlap))]
    SysParamsOverlap {
        addr: u32,
        area_size: u32,
        area_start: u32,
    },

    #[error("Images at offsets {first:#x} and {second:#x} overlap.")]
    #[diagnostic(code(esp8266_flasher::images_overlap))]
    ImagesOverlap { first: u32, second: u32 },

    #[error("The flash mode '{0}' is not valid")]
    #[diagnostic(
        code(esp8266_flasher::invalid_flash_mode),
        help("The accepted values are: qio, qout, dio, dout")
    )]
    InvalidFlashMode(String),

    #[error("The flash size '{0}' is not valid")]
    #[diagnostic(
        code(esp8266_flasher::invalid_flash_size),
        help("The accepted values are: 2m, 4m, 8m, 16m, 32m, 16m-c1, 32m-c1, 32m-c2")
    )]
    InvalidFlashSize(String),

    #[error("The flash frequency '{0}' is not valid")]
    #[diagnostic(
        code(esp8266_flasher::invalid_flash_frequency),
        help("The accepted values are: 40m, 26m, 20m, 80m")
    )]
    InvalidFlashFrequency(String),

    #[error("invalid flash size id {0}")]
    #[diagnostic(code(esp8266_flasher::invalid_flash_size_id))]
    InvalidFlashSizeId(u8),

    #[error("'{0}' is not a valid flash params value")]
    #[diagnostic(
        code(esp8266_flasher::invalid_flash_params),
        help("Use either a number or a comma-separated list of three items, e.g. \"dio,4m,40m\"")
    )]
    InvalidFlashParams(String),

    #[error("'{0}' is not a valid size")]
    #[diagnostic(
        code(esp8266_flasher::invalid_size),
        help("Sizes are integers with an optional suffix: K/M for bytes, k/m for bits")
    )]
    InvalidSize(String),

    #[error("digest mismatch for image {addr:#x}")]
    #[diagnostic(code(esp8266_flasher::digest_mismatch))]
    DigestMismatch { addr: u32 },

    #[error("failed to flash image at {addr:#x}")]
    #[diagnostic(code(esp8266_flasher::write_failed))]
    WriteFailed {
        addr: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("no filesystem merger available")]
    #[diagnostic(code(esp8266_flasher::no_fs_merger))]
    NoFilesystemMerger,

    #[error("Unknown OUI in OTP MAC registers ({0:#010x})")]
    #[diagnostic(code(esp8266_flasher::unknown_oui))]
    UnknownOui(u32),

    #[error("stub failed to write, code {code:#04x}")]
    #[diagnostic(code(esp8266_flasher::stub_write))]
    StubWrite { code: u8 },

    #[error("{option}")]
    #[diagnostic(code(esp8266_flasher::invalid_option))]
    InvalidOption {
        option: &'static str,
        #[source]
        source: Box<Error>,
    },

    #[error("{phase}")]
    Phase {
        phase: &'static str,
        #[source]
        source: Box<Error>,
    },

    #[error("I/O error")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Connection(err) => err.kind(),
            Error::Rom(_) => ErrorKind::Unavailable,
            Error::BootloaderNotResponding => ErrorKind::Unavailable,
            Error::NoFirmware => ErrorKind::FailedPrecondition,
            Error::DataPortNotFound(_) => ErrorKind::NotFound,
            Error::PartMissingAddress(_)
            | Error::PartInvalidAddress { .. }
            | Error::ImageOutOfBounds { .. }
            | Error::ImageMisaligned { .. }
            | Error::BadImageMagic
            | Error::SysParamsOverlap { .. }
            | Error::ImagesOverlap { .. }
            | Error::InvalidFlashMode(_)
            | Error::InvalidFlashSize(_)
            | Error::InvalidFlashFrequency(_)
            | Error::InvalidFlashSizeId(_)
            | Error::InvalidFlashParams(_)
            | Error::InvalidSize(_) => ErrorKind::InvalidArgument,
            Error::DigestMismatch { .. } => ErrorKind::DataLoss,
            Error::WriteFailed { .. } => ErrorKind::Unavailable,
            Error::NoFilesystemMerger => ErrorKind::FailedPrecondition,
            Error::UnknownOui(_) => ErrorKind::Unknown,
            Error::StubWrite { .. } => ErrorKind::Unavailable,
            Error::InvalidOption { source, .. } => source.kind(),
            Error::Phase { source, .. } => source.kind(),
            Error::Io(_) => ErrorKind::Io,
        }
    }

    /// Render the error and its source chain as a single line, the way a
    /// status notification wants it.
    pub fn display_chain(&self) -> String {
        use std::error::Error as _;

        let mut out = self.to_string();
        let mut source = self.source();
        while let Some(err) = source {
            out.push_str(": ");
            out.push_str(&err.to_string());
            source = err.source();
        }
        out
    }
}

#[derive(Error, Debug, Diagnostic)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("IO error while using serial port: {0}")]
    #[diagnostic(code(esp8266_flasher::serial_error))]
    Serial(#[source] serialport::Error),

    #[error("Failed to connect to the device")]
    #[diagnostic(
        code(esp8266_flasher::connection_failed),
        help("Ensure that the device is connected and the reset and boot pins are not being held down")
    )]
    ConnectionFailed,

    #[error("Serial port not found")]
    #[diagnostic(
        code(esp8266_flasher::device_not_found),
        help("Ensure that the device is connected and your host recognizes the serial adapter")
    )]
    DeviceNotFound,

    #[error("Timeout while running {0}command")]
    #[diagnostic(code(esp8266_flasher::timeout))]
    Timeout(TimedOutCommand),

    #[error("Received packet has invalid SLIP framing")]
    #[diagnostic(
        code(esp8266_flasher::slip_framing),
        help("Try hard-resetting the device and try again")
    )]
    FramingError,

    #[error("Received packet too large for buffer")]
    #[diagnostic(code(esp8266_flasher::oversized_packet))]
    OverSizedPacket,

    #[error("Invalid stub handshake response received")]
    #[diagnostic(code(esp8266_flasher::stub_handshake))]
    InvalidStubHandshake,

    #[error("Unexpected response from flasher stub: expected {expected}, got {got} bytes")]
    #[diagnostic(code(esp8266_flasher::unexpected_response))]
    UnexpectedResponse { expected: &'static str, got: usize },

    #[error("0 is not a valid flash chip ID")]
    #[diagnostic(code(esp8266_flasher::invalid_chip_id))]
    InvalidChipId,
}

impl ConnectionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConnectionError::Serial(_)
            | ConnectionError::Timeout(_)
            | ConnectionError::FramingError
            | ConnectionError::OverSizedPacket => ErrorKind::Io,
            ConnectionError::ConnectionFailed | ConnectionError::InvalidStubHandshake => {
                ErrorKind::Unavailable
            }
            ConnectionError::DeviceNotFound => ErrorKind::NotFound,
            ConnectionError::UnexpectedResponse { .. } | ConnectionError::InvalidChipId => {
                ErrorKind::Unknown
            }
        }
    }
}

/// The command during which a serial timeout fired, when known.
#[derive(Debug, Default, Clone)]
pub struct TimedOutCommand {
    command: Option<CommandType>,
}

impl From<CommandType> for TimedOutCommand {
    fn from(command: CommandType) -> Self {
        TimedOutCommand {
            command: Some(command),
        }
    }
}

impl Display for TimedOutCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.command {
            Some(command) => write!(f, "{} ", command),
            None => Ok(()),
        }
    }
}

impl From<serialport::Error> for ConnectionError {
    fn from(err: serialport::Error) -> Self {
        match err.kind() {
            serialport::ErrorKind::Io(kind) => from_error_kind(kind, err),
            serialport::ErrorKind::NoDevice => ConnectionError::DeviceNotFound,
            _ => ConnectionError::Serial(err),
        }
    }
}

impl From<serialport::Error> for Error {
    fn from(err: serialport::Error) -> Self {
        Self::Connection(err.into())
    }
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        from_error_kind(err.kind(), err)
    }
}

fn from_error_kind<E: Into<serialport::Error>>(kind: io::ErrorKind, err: E) -> ConnectionError {
    match kind {
        io::ErrorKind::TimedOut => ConnectionError::Timeout(TimedOutCommand::default()),
        io::ErrorKind::NotFound => ConnectionError::DeviceNotFound,
        _ => ConnectionError::Serial(err.into()),
    }
}

impl From<SlipError> for ConnectionError {
    fn from(err: SlipError) -> Self {
        match err {
            SlipError::FramingError => Self::FramingError,
            SlipError::OversizedPacket => Self::OverSizedPacket,
            SlipError::ReadError(io) => Self::from(io),
            SlipError::EndOfStream => Self::FramingError,
        }
    }
}

impl From<SlipError> for Error {
    fn from(err: SlipError) -> Self {
        Self::Connection(err.into())
    }
}

/// Error codes returned by the ROM bootloader.
#[derive(Copy, Clone, Debug, Error, Diagnostic)]
#[repr(u8)]
#[non_exhaustive]
pub enum RomErrorKind {
    #[error("Invalid message received")]
    #[diagnostic(code(esp8266_flasher::rom::invalid_message))]
    InvalidMessage = 0x05,

    #[error("Bootloader failed to execute command")]
    #[diagnostic(code(esp8266_flasher::rom::failed))]
    FailedToAct = 0x06,

    #[error("Received message has invalid crc")]
    #[diagnostic(code(esp8266_flasher::rom::crc))]
    InvalidCrc = 0x07,

    #[error("Bootloader failed to write to flash")]
    #[diagnostic(code(esp8266_flasher::rom::flash_write))]
    FlashWriteError = 0x08,

    #[error("Bootloader failed to read from flash")]
    #[diagnostic(code(esp8266_flasher::rom::flash_read))]
    FlashReadError = 0x09,

    #[error("Invalid length for flash read")]
    #[diagnostic(code(esp8266_flasher::rom::flash_read_length))]
    FlashReadLengthError = 0x0a,

    #[error("Other")]
    #[diagnostic(code(esp8266_flasher::rom::other))]
    Other = 0xff,
}

impl From<u8> for RomErrorKind {
    fn from(raw: u8) -> Self {
        match raw {
            0x05 => RomErrorKind::InvalidMessage,
            0x06 => RomErrorKind::FailedToAct,
            0x07 => RomErrorKind::InvalidCrc,
            0x08 => RomErrorKind::FlashWriteError,
            0x09 => RomErrorKind::FlashReadError,
            0x0a => RomErrorKind::FlashReadLengthError,
            _ => RomErrorKind::Other,
        }
    }
}

/// An error response to a ROM command.
#[derive(Copy, Clone, Debug, Error, Diagnostic)]
#[non_exhaustive]
#[error("Error while running {command} command")]
pub struct RomError {
    command: CommandType,
    #[source]
    kind: RomErrorKind,
}

impl RomError {
    pub fn new(command: CommandType, kind: RomErrorKind) -> RomError {
        RomError { command, kind }
    }
}

pub(crate) trait ResultExt<T> {
    /// Wrap an error with the name of the phase it occurred in.
    fn in_phase(self, phase: &'static str) -> Result<T, Error>;
}

impl<T> ResultExt<T> for Result<T, Error> {
    fn in_phase(self, phase: &'static str) -> Result<T, Error> {
        self.map_err(|err| Error::Phase {
            phase,
            source: Box::new(err),
        })
    }
}
