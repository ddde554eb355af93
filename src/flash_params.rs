//! Codec for the flash-parameter word of the firmware header
//!
//! The image mapped at flash offset 0 carries a 16-bit word at bytes 2–3
//! describing the SPI mode, chip size and clock frequency to the ROM: high
//! byte is the mode id, low byte packs `(size_id << 4) | freq_id`. The size
//! tokens are in megabits, as the vendor tools spell them.

use std::str::FromStr;

use strum::{Display, EnumString, EnumVariantNames};

use crate::error::Error;

/// SPI access mode of the flash chip.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Display, EnumString, EnumVariantNames)]
#[strum(serialize_all = "lowercase")]
#[repr(u8)]
pub enum FlashMode {
    /// Quad I/O (4 pins used for address & data)
    Qio = 0,
    /// Quad Output (4 pins used for data)
    Qout = 1,
    /// Dual I/O (2 pins used for address & data)
    #[default]
    Dio = 2,
    /// Dual Output (2 pins used for data)
    Dout = 3,
}

/// Flash chip size, in megabits.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Display, EnumString, EnumVariantNames)]
#[repr(u8)]
pub enum FlashSize {
    #[default]
    #[strum(serialize = "4m")]
    Flash4Mbit = 0,
    #[strum(serialize = "2m")]
    Flash2Mbit = 1,
    #[strum(serialize = "8m")]
    Flash8Mbit = 2,
    #[strum(serialize = "16m")]
    Flash16Mbit = 3,
    #[strum(serialize = "32m")]
    Flash32Mbit = 4,
    #[strum(serialize = "16m-c1")]
    Flash16MbitC1 = 5,
    #[strum(serialize = "32m-c1")]
    Flash32MbitC1 = 6,
    #[strum(serialize = "32m-c2")]
    Flash32MbitC2 = 7,
}

impl FlashSize {
    /// Size in bytes.
    pub fn size(self) -> u32 {
        match self {
            FlashSize::Flash4Mbit => 524_288,
            FlashSize::Flash2Mbit => 262_144,
            FlashSize::Flash8Mbit => 1_048_576,
            FlashSize::Flash16Mbit => 2_097_152,
            FlashSize::Flash32Mbit => 4_194_304,
            FlashSize::Flash16MbitC1 => 2_097_152,
            FlashSize::Flash32MbitC1 => 4_194_304,
            FlashSize::Flash32MbitC2 => 4_194_304,
        }
    }

    /// The id stored in the params word, or `invalid_argument` for ids the
    /// header format does not define.
    pub fn from_id(id: u8) -> Result<FlashSize, Error> {
        match id {
            0 => Ok(FlashSize::Flash4Mbit),
            1 => Ok(FlashSize::Flash2Mbit),
            2 => Ok(FlashSize::Flash8Mbit),
            3 => Ok(FlashSize::Flash16Mbit),
            4 => Ok(FlashSize::Flash32Mbit),
            5 => Ok(FlashSize::Flash16MbitC1),
            6 => Ok(FlashSize::Flash32MbitC1),
            7 => Ok(FlashSize::Flash32MbitC2),
            _ => Err(Error::InvalidFlashSizeId(id)),
        }
    }

    /// The plain (non-split-layout) variant matching a detected byte size.
    pub fn from_detected(bytes: u32) -> Result<FlashSize, Error> {
        match bytes {
            262_144 => Ok(FlashSize::Flash2Mbit),
            524_288 => Ok(FlashSize::Flash4Mbit),
            1_048_576 => Ok(FlashSize::Flash8Mbit),
            2_097_152 => Ok(FlashSize::Flash16Mbit),
            4_194_304 => Ok(FlashSize::Flash32Mbit),
            _ => Err(Error::InvalidFlashSize(bytes.to_string())),
        }
    }
}

/// SPI clock frequency of the flash chip.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Display, EnumString, EnumVariantNames)]
#[repr(u8)]
pub enum FlashFrequency {
    #[default]
    #[strum(serialize = "40m")]
    Freq40M = 0,
    #[strum(serialize = "26m")]
    Freq26M = 1,
    #[strum(serialize = "20m")]
    Freq20M = 2,
    #[strum(serialize = "80m")]
    Freq80M = 0xF,
}

/// Pack mode, size and frequency into the 16-bit header word.
pub fn flash_params(mode: FlashMode, size: FlashSize, freq: FlashFrequency) -> u16 {
    ((mode as u16) << 8) | ((size as u16) << 4) | freq as u16
}

/// Parse a flash-params value: either a bare number or a
/// `"mode,size,freq"` triple such as `"dio,4m,40m"`.
pub fn flash_params_from_str(s: &str) -> Result<u16, Error> {
    if !s.contains(',') {
        let value =
            parse_int(s).map_err(|_| Error::InvalidFlashParams(s.to_string()))?;
        return Ok(value as u16);
    }

    let parts: Vec<&str> = s.split(',').collect();
    if parts.len() != 3 {
        return Err(Error::InvalidFlashParams(s.to_string()));
    }
    let mode = FlashMode::from_str(parts[0])
        .map_err(|_| Error::InvalidFlashMode(parts[0].to_string()))?;
    let size = FlashSize::from_str(parts[1])
        .map_err(|_| Error::InvalidFlashSize(parts[1].to_string()))?;
    let freq = FlashFrequency::from_str(parts[2])
        .map_err(|_| Error::InvalidFlashFrequency(parts[2].to_string()))?;

    Ok(flash_params(mode, size, freq))
}

/// The byte size encoded in a params word.
pub fn flash_size_from_params(params: u16) -> Result<u32, Error> {
    let id = ((params & 0xFF) >> 4) as u8;
    Ok(FlashSize::from_id(id)?.size())
}

/// Parse a size string: an integer with an optional suffix, where uppercase
/// `K`/`M` count bytes and lowercase `k`/`m` count bits, so
/// `1M = 1024K = 8m = 8192k = 1048576` bytes.
///
/// This is the one normalized parser; both the CLI string path and
/// programmatic option setting go through it.
pub fn parse_size(s: &str) -> Result<u32, Error> {
    let invalid = || Error::InvalidSize(s.to_string());

    let (digits, shift, div) = match s.chars().last() {
        Some('K') => (&s[..s.len() - 1], 10, 1),
        Some('M') => (&s[..s.len() - 1], 20, 1),
        Some('k') => (&s[..s.len() - 1], 10, 8),
        Some('m') => (&s[..s.len() - 1], 20, 8),
        Some(_) => (s, 0, 1),
        None => return Err(invalid()),
    };

    let value = parse_int(digits).map_err(|_| invalid())? as u64;
    let bytes = (value << shift) / div;
    u32::try_from(bytes).map_err(|_| invalid())
}

/// Parse an integer with C-style radix prefixes (`0x`, `0o`, `0b`).
pub(crate) fn parse_int(s: &str) -> Result<u32, std::num::ParseIntError> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else if let Some(oct) = s.strip_prefix("0o") {
        u32::from_str_radix(oct, 8)
    } else if let Some(bin) = s.strip_prefix("0b") {
        u32::from_str_radix(bin, 2)
    } else {
        s.parse()
    }
}
