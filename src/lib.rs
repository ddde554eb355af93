//! A library and application for flashing ESP8266 devices over serial
//!
//! The engine drives the chip's serial ROM bootloader, uploads a small
//! flasher stub into on-chip RAM, and then uses the stub as a fast data
//! path to program, verify, and selectively preserve portions of the SPI
//! flash. A session places every image of a multi-image firmware bundle at
//! its flash offset, negotiates the flash geometry, merges the device's
//! SPIFFS filesystem across the update when asked to, and skips sectors
//! whose content already matches, keeping both wear and flashing time down.
//!
//! ## As an application
//!
//! ```bash
//! $ cargo install esp8266-flasher
//! $ esp8266-flasher -p /dev/ttyUSB0 flash 0x0:boot.bin 0x10000:app.bin
//! ```
//!
//! ## As a library
//!
//! ```toml
//! esp8266-flasher = { version = "0.4", default-features = false }
//! ```
//!
//! Disabling default features drops the `cli` module and its dependencies;
//! embedding shells supply their own [observer::FlasherObserver] and
//! [observer::Prompter] implementations.

pub mod bundle;
#[cfg(feature = "cli")]
pub mod cli;
pub mod command;
pub mod connection;
pub mod error;
pub mod flash_params;
pub mod flasher;
pub mod fs;
pub mod hal;
pub mod image;
pub mod interface;
pub mod observer;
pub mod stub;

pub use error::{Error, ErrorKind};

/// Logging utilities
#[cfg(feature = "cli")]
pub mod logging {
    use env_logger::Env;
    use log::LevelFilter;

    /// Initialize the logger with the given [LevelFilter]
    pub fn initialize_logger(filter: LevelFilter) {
        env_logger::Builder::from_env(Env::default().default_filter_or(filter.as_str()))
            .format_target(false)
            .init();
    }
}
