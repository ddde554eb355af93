//! Types and functions for the command-line interface
//!
//! The contents of this module are intended for the bundled
//! `esp8266-flasher` binary; library users supply their own configuration
//! surface, observer, and prompter.

use std::{
    collections::HashMap,
    io::{self, BufRead, Write},
    path::PathBuf,
};

use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};

use crate::{
    bundle::{FirmwareBundle, Part},
    error::Error,
    flash_params::{flash_params_from_str, parse_int, parse_size},
    flasher::{FlashOpts, DEFAULT_FLASH_BAUD},
    observer::{FlasherObserver, Prompter},
};

/// The `esp8266-*` option namespace.
#[derive(Debug, Default, Args)]
pub struct Esp8266FlashArgs {
    /// Size of the flash chip: bytes, or K/M bytes, or k/m bits
    /// (1M = 1024K = 8m = 8192k). Auto-detected when not given.
    #[arg(long = "esp8266-flash-size", value_name = "SIZE")]
    pub flash_size: Option<String>,

    /// Override the params bytes of the image at 0x0: either a number or
    /// "mode,size,freq", e.g. "dio,4m,40m".
    #[arg(long = "esp8266-flash-params", value_name = "PARAMS")]
    pub flash_params: Option<String>,

    /// Perform data transfers on another serial port; DTR/RTS for
    /// rebooting still use the main port.
    #[arg(long = "esp8266-flashing-data-port", value_name = "PORT")]
    pub flashing_data_port: Option<String>,

    /// Baud rate used once the flasher stub is running.
    #[arg(
        long = "esp8266-flash-baud-rate",
        value_name = "BAUD",
        default_value_t = 230_400
    )]
    pub flash_baud_rate: i64,

    /// Location of the SPIFFS filesystem block in flash.
    #[arg(
        long = "esp8266-spiffs-offset",
        value_name = "OFFSET",
        default_value = "0xec000"
    )]
    pub spiffs_offset: String,

    /// Size of the SPIFFS region in flash.
    #[arg(
        long = "esp8266-spiffs-size",
        value_name = "SIZE",
        default_value = "65536"
    )]
    pub spiffs_size: String,

    /// Do not compare flash contents with the images being written.
    #[arg(long = "esp8266-no-minimize-writes")]
    pub no_minimize_writes: bool,

    /// Erase the entire chip before flashing.
    #[arg(long = "esp8266-flash-erase-chip")]
    pub flash_erase_chip: bool,

    /// Merge the filesystem on the device into the one being flashed.
    #[arg(long = "esp8266-merge-fs")]
    pub merge_fs: bool,

    /// Dump the raw pre-merge filesystem bytes to this file.
    #[arg(long = "esp8266-dump-fs", value_name = "PATH")]
    pub dump_fs: Option<PathBuf>,
}

impl Esp8266FlashArgs {
    /// Validate and convert into session options, naming the offending
    /// option on failure.
    pub fn into_opts(self) -> Result<FlashOpts, Error> {
        let mut opts = FlashOpts::default();

        if let Some(size) = &self.flash_size {
            opts.flash_size = Some(option_value("esp8266-flash-size", parse_size(size))?);
        }
        if let Some(params) = &self.flash_params {
            opts.flash_params = Some(option_value(
                "esp8266-flash-params",
                flash_params_from_str(params),
            )?);
        }
        opts.data_port = self.flashing_data_port;
        opts.baud = if self.flash_baud_rate <= 0 {
            DEFAULT_FLASH_BAUD
        } else {
            self.flash_baud_rate as u32
        };
        opts.spiffs_offset = option_value(
            "esp8266-spiffs-offset",
            positive_int(&self.spiffs_offset),
        )?;
        opts.spiffs_size =
            option_value("esp8266-spiffs-size", positive_int(&self.spiffs_size))?;
        opts.minimize_writes = !self.no_minimize_writes;
        opts.erase_chip = self.flash_erase_chip;
        opts.merge_fs = self.merge_fs;
        opts.dump_fs = self.dump_fs;

        Ok(opts)
    }
}

fn option_value<T>(option: &'static str, result: Result<T, Error>) -> Result<T, Error> {
    result.map_err(|err| Error::InvalidOption {
        option,
        source: Box::new(err),
    })
}

fn positive_int(s: &str) -> Result<u32, Error> {
    match parse_int(s) {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(Error::InvalidSize(s.to_string())),
    }
}

/// A firmware bundle assembled from `ADDR[:TYPE]:FILE` arguments.
pub struct FileBundle {
    parts: Vec<Part>,
    paths: HashMap<String, PathBuf>,
}

impl FileBundle {
    pub fn from_specs(specs: &[String]) -> Result<Self, Error> {
        let mut parts = Vec::new();
        let mut paths = HashMap::new();

        for spec in specs {
            let fields: Vec<&str> = spec.splitn(3, ':').collect();
            let (addr, part_type, path) = match fields.as_slice() {
                [addr, path] => (*addr, None, *path),
                [addr, part_type, path] => (*addr, Some(*part_type), *path),
                _ => {
                    return Err(Error::PartInvalidAddress {
                        name: spec.clone(),
                        value: spec.clone(),
                    })
                }
            };

            let mut attrs = HashMap::new();
            attrs.insert("addr".to_string(), addr.to_string());
            if let Some(part_type) = part_type {
                attrs.insert("type".to_string(), part_type.to_string());
            }

            parts.push(Part {
                name: path.to_string(),
                attrs,
            });
            paths.insert(path.to_string(), PathBuf::from(path));
        }

        Ok(FileBundle { parts, paths })
    }
}

impl FirmwareBundle for FileBundle {
    fn parts(&self) -> Vec<Part> {
        self.parts.clone()
    }

    fn part_source(&self, name: &str) -> Result<Vec<u8>, Error> {
        let path = self
            .paths
            .get(name)
            .ok_or_else(|| Error::PartMissingAddress(name.to_string()))?;
        Ok(std::fs::read(path)?)
    }
}

/// Observer rendering progress with an [indicatif] bar.
pub struct ConsoleObserver {
    bar: ProgressBar,
    finished: Option<bool>,
}

impl ConsoleObserver {
    pub fn new(total: u32) -> Self {
        let bar = ProgressBar::new(total as u64);
        bar.set_style(
            ProgressStyle::with_template(
                "[{elapsed_precise}] {bar:40.cyan/blue} {bytes:>9}/{total_bytes:9} {msg}",
            )
            .unwrap()
            .progress_chars("#>-"),
        );

        ConsoleObserver {
            bar,
            finished: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.finished == Some(true)
    }
}

impl FlasherObserver for ConsoleObserver {
    fn progress(&mut self, bytes: u32) {
        self.bar.set_position(bytes as u64);
    }

    fn status(&mut self, message: &str, persistent: bool) {
        if persistent {
            self.bar.println(message);
        } else {
            self.bar.set_message(message.to_string());
        }
    }

    fn done(&mut self, message: &str, ok: bool) {
        self.bar.finish_and_clear();
        self.finished = Some(ok);
        if ok {
            println!("{message}");
        } else {
            eprintln!("{message}");
        }
    }
}

/// Prompter reading the choice index from stdin.
pub struct StdinPrompter;

impl Prompter for StdinPrompter {
    fn prompt(&self, message: &str, choices: &[&str]) -> usize {
        loop {
            eprintln!("{message}");
            for (i, choice) in choices.iter().enumerate() {
                eprintln!("  {i}) {choice}");
            }
            eprint!("> ");
            io::stderr().flush().ok();

            let mut line = String::new();
            if io::stdin().lock().read_line(&mut line).unwrap_or(0) == 0 {
                // Closed stdin aborts rather than retries forever.
                return choices
                    .iter()
                    .position(|choice| *choice == "Cancel")
                    .unwrap_or(0);
            }
            if let Ok(index) = line.trim().parse::<usize>() {
                if index < choices.len() {
                    return index;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::error::ErrorKind;

    #[test]
    fn args_defaults_mirror_session_defaults() {
        let args = Esp8266FlashArgs {
            flash_baud_rate: 230_400,
            spiffs_offset: "0xec000".to_string(),
            spiffs_size: "65536".to_string(),
            ..Default::default()
        };
        let opts = args.into_opts().unwrap();

        assert_eq!(opts.flash_size, None);
        assert_eq!(opts.baud, DEFAULT_FLASH_BAUD);
        assert_eq!(opts.spiffs_offset, 0xEC000);
        assert_eq!(opts.spiffs_size, 65_536);
        assert!(opts.minimize_writes);
        assert!(!opts.erase_chip);
        assert!(!opts.merge_fs);
    }

    #[test]
    fn bad_option_values_name_the_option() {
        let args = Esp8266FlashArgs {
            flash_size: Some("4x".to_string()),
            flash_baud_rate: 230_400,
            spiffs_offset: "0xec000".to_string(),
            spiffs_size: "65536".to_string(),
            ..Default::default()
        };
        let err = args.into_opts().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(err.display_chain().contains("esp8266-flash-size"));
    }

    #[test]
    fn nonpositive_baud_falls_back_to_default() {
        let args = Esp8266FlashArgs {
            flash_baud_rate: 0,
            spiffs_offset: "0xec000".to_string(),
            spiffs_size: "65536".to_string(),
            ..Default::default()
        };
        assert_eq!(args.into_opts().unwrap().baud, DEFAULT_FLASH_BAUD);
    }

    #[test]
    fn image_specs_parse_types() {
        let bundle = FileBundle::from_specs(&[
            "0x0:boot.bin".to_string(),
            "0x7c000:sys_params:sys.bin".to_string(),
        ])
        .unwrap();

        let parts = bundle.parts();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].attrs["addr"], "0x0");
        assert!(!parts[0].attrs.contains_key("type"));
        assert_eq!(parts[1].attrs["type"], "sys_params");
    }
}
