//! The embedded flasher stub and its upload into IRAM

use base64::{engine::general_purpose, Engine as _};
use log::debug;
use serde::Deserialize;

use crate::{
    command::{Command, CommandType, RAM_BLOCK_SIZE},
    connection::Connection,
    error::Error,
};

// Stub object included in the binary
const STUB_8266: &str = include_str!("../../resources/stubs/stub_flasher_8266.json");

/// Flasher stub image (deserialized from JSON)
#[derive(Debug, Clone, Deserialize)]
pub struct FlashStub {
    /// Entry point (address)
    entry: u32,
    /// Text (base64 encoded)
    text: String,
    /// Start of text section address
    text_start: u32,
    /// Data (base64 encoded)
    data: String,
    /// Start of data section address
    data_start: u32,
    /// Address of the parameter block read by the stub at startup
    params_start: u32,
}

impl FlashStub {
    /// The ESP8266 stub shipped with this crate.
    pub fn esp8266() -> FlashStub {
        serde_json::from_str(STUB_8266).unwrap()
    }

    /// Stub entry point.
    pub fn entry(&self) -> u32 {
        self.entry
    }

    fn text(&self) -> (u32, Vec<u8>) {
        let text = general_purpose::STANDARD.decode(&self.text).unwrap();
        (self.text_start, text)
    }

    fn data(&self) -> (u32, Vec<u8>) {
        let data = general_purpose::STANDARD.decode(&self.data).unwrap();
        (self.data_start, data)
    }

    /// Upload the stub into IRAM and start it, placing `params` at the
    /// stub's parameter block first.
    pub(crate) fn upload(
        &self,
        connection: &mut Connection<'_>,
        params: &[u32],
    ) -> Result<(), Error> {
        let (text_addr, text) = self.text();
        debug!("Write {} byte stub text", text.len());
        write_ram_segment(connection, text_addr, &text)?;

        let (data_addr, data) = self.data();
        if !data.is_empty() {
            debug!("Write {} byte stub data", data.len());
            write_ram_segment(connection, data_addr, &data)?;
        }

        if !params.is_empty() {
            let bytes: Vec<u8> = params.iter().flat_map(|p| p.to_le_bytes()).collect();
            write_ram_segment(connection, self.params_start, &bytes)?;
        }

        debug!("Starting stub at {:#010x}", self.entry);
        connection.with_timeout(CommandType::MemEnd.timeout(), |connection| {
            connection.command(Command::MemEnd {
                no_entry: false,
                entry: self.entry,
            })
        })?;

        Ok(())
    }
}

fn write_ram_segment(
    connection: &mut Connection<'_>,
    addr: u32,
    data: &[u8],
) -> Result<(), Error> {
    let padding = 4 - data.len() % 4;
    let block_count = (data.len() + padding).div_ceil(RAM_BLOCK_SIZE);

    connection.command(Command::MemBegin {
        size: data.len() as u32,
        blocks: block_count as u32,
        block_size: RAM_BLOCK_SIZE as u32,
        offset: addr,
    })?;

    for (i, block) in data.chunks(RAM_BLOCK_SIZE).enumerate() {
        connection.command(Command::MemData {
            data: block,
            pad_to: 4,
            pad_byte: 0,
            sequence: i as u32,
        })?;
    }

    Ok(())
}
