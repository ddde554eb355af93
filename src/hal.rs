//! Device-level facade over the ROM client
//!
//! A plain capability record rather than a chip-polymorphic interface: the
//! ESP8266 is the only chip this crate drives.

use log::info;

use crate::{
    connection::Connection,
    error::{Error, ResultExt},
    flasher::Flasher,
    interface::Interface,
    observer::Prompter,
};

/// An ESP8266 attached to a serial port.
pub struct Esp8266Hal {
    serial: Interface,
}

impl Esp8266Hal {
    pub fn new(serial: Interface) -> Self {
        Esp8266Hal { serial }
    }

    pub fn name(&self) -> &'static str {
        "ESP8266"
    }

    /// Check that a device in flashing mode is attached: connect to the
    /// ROM, read the MAC, then let user code boot on.
    pub fn probe(&mut self) -> Result<(), Error> {
        let mut connection = Connection::new(&mut self.serial, None);
        connection.connect()?;

        let mac = connection.read_mac()?;
        info!("MAC address: {}", format_mac(mac));

        connection.soft_reset().ok();

        Ok(())
    }

    /// The device's factory MAC address.
    pub fn mac(&mut self) -> Result<[u8; 6], Error> {
        let mut connection = Connection::new(&mut self.serial, None);
        connection.connect()?;
        let mac = connection.read_mac()?;
        connection.soft_reset().ok();
        Ok(mac)
    }

    /// Reboot into firmware. Connects to the ROM first, to make sure we
    /// actually control the device.
    pub fn reboot(&mut self) -> Result<(), Error> {
        let mut connection = Connection::new(&mut self.serial, None);
        connection
            .connect()
            .in_phase("failed to communicate to ROM")?;
        connection.reboot_into_firmware()
    }

    /// Hand the port over to a flashing session.
    pub fn into_flasher(self, prompter: Box<dyn Prompter + Send>) -> Flasher {
        Flasher::new(self.serial, prompter)
    }
}

/// `aa:bb:cc:dd:ee:ff`
pub fn format_mac(mac: [u8; 6]) -> String {
    mac.iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_formatting() {
        assert_eq!(
            format_mac([0x18, 0xFE, 0x34, 0x01, 0x02, 0xA3]),
            "18:fe:34:01:02:a3"
        );
    }
}
