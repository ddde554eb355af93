//! DTR/RTS sequences for resetting the chip in and out of flashing mode
//!
//! On the common serial adapters RTS drives the reset line (inverted) and
//! DTR drives GPIO0 (inverted), so "RTS high" holds the chip in reset and
//! "DTR high" straps GPIO0 low.

use std::{thread::sleep, time::Duration};

use log::debug;

use crate::{error::Error, interface::Interface};

/// Time to keep GPIO0 strapped after releasing reset.
const DEFAULT_RESET_DELAY: u64 = 50; // ms
/// Strap time to use when the short delay did not get the ROM's attention.
const EXTRA_RESET_DELAY: u64 = 500; // ms

/// A strategy for resetting the chip into the ROM bootloader.
pub trait ResetStrategy {
    fn reset(&self, serial: &mut Interface) -> Result<(), Error>;

    fn set_dtr(&self, serial: &mut Interface, level: bool) -> Result<(), Error> {
        serial.write_data_terminal_ready(level)?;

        Ok(())
    }

    fn set_rts(&self, serial: &mut Interface, level: bool) -> Result<(), Error> {
        serial.write_request_to_send(level)?;

        Ok(())
    }
}

/// Classic reset sequence, sets DTR and RTS sequentially.
#[derive(Debug, Clone, Copy)]
pub struct ClassicReset {
    delay: u64,
}

impl ClassicReset {
    pub fn new(extra_delay: bool) -> Self {
        let delay = if extra_delay {
            EXTRA_RESET_DELAY
        } else {
            DEFAULT_RESET_DELAY
        };

        Self { delay }
    }
}

impl ResetStrategy for ClassicReset {
    fn reset(&self, serial: &mut Interface) -> Result<(), Error> {
        debug!(
            "Using classic reset strategy with delay of {}ms",
            self.delay
        );

        self.set_rts(serial, true)?; // EN = LOW, chip in reset
        self.set_dtr(serial, false)?; // GPIO0 = HIGH

        sleep(Duration::from_millis(100));

        self.set_rts(serial, false)?; // EN = HIGH, chip out of reset
        self.set_dtr(serial, true)?; // GPIO0 = LOW

        sleep(Duration::from_millis(self.delay));

        self.set_dtr(serial, false)?; // GPIO0 = HIGH, done

        Ok(())
    }
}

/// Pulse reset via RTS with GPIO0 released, so the chip boots into the
/// firmware rather than the ROM loader. Works only on setups that have the
/// control lines wired.
pub fn hard_reset(serial: &mut Interface) -> Result<(), Error> {
    debug!("Hard resetting into firmware");

    serial.write_data_terminal_ready(false)?; // GPIO0 = HIGH
    serial.write_request_to_send(true)?; // EN = LOW, chip in reset

    sleep(Duration::from_millis(100));

    serial.write_request_to_send(false)?; // EN = HIGH, chip out of reset

    Ok(())
}
