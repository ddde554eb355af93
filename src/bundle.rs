//! Interface to the firmware-bundle reader
//!
//! Bundle parsing lives outside this crate; the flasher only needs to
//! enumerate the parts and pull their payloads.

use std::collections::HashMap;

use crate::error::Error;

/// One part of a firmware bundle: a named blob plus its attributes.
///
/// The flasher consumes the `addr` attribute (flash offset, any C-style
/// radix) and recognizes `type` (the value `sys_params` is special); other
/// attributes pass through untouched.
#[derive(Debug, Clone)]
pub struct Part {
    pub name: String,
    pub attrs: HashMap<String, String>,
}

/// A multi-image firmware bundle.
pub trait FirmwareBundle {
    /// All parts of the bundle.
    fn parts(&self) -> Vec<Part>;

    /// The payload of the named part.
    fn part_source(&self, name: &str) -> Result<Vec<u8>, Error>;
}
