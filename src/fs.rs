//! Interface to the SPIFFS merge collaborator

use crate::error::Error;

/// Merges a freshly-bundled filesystem image into the one read back from
/// the device.
///
/// The contract: treat both inputs as SPIFFS images of the same geometry,
/// overwrite in the device image every file the new image carries, preserve
/// files that exist only on the device, and return a merged image of the
/// same size.
pub trait FilesystemMerger {
    fn merge(&self, device: &[u8], new: &[u8]) -> Result<Vec<u8>, Error>;
}
