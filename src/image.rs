//! The set of addressed images being flashed and its layout rules

use std::collections::BTreeMap;

use log::info;

use crate::{
    bundle::FirmwareBundle,
    error::Error,
    flash_params::parse_int,
};

/// Last 16K of flash are reserved for system params.
pub const SYSTEM_PARAMS_AREA_SIZE: u32 = 16 * 1024;
pub const SYSTEM_PARAMS_PART_TYPE: &str = "sys_params";

/// Magic byte opening every ESP8266 firmware image.
pub const FIRMWARE_MAGIC: u8 = 0xE9;

/// A blob bound to a flash offset.
#[derive(Debug, Clone)]
pub struct Image {
    pub addr: u32,
    pub data: Vec<u8>,
    pub part_type: Option<String>,
}

impl Image {
    pub fn end(&self) -> u32 {
        self.addr + self.data.len() as u32
    }

    pub fn is_sys_params(&self) -> bool {
        self.part_type.as_deref() == Some(SYSTEM_PARAMS_PART_TYPE)
    }
}

/// Images keyed by address; iteration is always in ascending address order,
/// which is what the overlap check, the write loop and the verify loop rely
/// on.
#[derive(Debug, Clone, Default)]
pub struct ImageSet {
    images: BTreeMap<u32, Image>,
}

impl ImageSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn insert(&mut self, image: Image) {
        self.images.insert(image.addr, image);
    }

    pub fn remove(&mut self, addr: u32) -> Option<Image> {
        self.images.remove(&addr)
    }

    pub fn get(&self, addr: u32) -> Option<&Image> {
        self.images.get(&addr)
    }

    pub fn get_mut(&mut self, addr: u32) -> Option<&mut Image> {
        self.images.get_mut(&addr)
    }

    pub fn contains(&self, addr: u32) -> bool {
        self.images.contains_key(&addr)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Image> {
        self.images.values()
    }

    /// Ingest every part of a firmware bundle. Each part must carry an
    /// integer `addr` attribute.
    pub fn load_bundle(&mut self, bundle: &dyn FirmwareBundle) -> Result<(), Error> {
        for part in bundle.parts() {
            let addr_attr = part
                .attrs
                .get("addr")
                .ok_or_else(|| Error::PartMissingAddress(part.name.clone()))?;
            let addr = parse_int(addr_attr).map_err(|_| Error::PartInvalidAddress {
                name: part.name.clone(),
                value: addr_attr.clone(),
            })?;
            let data = bundle.part_source(&part.name)?;
            info!("{}: {} @ {:#x}", part.name, data.len(), addr);
            self.insert(Image {
                addr,
                data,
                part_type: part.attrs.get("type").cloned(),
            });
        }
        Ok(())
    }

    /// Move the `sys_params` image, if any, to the tail of flash. Returns
    /// the old and new address when a move happened. There can be at most
    /// one such image.
    pub fn adjust_sys_params_location(&mut self, flash_size: u32) -> Option<(u32, u32)> {
        let target = flash_size - SYSTEM_PARAMS_AREA_SIZE;
        let current = self
            .images
            .values()
            .find(|image| image.is_sys_params())?
            .addr;
        if current == target {
            return None;
        }

        let mut image = self.images.remove(&current)?;
        image.addr = target;
        self.images.insert(target, image);
        Some((current, target))
    }

    /// Enforce the layout rules: sector alignment, flash bounds, the 0xE9
    /// magic at offset 0, the reserved system-params tail, and no overlaps.
    pub fn sanity_check(&self, flash_size: u32, sector_size: u32) -> Result<(), Error> {
        let params_begin = flash_size - SYSTEM_PARAMS_AREA_SIZE;

        let mut previous: Option<&Image> = None;
        for image in self.images.values() {
            let begin = image.addr;
            let end = image.end();

            if begin >= flash_size || end > flash_size {
                return Err(Error::ImageOutOfBounds {
                    addr: begin,
                    len: image.data.len(),
                    flash_size,
                });
            }
            if begin % sector_size != 0 {
                return Err(Error::ImageMisaligned {
                    addr: begin,
                    sector_size,
                });
            }
            if begin == 0 && !image.data.is_empty() && image.data[0] != FIRMWARE_MAGIC {
                return Err(Error::BadImageMagic);
            }

            let in_params_slot = begin == params_begin && image.is_sys_params();
            if !in_params_slot && begin < flash_size && end > params_begin {
                return Err(Error::SysParamsOverlap {
                    addr: begin,
                    area_size: SYSTEM_PARAMS_AREA_SIZE,
                    area_start: params_begin,
                });
            }

            if let Some(prev) = previous {
                // The map iterates in address order, so a pairwise check
                // suffices.
                if prev.end() > begin {
                    return Err(Error::ImagesOverlap {
                        first: prev.addr,
                        second: begin,
                    });
                }
            }
            previous = Some(image);
        }

        Ok(())
    }
}
