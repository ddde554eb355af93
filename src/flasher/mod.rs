//! Flash a multi-image firmware bundle to an ESP8266
//!
//! The [Flasher] struct is the top-level state machine of a flashing
//! session: connect to the ROM, upload the stub, negotiate the flash
//! geometry, validate and patch the image set, optionally merge the
//! device's SPIFFS filesystem and skip unchanged sectors, then write,
//! verify and reboot.

use std::{
    cmp, fs,
    path::PathBuf,
    sync::{Mutex, MutexGuard},
};

use log::{debug, error, info, warn};
use md5::{Digest, Md5};

use crate::{
    bundle::FirmwareBundle,
    connection::{Connection, DEFAULT_ROM_BAUD},
    error::{Error, ResultExt},
    flash_params::{self, FlashFrequency, FlashMode, FlashSize},
    fs::FilesystemMerger,
    image::ImageSet,
    interface::Interface,
    observer::{FlasherObserver, Prompter},
    stub::{FlashClient, StubClient, FLASH_BLOCK_SIZE, FLASH_SECTOR_SIZE},
};

/// Baud rate of the data channel once the stub is running.
pub const DEFAULT_FLASH_BAUD: u32 = 230_400;
pub const DEFAULT_SPIFFS_OFFSET: u32 = 0xEC000;
pub const DEFAULT_SPIFFS_SIZE: u32 = 65_536;

/// The params size table tops out at 32 Mbit, so the default header derived
/// for larger chips is clamped to this.
const MAX_DEFAULT_PARAMS_SIZE: u32 = 4 * 1024 * 1024;
/// Used when flash-size detection fails; small enough to be safe everywhere.
const FALLBACK_FLASH_SIZE: u32 = 512 * 1024;

const WIRING_MSG: &str = "Failed to talk to bootloader. Check the wiring of \
the reset and GPIO0 lines. Alternatively, put the device into flashing mode \
(GPIO0 = 0, reset) manually and retry now.";

/// Configuration of a flashing session.
#[derive(Debug, Clone)]
pub struct FlashOpts {
    /// Flash chip size in bytes; auto-detected when unset.
    pub flash_size: Option<u32>,
    /// Override for the 16-bit params word at bytes 2-3 of the image at 0x0.
    pub flash_params: Option<u16>,
    /// System path of an alternative serial port for the data channel.
    pub data_port: Option<String>,
    /// Baud rate used after the stub is loaded.
    pub baud: u32,
    /// Flash offset of the SPIFFS region.
    pub spiffs_offset: u32,
    /// Byte length of the SPIFFS region.
    pub spiffs_size: u32,
    /// Skip sectors whose content already matches.
    pub minimize_writes: bool,
    /// Whole-chip erase before writing.
    pub erase_chip: bool,
    /// Read the device filesystem and merge it into the bundled one.
    pub merge_fs: bool,
    /// If set, dump the raw pre-merge filesystem bytes here.
    pub dump_fs: Option<PathBuf>,
}

impl Default for FlashOpts {
    fn default() -> Self {
        FlashOpts {
            flash_size: None,
            flash_params: None,
            data_port: None,
            baud: DEFAULT_FLASH_BAUD,
            spiffs_offset: DEFAULT_SPIFFS_OFFSET,
            spiffs_size: DEFAULT_SPIFFS_SIZE,
            minimize_writes: true,
            erase_chip: false,
            merge_fs: false,
            dump_fs: None,
        }
    }
}

/// A flashing session bound to one serial port.
///
/// All public methods serialize on one internal lock; `run` holds it for the
/// whole session, so options cannot change mid-flash. Callers wanting to
/// flash several devices in parallel create one `Flasher` per port.
pub struct Flasher {
    state: Mutex<FlasherState>,
}

struct FlasherState {
    serial: Interface,
    prompter: Box<dyn Prompter + Send>,
    merger: Option<Box<dyn FilesystemMerger + Send>>,
    opts: FlashOpts,
    images: ImageSet,
}

impl Flasher {
    pub fn new(serial: Interface, prompter: Box<dyn Prompter + Send>) -> Self {
        Flasher {
            state: Mutex::new(FlasherState {
                serial,
                prompter,
                merger: None,
                opts: FlashOpts::default(),
                images: ImageSet::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FlasherState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Install the SPIFFS merge collaborator used by `merge_fs` sessions.
    pub fn set_fs_merger(&self, merger: Box<dyn FilesystemMerger + Send>) {
        self.lock().merger = Some(merger);
    }

    pub fn set_opts(&self, mut opts: FlashOpts) {
        if opts.baud == 0 {
            opts.baud = DEFAULT_FLASH_BAUD;
        }
        self.lock().opts = opts;
    }

    /// Materialize the image set from a firmware bundle.
    pub fn set_firmware(&self, bundle: &dyn FirmwareBundle) -> Result<(), Error> {
        self.lock().images.load_bundle(bundle)
    }

    /// Denominator for progress reporting: all image bytes, plus the SPIFFS
    /// region once more when a merge will re-read it.
    pub fn total_bytes(&self) -> u32 {
        let state = self.lock();
        total_bytes(&state.images, &state.opts)
    }

    /// Run the flashing session to completion, reporting through `observer`.
    pub fn run(&self, observer: &mut dyn FlasherObserver) {
        let mut state = self.lock();
        match run_locked(&mut state, observer) {
            Ok(()) => observer.done("All done!", true),
            Err(err) => observer.done(&err.display_chain(), false),
        }
    }
}

fn total_bytes(images: &ImageSet, opts: &FlashOpts) -> u32 {
    let mut total: u32 = images.iter().map(|image| image.data.len() as u32).sum();
    if opts.merge_fs && images.contains(opts.spiffs_offset) {
        total += opts.spiffs_size;
    }
    total
}

fn run_locked(state: &mut FlasherState, observer: &mut dyn FlasherObserver) -> Result<(), Error> {
    if state.images.is_empty() {
        return Err(Error::NoFirmware);
    }
    observer.progress(0);

    let data_port = open_data_port(state.opts.data_port.as_deref())
        .in_phase("failed to open flashing data port")?;

    let FlasherState {
        serial,
        prompter,
        merger,
        opts,
        images,
    } = state;
    let prompter: &dyn Prompter = prompter.as_ref();

    let mut connection = Connection::new(serial, data_port);

    observer.status("Connecting to ROM...", true);
    connect_with_prompt(prompter, || connection.connect())?;

    observer.status(&format!("Running flasher @ {}...", opts.baud), true);
    let mut client = StubClient::connect(&mut connection, opts.baud)
        .in_phase("Failed to run and communicate with flasher stub")?;

    let mut session = Session {
        client: &mut client,
        images,
        opts,
        prompter,
        merger: merger.as_deref().map(|m| m as &dyn FilesystemMerger),
        observer: &mut *observer,
        progress: 0,
        flash_size: 0,
    };
    session.run()?;

    observer.status("Flashing successful, booting firmware...", true);

    // Rebooting "properly" from software is not possible here: GPIO0 is
    // still strapped low, so any reset lands back in the ROM loader. The
    // stub's boot command jumps straight to the flash-loader routine, which
    // works without control lines but leaves the firmware unable to reboot
    // itself cleanly; the RTS pulse gives wired setups a real reset. Doing
    // both covers both kinds of setup.
    let boot = client.boot_firmware();
    drop(client);
    connection.reboot_into_firmware()?;
    boot
}

fn open_data_port(name: Option<&str>) -> Result<Option<Interface>, Error> {
    let Some(name) = name else {
        return Ok(None);
    };

    let ports = serialport::available_ports()?;
    if !ports.iter().any(|port| port.port_name == name) {
        return Err(Error::DataPortNotFound(name.to_string()));
    }

    Ok(Some(Interface::open(name, DEFAULT_ROM_BAUD)?))
}

/// Loop a connect attempt behind a retry/cancel prompt.
fn connect_with_prompt(
    prompter: &dyn Prompter,
    mut connect: impl FnMut() -> Result<(), Error>,
) -> Result<(), Error> {
    loop {
        match connect() {
            Ok(()) => return Ok(()),
            Err(err) => {
                error!("{}", err.display_chain());
                let msg = format!("{WIRING_MSG}\n\nError: {}", err.display_chain());
                let answer = prompter.prompt(&msg, &["Retry", "Cancel"]);
                if answer == 1 {
                    return Err(Error::BootloaderNotResponding);
                }
            }
        }
    }
}

/// The post-connect phases, generic over the stub so tests can script it.
struct Session<'a, C: FlashClient> {
    client: &'a mut C,
    images: &'a mut ImageSet,
    opts: &'a FlashOpts,
    prompter: &'a dyn Prompter,
    merger: Option<&'a dyn FilesystemMerger>,
    observer: &'a mut dyn FlasherObserver,
    progress: u32,
    flash_size: u32,
}

impl<C: FlashClient> Session<'_, C> {
    fn run(&mut self) -> Result<(), Error> {
        self.negotiate_size()?;
        self.validate()?;
        self.patch_header()?;
        self.merge_filesystem()?;

        let plan = if self.opts.erase_chip {
            self.observer.status("Erasing chip...", true);
            self.client.erase_chip()?;
            self.images.clone()
        } else if self.opts.minimize_writes {
            self.dedup()
        } else {
            self.images.clone()
        };

        self.write(&plan)?;
        self.verify().in_phase("verification failed")?;
        Ok(())
    }

    /// Settle on a flash size: explicit params win, then an explicit size,
    /// then the chip ID query, then the conservative fallback.
    fn negotiate_size(&mut self) -> Result<(), Error> {
        if let Some(params) = self.opts.flash_params {
            self.flash_size = flash_params::flash_size_from_params(params)?;
        } else if let Some(size) = self.opts.flash_size {
            self.flash_size = size;
        } else {
            info!("Detecting flash size...");
            match self.client.flash_chip_id() {
                Ok(chip_id) => {
                    let mfg = chip_id >> 24;
                    let chip_type = (chip_id >> 16) & 0xFF;
                    let capacity = (chip_id >> 8) & 0xFF;
                    info!("Flash chip ID: {mfg:#x} {chip_type:#x} {capacity:#x}");
                    // Capacity is the power of two.
                    if mfg != 0 && (0x13..0x20).contains(&capacity) {
                        self.flash_size = 1 << capacity;
                    }
                }
                Err(err) => warn!("Failed to read flash chip ID: {}", err.display_chain()),
            }
            if self.flash_size == 0 {
                warn!(
                    "Failed to detect flash size, defaulting to 512K. You may want to \
                     specify the size explicitly using the flash-size option."
                );
                self.flash_size = FALLBACK_FLASH_SIZE;
            } else {
                self.observer
                    .status(&format!("Detected flash size: {}", self.flash_size), true);
            }
        }
        info!("Flash size: {}", self.flash_size);
        Ok(())
    }

    fn validate(&mut self) -> Result<(), Error> {
        if let Some((from, to)) = self.images.adjust_sys_params_location(self.flash_size) {
            self.observer.status(
                &format!("Sys params image moved from {from:#x} to {to:#x}"),
                true,
            );
        }
        self.images.sanity_check(self.flash_size, FLASH_SECTOR_SIZE)
    }

    /// Write the flash-params word into the header of the image at 0x0.
    fn patch_header(&mut self) -> Result<(), Error> {
        if !matches!(self.images.get(0), Some(image) if image.data.len() >= 4) {
            return Ok(());
        }

        let params = match self.opts.flash_params {
            Some(params) => params,
            None => {
                // Detected size + DIO @ 40MHz is a safe default; users who
                // need other modes can override.
                let size = cmp::min(self.flash_size, MAX_DEFAULT_PARAMS_SIZE);
                flash_params::flash_params(
                    FlashMode::Dio,
                    FlashSize::from_detected(size)?,
                    FlashFrequency::Freq40M,
                )
            }
        };

        if let Some(image) = self.images.get_mut(0) {
            image.data[2] = (params >> 8) as u8;
            image.data[3] = params as u8;
        }
        self.observer
            .status(&format!("Setting flash params to {params:#06x}"), true);
        Ok(())
    }

    /// Read the live SPIFFS region, merge the bundled image into it, and
    /// substitute the result. A failure anywhere in the pipeline asks the
    /// user whether to cancel, write the bundled image, or keep the
    /// device's.
    fn merge_filesystem(&mut self) -> Result<(), Error> {
        if !self.opts.merge_fs {
            return Ok(());
        }
        info!(
            "SPIFFS params: {} @ {:#x}",
            self.opts.spiffs_size, self.opts.spiffs_offset
        );
        if !self.images.contains(self.opts.spiffs_offset) {
            info!("No SPIFFS image in new firmware");
            return Ok(());
        }

        let merged = self.merge_fs_image()?;
        if merged.is_empty() {
            self.images.remove(self.opts.spiffs_offset);
        } else if let Some(image) = self.images.get_mut(self.opts.spiffs_offset) {
            image.data = merged;
        }
        self.observer.status("Merged flash content", true);
        Ok(())
    }

    fn merge_fs_image(&mut self) -> Result<Vec<u8>, Error> {
        match self.try_merge() {
            Ok(merged) => Ok(merged),
            Err(err) => {
                let msg = format!(
                    "Failed to merge file system: {}\nWhat should we do?",
                    err.display_chain()
                );
                let answer = self
                    .prompter
                    .prompt(&msg, &["Cancel", "Write new", "Keep old"]);
                error!("{msg} -> {answer}");
                match answer {
                    1 => Ok(self
                        .images
                        .get(self.opts.spiffs_offset)
                        .map(|image| image.data.clone())
                        .unwrap_or_default()),
                    2 => Ok(Vec::new()),
                    _ => Err(err),
                }
            }
        }
    }

    fn try_merge(&mut self) -> Result<Vec<u8>, Error> {
        let (offset, size) = (self.opts.spiffs_offset, self.opts.spiffs_size);
        self.observer.status(
            &format!("Reading file system image ({size} @ {offset:#x})..."),
            true,
        );

        let base = self.progress;
        let Session {
            client, observer, ..
        } = self;
        let device_fs = client.read(offset, size, &mut |bytes| observer.progress(base + bytes))?;

        self.progress += size;
        self.observer.progress(self.progress);

        if let Some(path) = &self.opts.dump_fs {
            if let Err(err) = fs::write(path, &device_fs) {
                error!("Failed to write {}: {err}", path.display());
            }
        }

        let merger = self.merger.ok_or(Error::NoFilesystemMerger)?;
        let new_fs = self
            .images
            .get(offset)
            .map(|image| image.data.as_slice())
            .unwrap_or_default();
        merger.merge(&device_fs, new_fs)
    }

    /// Compare the image set against live flash, sector by sector, and keep
    /// only the runs of differing sectors. Returns the set of images to
    /// write.
    fn dedup(&mut self) -> ImageSet {
        self.observer.status("Deduping...", true);
        let sector = FLASH_SECTOR_SIZE as usize;

        let mut result = ImageSet::new();
        for image in self.images.iter() {
            let addr = image.addr;
            let data = &image.data;
            info!("Checksumming {} @ {:#x}...", data.len(), addr);

            let digests = match self.client.digest(addr, data.len() as u32, FLASH_SECTOR_SIZE) {
                Ok(digests) => digests,
                Err(err) => {
                    warn!("Error computing digest: {}", err.display_chain());
                    return self.images.clone();
                }
            };
            let num_sectors = data.len().div_ceil(sector);
            if digests.block_digests.len() < num_sectors {
                warn!(
                    "Short digest response ({} of {num_sectors} sectors)",
                    digests.block_digests.len()
                );
                return self.images.clone();
            }

            let mut pieces: Vec<crate::image::Image> = Vec::new();
            let mut run_start = addr;
            let mut run_len = 0usize;
            let mut new_size = 0usize;

            for i in 0..num_sectors {
                let offset = i * sector;
                let len = cmp::min(sector, data.len() - offset);
                let local = Md5::digest(&data[offset..offset + len]);
                if local.as_slice() == digests.block_digests[i].as_slice() {
                    // Sector already matches; flush the pending run, if any.
                    if run_len > 0 {
                        pieces.push(crate::image::Image {
                            addr: run_start,
                            data: data[(run_start - addr) as usize..][..run_len].to_vec(),
                            part_type: image.part_type.clone(),
                        });
                        run_len = 0;
                    }
                } else {
                    if run_len == 0 {
                        run_start = addr + offset as u32;
                    }
                    run_len += len;
                    new_size += len;
                }
            }
            if run_len > 0 {
                pieces.push(crate::image::Image {
                    addr: run_start,
                    data: data[(run_start - addr) as usize..][..run_len].to_vec(),
                    part_type: image.part_type.clone(),
                });
            }

            info!(
                "{:#x} was {} now {} diff {}",
                addr,
                data.len(),
                new_size,
                data.len() - new_size
            );
            // Fragmenting a large image has a price: erasing many individual
            // sectors is slower than erasing whole blocks. Keep the original
            // unless the difference is substantial.
            if data.len() - new_size >= FLASH_BLOCK_SIZE as usize {
                self.observer.status(
                    &format!("  {} @ {:#x} reduced to {}", data.len(), addr, new_size),
                    true,
                );
                for piece in pieces {
                    result.insert(piece);
                }
                // Credit the skipped sectors now; the retained runs are
                // credited as they are written. An image kept whole gets no
                // credit here, its full length is counted by the write.
                self.progress += (data.len() - new_size) as u32;
                self.observer.progress(self.progress);
            } else {
                result.insert(image.clone());
            }
        }

        debug!("After deduping: {} images", result.len());
        result
    }

    fn write(&mut self, plan: &ImageSet) -> Result<(), Error> {
        self.observer.status("Writing...", true);
        let sector = FLASH_SECTOR_SIZE as usize;

        for image in plan.iter() {
            self.observer.progress(self.progress);
            let orig_len = image.data.len() as u32;

            let mut data = image.data.clone();
            let tail = data.len() % sector;
            if tail != 0 {
                data.resize(data.len() + sector - tail, 0x00);
            }

            self.observer
                .status(&format!("  {} @ {:#x}...", data.len(), image.addr), true);

            let base = self.progress;
            let Session {
                client, observer, ..
            } = self;
            client
                .write(image.addr, &data, true, &mut |bytes| {
                    observer.progress(base + cmp::min(bytes, orig_len))
                })
                .map_err(|err| Error::WriteFailed {
                    addr: image.addr,
                    source: Box::new(err),
                })?;

            self.progress += orig_len;
        }
        Ok(())
    }

    /// Digest every image (the pre-write set, not the deduped one) on the
    /// device and compare against the local MD5.
    fn verify(&mut self) -> Result<(), Error> {
        self.observer.status("Verifying...", true);
        for image in self.images.iter() {
            let digests = self
                .client
                .digest(image.addr, image.data.len() as u32, 0)?;
            let local = Md5::digest(&image.data);
            debug!(
                "{:#x} {} {:02x?} {:02x?}",
                image.addr,
                image.data.len(),
                local.as_slice(),
                digests.digest
            );
            if local.as_slice() != digests.digest.as_slice() {
                return Err(Error::DigestMismatch { addr: image.addr });
            }
            self.observer.status(
                &format!("  {} @ {:#x} ok", image.data.len(), image.addr),
                true,
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::{
        error::ErrorKind,
        image::{Image, SYSTEM_PARAMS_AREA_SIZE, SYSTEM_PARAMS_PART_TYPE},
        stub::DigestResult,
    };

    const SECTOR: usize = FLASH_SECTOR_SIZE as usize;

    /// In-memory flash with scripted failure modes.
    struct ScriptedClient {
        flash: Vec<u8>,
        chip_id: Option<u32>,
        digest_error: bool,
        lie_digest_for: Option<u32>,
        writes: Vec<(u32, usize, bool)>,
        erased_chip: bool,
    }

    impl ScriptedClient {
        fn new(flash_size: usize) -> Self {
            ScriptedClient {
                flash: vec![0xFF; flash_size],
                chip_id: None,
                digest_error: false,
                lie_digest_for: None,
                writes: Vec::new(),
                erased_chip: false,
            }
        }

        /// mfg 0xC8, type 0x40, capacity 2^n bytes.
        fn with_chip(flash_size: usize, capacity: u32) -> Self {
            let mut client = Self::new(flash_size);
            client.chip_id = Some(0xC840_0000 | (capacity << 8));
            client
        }

        fn region(&self, addr: u32, len: usize) -> &[u8] {
            &self.flash[addr as usize..addr as usize + len]
        }

        fn seed(&mut self, addr: u32, data: &[u8]) {
            self.flash[addr as usize..addr as usize + data.len()].copy_from_slice(data);
        }
    }

    impl FlashClient for ScriptedClient {
        fn flash_chip_id(&mut self) -> Result<u32, Error> {
            self.chip_id
                .ok_or(Error::Connection(crate::error::ConnectionError::InvalidChipId))
        }

        fn read(
            &mut self,
            addr: u32,
            size: u32,
            progress: &mut dyn FnMut(u32),
        ) -> Result<Vec<u8>, Error> {
            progress(size);
            Ok(self.region(addr, size as usize).to_vec())
        }

        fn write(
            &mut self,
            addr: u32,
            data: &[u8],
            erase: bool,
            progress: &mut dyn FnMut(u32),
        ) -> Result<(), Error> {
            self.writes.push((addr, data.len(), erase));
            self.flash[addr as usize..addr as usize + data.len()].copy_from_slice(data);
            progress(data.len() as u32);
            Ok(())
        }

        fn erase_region(&mut self, addr: u32, size: u32) -> Result<(), Error> {
            self.flash[addr as usize..(addr + size) as usize].fill(0xFF);
            Ok(())
        }

        fn erase_chip(&mut self) -> Result<(), Error> {
            self.erased_chip = true;
            self.flash.fill(0xFF);
            Ok(())
        }

        fn digest(&mut self, addr: u32, size: u32, block_size: u32) -> Result<DigestResult, Error> {
            if self.digest_error {
                return Err(Error::Connection(
                    crate::error::ConnectionError::ConnectionFailed,
                ));
            }

            let range = self.region(addr, size as usize);
            let mut digest: [u8; 16] = Md5::digest(range).into();
            if block_size == 0 && self.lie_digest_for == Some(addr) {
                digest[0] ^= 0xFF;
            }

            let mut block_digests = Vec::new();
            if block_size > 0 {
                for chunk in range.chunks(block_size as usize) {
                    block_digests.push(Md5::digest(chunk).into());
                }
            }
            Ok(DigestResult {
                digest,
                block_digests,
            })
        }

        fn boot_firmware(&mut self) -> Result<(), Error> {
            Ok(())
        }
    }

    /// Asserts the ordering guarantees as it records.
    #[derive(Default)]
    struct Recorder {
        progress: Vec<u32>,
        statuses: Vec<String>,
        limit: Option<u32>,
    }

    impl FlasherObserver for Recorder {
        fn progress(&mut self, bytes: u32) {
            if let Some(last) = self.progress.last() {
                assert!(bytes >= *last, "progress went backwards: {last} -> {bytes}");
            }
            if let Some(limit) = self.limit {
                assert!(bytes <= limit, "progress {bytes} past total {limit}");
            }
            self.progress.push(bytes);
        }

        fn status(&mut self, message: &str, _persistent: bool) {
            self.statuses.push(message.to_string());
        }

        fn done(&mut self, _message: &str, _ok: bool) {}
    }

    struct CannedPrompter {
        answer: usize,
        prompts: std::cell::RefCell<Vec<String>>,
    }

    impl CannedPrompter {
        fn new(answer: usize) -> Self {
            CannedPrompter {
                answer,
                prompts: Default::default(),
            }
        }
    }

    impl Prompter for CannedPrompter {
        fn prompt(&self, message: &str, _choices: &[&str]) -> usize {
            self.prompts.borrow_mut().push(message.to_string());
            self.answer
        }
    }

    struct ConcatMerger;

    impl FilesystemMerger for ConcatMerger {
        fn merge(&self, device: &[u8], new: &[u8]) -> Result<Vec<u8>, Error> {
            // Keep the device bytes wherever the new image has none; real
            // merges are file-level, size-preserving is all that matters
            // here.
            let mut merged = device.to_vec();
            merged[..new.len() / 2].copy_from_slice(&new[..new.len() / 2]);
            Ok(merged)
        }
    }

    struct FailingMerger;

    impl FilesystemMerger for FailingMerger {
        fn merge(&self, _device: &[u8], _new: &[u8]) -> Result<Vec<u8>, Error> {
            Err(Error::NoFilesystemMerger)
        }
    }

    fn boot_image(len: usize) -> Image {
        let mut data = vec![0x11; len];
        data[0] = 0xE9;
        Image {
            addr: 0,
            data,
            part_type: None,
        }
    }

    fn image(addr: u32, len: usize, fill: u8) -> Image {
        Image {
            addr,
            data: vec![fill; len],
            part_type: None,
        }
    }

    fn sys_params_image(addr: u32) -> Image {
        Image {
            addr,
            data: vec![0x5A; SYSTEM_PARAMS_AREA_SIZE as usize],
            part_type: Some(SYSTEM_PARAMS_PART_TYPE.to_string()),
        }
    }

    fn image_set(images: impl IntoIterator<Item = Image>) -> ImageSet {
        let mut set = ImageSet::new();
        for image in images {
            set.insert(image);
        }
        set
    }

    fn run_session(
        client: &mut ScriptedClient,
        images: &mut ImageSet,
        opts: &FlashOpts,
        prompter: &CannedPrompter,
        merger: Option<&dyn FilesystemMerger>,
        observer: &mut Recorder,
    ) -> Result<(), Error> {
        let mut session = Session {
            client,
            images,
            opts,
            prompter,
            merger,
            observer,
            progress: 0,
            flash_size: 0,
        };
        session.run()
    }

    #[test]
    fn fresh_flash_with_auto_detected_size() {
        // 4 MiB chip: capacity id 0x16.
        let mut client = ScriptedClient::with_chip(4 * 1024 * 1024, 0x16);
        let mut images = image_set([
            boot_image(8 * 1024),
            image(0x10000, 256 * 1024, 0x22),
            sys_params_image(0x7C000),
        ]);
        let opts = FlashOpts::default();
        let total = total_bytes(&images, &opts);
        assert_eq!(total, (8 + 256 + 16) * 1024);

        let prompter = CannedPrompter::new(0);
        let mut observer = Recorder {
            limit: Some(total),
            ..Default::default()
        };

        run_session(&mut client, &mut images, &opts, &prompter, None, &mut observer).unwrap();

        // sys_params relocated to the tail of the detected 4 MiB flash
        assert!(images.contains(0x3FC000));
        assert!(!images.contains(0x7C000));
        assert!(observer
            .statuses
            .iter()
            .any(|s| s.contains("moved from 0x7c000 to 0x3fc000")));

        // all three images written, ascending, with erase
        let addrs: Vec<u32> = client.writes.iter().map(|(addr, ..)| *addr).collect();
        assert_eq!(addrs, vec![0x0, 0x10000, 0x3FC000]);
        assert!(client.writes.iter().all(|(_, _, erase)| *erase));

        // header patched with dio,4m->32m,40m; high byte at 2, low at 3
        let params = flash_params::flash_params_from_str("dio,32m,40m").unwrap();
        let boot = images.get(0).unwrap();
        assert_eq!(boot.data[2], (params >> 8) as u8);
        assert_eq!(boot.data[3], params as u8);

        // verified content landed in flash; progress ran to the total
        assert_eq!(client.region(0x10000, 256 * 1024), images.get(0x10000).unwrap().data);
        assert_eq!(observer.progress.last(), Some(&total));
    }

    #[test]
    fn numeric_params_override_drives_size_and_header() {
        let mut client = ScriptedClient::new(1024 * 1024);
        // No chip ID scripted: detection would fail, proving it is skipped.
        let mut images = image_set([
            boot_image(8 * 1024),
            image(0x10000, 256 * 1024, 0x22),
            sys_params_image(0x7C000),
        ]);
        let opts = FlashOpts {
            flash_params: Some(0x0220),
            ..Default::default()
        };

        let prompter = CannedPrompter::new(0);
        let mut observer = Recorder::default();

        run_session(&mut client, &mut images, &opts, &prompter, None, &mut observer).unwrap();

        // flashSizeFromParams(0x0220) = 1 MiB, so sys_params lands at 0xFC000
        assert!(images.contains(0xFC000));

        let boot = images.get(0).unwrap();
        assert_eq!(boot.data[2], 0x02);
        assert_eq!(boot.data[3], 0x20);
    }

    #[test]
    fn rejects_layout_that_outgrows_params_size() {
        let mut client = ScriptedClient::new(1024 * 1024);
        // 1 MiB via params, but the app ends past the reserved tail.
        let mut images = image_set([
            boot_image(8 * 1024),
            image(0xF0000, 128 * 1024, 0x22),
        ]);
        let opts = FlashOpts {
            flash_params: Some(0x0220),
            ..Default::default()
        };

        let prompter = CannedPrompter::new(0);
        let mut observer = Recorder::default();

        let err = run_session(&mut client, &mut images, &opts, &prompter, None, &mut observer)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(client.writes.is_empty());
    }

    #[test]
    fn merge_preserves_device_filesystem() {
        let mut client = ScriptedClient::with_chip(4 * 1024 * 1024, 0x16);
        let device_fs = vec![0xC3; DEFAULT_SPIFFS_SIZE as usize];
        client.seed(DEFAULT_SPIFFS_OFFSET, &device_fs);

        let new_fs = image(DEFAULT_SPIFFS_OFFSET, DEFAULT_SPIFFS_SIZE as usize, 0x3C);
        let mut images = image_set([boot_image(4 * 1024), new_fs.clone()]);
        let opts = FlashOpts {
            merge_fs: true,
            minimize_writes: false,
            ..Default::default()
        };

        let total = total_bytes(&images, &opts);
        assert_eq!(
            total,
            4 * 1024 + DEFAULT_SPIFFS_SIZE + DEFAULT_SPIFFS_SIZE,
            "the merged region is accounted once more for the read-back"
        );

        let prompter = CannedPrompter::new(0);
        let mut observer = Recorder {
            limit: Some(total),
            ..Default::default()
        };

        run_session(
            &mut client,
            &mut images,
            &opts,
            &prompter,
            Some(&ConcatMerger),
            &mut observer,
        )
        .unwrap();

        // the written region is the merger's output: new front half, device
        // back half
        let half = DEFAULT_SPIFFS_SIZE as usize / 2;
        let written = client.region(DEFAULT_SPIFFS_OFFSET, DEFAULT_SPIFFS_SIZE as usize);
        assert!(written[..half].iter().all(|b| *b == 0x3C));
        assert!(written[half..].iter().all(|b| *b == 0xC3));

        assert_eq!(observer.progress.last(), Some(&total));
        assert!(prompter.prompts.borrow().is_empty());
    }

    #[test]
    fn merge_failure_keep_old_skips_the_image() {
        let mut client = ScriptedClient::with_chip(4 * 1024 * 1024, 0x16);
        let mut images = image_set([
            boot_image(4 * 1024),
            image(DEFAULT_SPIFFS_OFFSET, DEFAULT_SPIFFS_SIZE as usize, 0x3C),
        ]);
        let opts = FlashOpts {
            merge_fs: true,
            minimize_writes: false,
            ..Default::default()
        };

        let prompter = CannedPrompter::new(2); // Keep old
        let mut observer = Recorder::default();

        run_session(
            &mut client,
            &mut images,
            &opts,
            &prompter,
            Some(&FailingMerger),
            &mut observer,
        )
        .unwrap();

        assert!(!images.contains(DEFAULT_SPIFFS_OFFSET));
        assert_eq!(client.writes.len(), 1, "only the boot image is written");
        assert_eq!(prompter.prompts.borrow().len(), 1);
    }

    #[test]
    fn merge_failure_write_new_flashes_bundled_image() {
        let mut client = ScriptedClient::with_chip(4 * 1024 * 1024, 0x16);
        let mut images = image_set([image(
            DEFAULT_SPIFFS_OFFSET,
            DEFAULT_SPIFFS_SIZE as usize,
            0x3C,
        )]);
        let opts = FlashOpts {
            merge_fs: true,
            minimize_writes: false,
            ..Default::default()
        };

        let prompter = CannedPrompter::new(1); // Write new
        let mut observer = Recorder::default();

        run_session(
            &mut client,
            &mut images,
            &opts,
            &prompter,
            Some(&FailingMerger),
            &mut observer,
        )
        .unwrap();

        assert!(client
            .region(DEFAULT_SPIFFS_OFFSET, DEFAULT_SPIFFS_SIZE as usize)
            .iter()
            .all(|b| *b == 0x3C));
    }

    #[test]
    fn merge_failure_cancel_aborts_session() {
        let mut client = ScriptedClient::with_chip(4 * 1024 * 1024, 0x16);
        let mut images = image_set([image(
            DEFAULT_SPIFFS_OFFSET,
            DEFAULT_SPIFFS_SIZE as usize,
            0x3C,
        )]);
        let opts = FlashOpts {
            merge_fs: true,
            ..Default::default()
        };

        let prompter = CannedPrompter::new(0); // Cancel
        let mut observer = Recorder::default();

        let err = run_session(
            &mut client,
            &mut images,
            &opts,
            &prompter,
            Some(&FailingMerger),
            &mut observer,
        )
        .unwrap_err();

        assert!(client.writes.is_empty());
        assert_eq!(err.kind(), ErrorKind::FailedPrecondition);
    }

    #[test]
    fn dedup_below_threshold_keeps_image_whole() {
        // 64 KiB image, one 4 KiB sector differs: saved 60 KiB < 64 KiB.
        let mut client = ScriptedClient::with_chip(4 * 1024 * 1024, 0x16);
        let mut images = image_set([image(0x10000, 64 * 1024, 0x22)]);
        client.seed(0x10000, &images.get(0x10000).unwrap().data);
        client.flash[0x13000] ^= 0xFF;

        let opts = FlashOpts::default();
        let total = total_bytes(&images, &opts);
        let prompter = CannedPrompter::new(0);
        let mut observer = Recorder {
            limit: Some(total),
            ..Default::default()
        };

        run_session(&mut client, &mut images, &opts, &prompter, None, &mut observer).unwrap();

        assert_eq!(client.writes.len(), 1);
        assert_eq!(client.writes[0], (0x10000, 64 * 1024, true));
        assert_eq!(observer.progress.last(), Some(&total));
    }

    #[test]
    fn dedup_above_threshold_writes_only_changed_sectors() {
        // 256 KiB image, one 4 KiB sector differs: saved 252 KiB >= 64 KiB.
        let mut client = ScriptedClient::with_chip(4 * 1024 * 1024, 0x16);
        let mut images = image_set([image(0x10000, 256 * 1024, 0x22)]);
        client.seed(0x10000, &images.get(0x10000).unwrap().data);
        client.flash[0x14000] ^= 0xFF;

        let opts = FlashOpts::default();
        let total = total_bytes(&images, &opts);
        let prompter = CannedPrompter::new(0);
        let mut observer = Recorder {
            limit: Some(total),
            ..Default::default()
        };

        run_session(&mut client, &mut images, &opts, &prompter, None, &mut observer).unwrap();

        assert_eq!(client.writes.len(), 1);
        assert_eq!(client.writes[0], (0x14000, SECTOR, true));
        // skipped sectors still match the image, so verify passed and the
        // progress counter absorbed them up front
        assert_eq!(client.region(0x10000, 256 * 1024), images.get(0x10000).unwrap().data);
        assert_eq!(observer.progress.last(), Some(&total));
    }

    #[test]
    fn dedup_disabled_writes_everything() {
        let mut client = ScriptedClient::with_chip(4 * 1024 * 1024, 0x16);
        let mut images = image_set([image(0x10000, 64 * 1024, 0x22)]);
        client.seed(0x10000, &images.get(0x10000).unwrap().data);

        let opts = FlashOpts {
            minimize_writes: false,
            ..Default::default()
        };
        let prompter = CannedPrompter::new(0);
        let mut observer = Recorder::default();

        run_session(&mut client, &mut images, &opts, &prompter, None, &mut observer).unwrap();

        // identical content, but dedup is off, so it is written anyway
        assert_eq!(client.writes.len(), 1);
    }

    #[test]
    fn dedup_error_falls_back_to_full_writes() {
        let mut client = ScriptedClient::with_chip(4 * 1024 * 1024, 0x16);
        client.digest_error = true;
        let mut images = image_set([image(0x10000, 64 * 1024, 0x22)]);

        let opts = FlashOpts::default();
        let prompter = CannedPrompter::new(0);
        let mut observer = Recorder::default();

        // digest failures abort verification, so only check the dedup output
        let mut session = Session {
            client: &mut client,
            images: &mut images,
            opts: &opts,
            prompter: &prompter,
            merger: None,
            observer: &mut observer,
            progress: 0,
            flash_size: 4 * 1024 * 1024,
        };
        let plan = session.dedup();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.get(0x10000).unwrap().data.len(), 64 * 1024);
    }

    #[test]
    fn erase_chip_skips_dedup() {
        let mut client = ScriptedClient::with_chip(4 * 1024 * 1024, 0x16);
        let mut images = image_set([image(0x10000, 64 * 1024, 0x22)]);
        client.seed(0x10000, &images.get(0x10000).unwrap().data);

        let opts = FlashOpts {
            erase_chip: true,
            ..Default::default()
        };
        let prompter = CannedPrompter::new(0);
        let mut observer = Recorder::default();

        run_session(&mut client, &mut images, &opts, &prompter, None, &mut observer).unwrap();

        assert!(client.erased_chip);
        // identical content was rewritten: the erase wiped it
        assert_eq!(client.writes.len(), 1);
    }

    #[test]
    fn verification_failure_names_the_address() {
        let mut client = ScriptedClient::with_chip(4 * 1024 * 1024, 0x16);
        client.lie_digest_for = Some(0x10000);
        let mut images = image_set([
            boot_image(8 * 1024),
            image(0x10000, 64 * 1024, 0x22),
        ]);

        let opts = FlashOpts::default();
        let prompter = CannedPrompter::new(0);
        let mut observer = Recorder::default();

        let err = run_session(&mut client, &mut images, &opts, &prompter, None, &mut observer)
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::DataLoss);
        assert!(err.display_chain().contains("0x10000"));
        assert!(!client.writes.is_empty(), "failure happened after writing");
    }

    #[test]
    fn connect_cancel_reports_bootloader_failure() {
        let prompter = CannedPrompter::new(1); // Cancel
        let err = connect_with_prompt(&prompter, || {
            Err(Error::Connection(
                crate::error::ConnectionError::ConnectionFailed,
            ))
        })
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Unavailable);
        assert_eq!(err.to_string(), "Failed to talk to bootloader.");
        assert_eq!(prompter.prompts.borrow().len(), 1);
    }

    #[test]
    fn connect_retry_loops_until_success() {
        let prompter = CannedPrompter::new(0); // Retry
        let mut attempts = 0;
        connect_with_prompt(&prompter, || {
            attempts += 1;
            if attempts < 3 {
                Err(Error::Connection(
                    crate::error::ConnectionError::ConnectionFailed,
                ))
            } else {
                Ok(())
            }
        })
        .unwrap();

        assert_eq!(attempts, 3);
        assert_eq!(prompter.prompts.borrow().len(), 2);
    }

    #[test]
    fn empty_session_is_a_failed_precondition() {
        assert_eq!(Error::NoFirmware.kind(), ErrorKind::FailedPrecondition);
        assert_eq!(Error::NoFirmware.to_string(), "No firmware loaded");
    }

    #[test]
    fn total_bytes_counts_fs_region_once_without_merge() {
        let images = image_set([
            boot_image(4 * 1024),
            image(DEFAULT_SPIFFS_OFFSET, DEFAULT_SPIFFS_SIZE as usize, 0x3C),
        ]);

        let plain = FlashOpts::default();
        assert_eq!(total_bytes(&images, &plain), 4 * 1024 + DEFAULT_SPIFFS_SIZE);

        let merge = FlashOpts {
            merge_fs: true,
            ..Default::default()
        };
        assert_eq!(
            total_bytes(&images, &merge),
            4 * 1024 + 2 * DEFAULT_SPIFFS_SIZE
        );

        // merge enabled but no image at the offset: nothing extra
        let no_fs = image_set([boot_image(4 * 1024)]);
        assert_eq!(total_bytes(&no_fs, &merge), 4 * 1024);
    }

    #[test]
    fn size_detection_falls_back_to_512k() {
        let mut client = ScriptedClient::new(4 * 1024 * 1024); // no chip id
        let mut images = image_set([boot_image(8 * 1024)]);

        let opts = FlashOpts::default();
        let prompter = CannedPrompter::new(0);
        let mut observer = Recorder::default();

        let mut session = Session {
            client: &mut client,
            images: &mut images,
            opts: &opts,
            prompter: &prompter,
            merger: None,
            observer: &mut observer,
            progress: 0,
            flash_size: 0,
        };
        session.negotiate_size().unwrap();
        assert_eq!(session.flash_size, FALLBACK_FLASH_SIZE);
    }
}
