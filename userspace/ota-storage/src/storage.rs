// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: OTA download storage: stream chunks into upgrade slots, arm the
//! bootloader, confirm images and report slot state
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (v1.0)
//! TEST_COVERAGE: Unit tests below + tests/ota_storage_host (raw/tar flows, slot state)
//!
//! Lifecycle of one download:
//!
//! ```text
//! init -> open -> write* -> close -> verify -> (reboot) -> image_validate
//! ```
//!
//! The first 512 bytes decide between a raw MCUboot image (secondary slot of
//! image 0) and a tarball routed per component via [`Untar`].

use core::mem;

use log::{debug, error, info, warn};
use semver::Version;
use thiserror::Error;

use crate::config::{ConfigError, ConfirmStrategy, EraseMode, StorageConfig};
use crate::flash::{FlashError, FlashMemory};
use crate::flash_map::{area_primary, area_secondary, AreaError, FlashArea, FlashMap};
use crate::image::{verify_sha256, AppInfo, ImageError, ImageHeader};
use crate::trailer::{BootTrailer, FlagState, MagicState, SwapType};
use crate::untar::{is_tar_header, FileInfo, TarCheck, Untar, UntarError, UntarSink, TAR_BLOCK_SIZE};

// ============================================================================
// Public types
// ============================================================================

/// Errors returned by the storage operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("storage init failed: {0}")]
    Init(#[source] FlashError),
    #[error("open storage failed: {0}")]
    OpenStorage(#[source] AreaError),
    #[error("read storage failed: {0}")]
    ReadStorage(String),
    #[error("write storage failed: {0}")]
    WriteStorage(String),
    #[error("close storage failed: context not open")]
    CloseStorage,
    #[error("verify failed: {0}")]
    Verify(String),
    #[error("no image info: {0}")]
    NoImageInfo(#[source] ImageError),
    #[error("{0}")]
    General(String),
}

pub type Result<T> = core::result::Result<T, StorageError>;

/// Bookkeeping for one download.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageContext {
    pub total_image_size: u32,
    pub total_bytes_written: u32,
    pub last_offset: u32,
    pub last_size: u32,
    /// Leave the new image in test mode; the app confirms after reboot.
    pub validate_after_reboot: bool,
    pub is_tar_archive: bool,
    /// 0-based image the download targets for verify/pending.
    pub image_id: u16,
    storage_loc: Option<FlashArea>,
}

impl StorageContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context whose download boots in test mode and waits for confirmation.
    pub fn test_mode() -> Self {
        Self { validate_after_reboot: true, ..Self::default() }
    }

    /// True between `open` and `close`.
    pub fn is_open(&self) -> bool {
        self.storage_loc.is_some()
    }

    fn record(&mut self, chunk: &ChunkInfo<'_>) {
        self.total_image_size = chunk.total_size;
        self.total_bytes_written = self.total_bytes_written.saturating_add(chunk.buffer.len() as u32);
        self.last_offset = chunk.offset;
        self.last_size = chunk.buffer.len() as u32;
    }
}

/// One chunk of the download stream.
#[derive(Debug, Clone, Copy)]
pub struct ChunkInfo<'a> {
    /// Offset of `buffer` within the whole download.
    pub offset: u32,
    pub buffer: &'a [u8],
    /// Size of the whole download, when known.
    pub total_size: u32,
}

/// Which slot of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SlotId {
    /// Running (active) slot.
    Primary = 0,
    /// Upgrade (inactive) slot.
    Secondary = 1,
}

impl SlotId {
    pub fn other(self) -> Self {
        match self {
            SlotId::Primary => SlotId::Secondary,
            SlotId::Secondary => SlotId::Primary,
        }
    }

    fn area_id(self, image: u8) -> u8 {
        match self {
            SlotId::Primary => area_primary(image),
            SlotId::Secondary => area_secondary(image),
        }
    }
}

/// State of a slot as seen by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SlotState {
    NoImage = 0,
    Active,
    Pending,
    Verifying,
    Inactive,
    Unknown,
}

// ============================================================================
// Internal state
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct SlotEraseInfo {
    image: u8,
    area: FlashArea,
    total_sectors: u32,
    erased_sectors: u32,
}

impl SlotEraseInfo {
    fn erased_complete(&self) -> bool {
        self.erased_sectors >= self.total_sectors
    }
}

/// First bytes of a download, held until a full tar block is available.
#[derive(Debug, Clone, Default)]
struct HeaderProbe {
    buf: Vec<u8>,
    checked: bool,
}

fn trailer<'m>(map: &'m FlashMap, config: &StorageConfig) -> BootTrailer<'m> {
    BootTrailer::new(map)
        .with_max_align(config.max_align)
        .with_encrypted_images(config.encrypted_images)
}

fn image_index(id: u16) -> Option<u8> {
    u8::try_from(id).ok()
}

/// Erases whole sectors of the slot until `end` is covered.
fn erase_ahead<F: FlashMemory>(
    flash: &mut F,
    map: &FlashMap,
    info: &mut SlotEraseInfo,
    sector: u32,
    end: u32,
) -> core::result::Result<(), AreaError> {
    while !info.erased_complete() && info.erased_sectors * sector < end {
        let off = info.erased_sectors * sector;
        let len = sector.min(info.area.size - off);
        info!("erase secondary slot image={} offset={:#010x} size={:#010x}", info.image, off, len);
        map.area_erase(flash, &info.area, off, len as usize)?;
        info.erased_sectors += 1;
    }
    Ok(())
}

/// Writes `data` at `offset` of the slot tracked by `info`, erasing lazily.
fn write_slot<F: FlashMemory>(
    flash: &mut F,
    map: &FlashMap,
    config: &StorageConfig,
    info: &mut SlotEraseInfo,
    offset: u32,
    data: &[u8],
) -> core::result::Result<(), AreaError> {
    let end = offset.checked_add(data.len() as u32).ok_or(AreaError::BadArgs)?;
    if config.erase_mode == EraseMode::Lazy {
        erase_ahead(flash, map, info, config.sector_size, end)?;
    }
    map.area_write(flash, &info.area, offset, data)
}

/// Routes tarball components into their secondary slots.
struct SlotSink<'a, F: FlashMemory> {
    flash: &'a mut F,
    map: &'a FlashMap,
    config: &'a StorageConfig,
    erase: &'a mut [SlotEraseInfo],
}

impl<F: FlashMemory> UntarSink for SlotSink<'_, F> {
    fn manifest(&mut self, version: &str, files: &[FileInfo]) -> core::result::Result<(), UntarError> {
        for file in files.iter().filter(|f| !f.is_manifest()) {
            if file.img_id > u16::from(self.map.image_count()) {
                return Err(UntarError::Rejected(format!(
                    "{:?} targets image {} but the layout has {}",
                    file.name,
                    file.img_id,
                    self.map.image_count()
                )));
            }
        }
        if let Some(minimum) = &self.config.minimum_version {
            let offered = Version::parse(version)
                .map_err(|err| UntarError::Rejected(format!("version {version:?}: {err}")))?;
            if offered <= *minimum {
                error!("OTA image version {} <= current {}, bail", offered, minimum);
                return Err(UntarError::Rejected(format!("version {offered} is not newer than {minimum}")));
            }
        }
        Ok(())
    }

    fn write(&mut self, file: &FileInfo, offset: u32, data: &[u8]) -> core::result::Result<(), UntarError> {
        let declared = file.size.unwrap_or(0);
        if offset >= declared {
            return Ok(());
        }
        let len = data.len().min((declared - offset) as usize);
        let image = (file.img_id - 1) as u8;
        let info = self
            .erase
            .iter_mut()
            .find(|e| e.image == image)
            .ok_or(AreaError::NotFound(area_secondary(image)))?;
        write_slot(self.flash, self.map, self.config, info, offset, &data[..len])?;
        Ok(())
    }
}

// ============================================================================
// Storage
// ============================================================================

/// OTA storage bound to one flash backend and layout.
#[derive(Debug)]
pub struct OtaStorage<F: FlashMemory> {
    flash: F,
    map: FlashMap,
    config: StorageConfig,
    erase: Vec<SlotEraseInfo>,
    probe: HeaderProbe,
    untar: Untar,
}

impl<F: FlashMemory> OtaStorage<F> {
    /// Binds `flash` to the layout described by `config`.
    pub fn new(flash: F, config: StorageConfig) -> core::result::Result<Self, ConfigError> {
        let map = config.flash_map()?;
        for area in map.iter() {
            debug!(
                "flash area id={} dev={:#04x} off={:#010x} size={:#010x}",
                area.id, area.device_id, area.offset, area.size
            );
        }
        Ok(Self { flash, map, config, erase: Vec::new(), probe: HeaderProbe::default(), untar: Untar::new() })
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    pub fn into_flash(self) -> F {
        self.flash
    }

    pub fn map(&self) -> &FlashMap {
        &self.map
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Extractor state of the current tarball download.
    pub fn untar(&self) -> &Untar {
        &self.untar
    }

    /// Brings up the memory backend.
    pub fn init(&mut self) -> Result<()> {
        debug!("storage init");
        self.flash.init().map_err(|err| {
            error!("memory init failed: {}", err);
            StorageError::Init(err)
        })
    }

    /// Prepares the secondary slots for a new download.
    pub fn open(&mut self, ctx: &mut StorageContext) -> Result<()> {
        debug!("storage open");
        ctx.total_image_size = 0;
        ctx.total_bytes_written = 0;
        ctx.last_offset = 0;
        ctx.last_size = 0;
        ctx.is_tar_archive = false;
        ctx.storage_loc = None;
        self.probe = HeaderProbe::default();
        self.untar = Untar::new();
        self.erase.clear();

        let sector = self.config.sector_size;
        for image in 0..self.map.image_count() {
            let area = self.map.open(area_secondary(image)).map_err(|err| {
                error!("flash area open failed for image {}: {}", image, err);
                StorageError::OpenStorage(err)
            })?;
            let mut info =
                SlotEraseInfo { image, area, total_sectors: area.size.div_ceil(sector), erased_sectors: 0 };
            if self.config.erase_mode == EraseMode::OnOpen {
                info!("erase secondary slot image={} off={:#010x} size={:#010x}", image, area.offset, area.size);
                self.map.area_erase(&mut self.flash, &area, 0, area.size as usize).map_err(|err| {
                    error!("erase of secondary slot {} failed: {}", image, err);
                    StorageError::OpenStorage(err)
                })?;
                info.erased_sectors = info.total_sectors;
            }
            self.erase.push(info);
        }

        let target = image_index(ctx.image_id)
            .map(area_secondary)
            .ok_or(StorageError::OpenStorage(AreaError::BadArgs))?;
        let area = self.map.open(target).map_err(StorageError::OpenStorage)?;
        ctx.storage_loc = Some(area);
        Ok(())
    }

    /// Reads back from the secondary slot opened by `open`.
    pub fn read(&self, ctx: &StorageContext, offset: u32, buf: &mut [u8]) -> Result<()> {
        debug!("storage read off={:#x} len={}", offset, buf.len());
        let area = ctx.storage_loc.ok_or_else(|| {
            error!("storage read: context not open");
            StorageError::ReadStorage("context not open".into())
        })?;
        self.map
            .area_read(&self.flash, &area, offset, buf)
            .map_err(|err| StorageError::ReadStorage(err.to_string()))
    }

    /// Stores the next chunk of the download.
    pub fn write(&mut self, ctx: &mut StorageContext, chunk: &ChunkInfo<'_>) -> Result<()> {
        debug!("storage write off={:#x} len={}", chunk.offset, chunk.buffer.len());
        if !ctx.is_open() {
            error!("storage write: context not open");
            return Err(StorageError::WriteStorage("context not open".into()));
        }
        if chunk.offset == 0 {
            self.probe = HeaderProbe::default();
            self.untar = Untar::new();
            ctx.is_tar_archive = false;
        }

        let mut data = chunk.buffer;
        let mut offset = chunk.offset;
        if !self.probe.checked {
            if chunk.offset == 0 && data.len() >= TAR_BLOCK_SIZE {
                ctx.is_tar_archive = is_tar_header(data) == TarCheck::Valid;
            } else {
                if offset as usize != self.probe.buf.len() {
                    error!("storage write: chunk at {:#x} while {} header bytes buffered", offset, self.probe.buf.len());
                    return Err(StorageError::WriteStorage("non-contiguous chunk before header check".into()));
                }
                let need = TAR_BLOCK_SIZE - self.probe.buf.len();
                if data.len() < need {
                    self.probe.buf.extend_from_slice(data);
                    ctx.record(chunk);
                    return Ok(());
                }
                self.probe.buf.extend_from_slice(&data[..need]);
                data = &data[need..];
                offset = TAR_BLOCK_SIZE as u32;
                ctx.is_tar_archive = is_tar_header(&self.probe.buf) == TarCheck::Valid;
            }
            self.probe.checked = true;
            info!("download is {}", if ctx.is_tar_archive { "a tar archive" } else { "a raw image" });
        }

        let header = mem::take(&mut self.probe.buf);
        let result = if ctx.is_tar_archive {
            self.write_tar(&header, data)
        } else {
            self.write_raw(&header, offset, data)
        };
        result.inspect_err(|err| error!("storage write failed at {:#x}: {}", chunk.offset, err))?;
        ctx.record(chunk);
        Ok(())
    }

    fn write_tar(&mut self, header: &[u8], data: &[u8]) -> Result<()> {
        let mut sink = SlotSink {
            flash: &mut self.flash,
            map: &self.map,
            config: &self.config,
            erase: &mut self.erase,
        };
        for part in [header, data] {
            let used = self
                .untar
                .feed(part, &mut sink)
                .map_err(|err| StorageError::WriteStorage(err.to_string()))?;
            if used < part.len() {
                warn!("ignoring {} bytes after end of archive", part.len() - used);
            }
        }
        Ok(())
    }

    fn write_raw(&mut self, header: &[u8], offset: u32, data: &[u8]) -> Result<()> {
        let info = self
            .erase
            .iter_mut()
            .find(|e| e.image == 0)
            .ok_or_else(|| StorageError::WriteStorage("secondary slot of image 0 not open".into()))?;
        if !header.is_empty() {
            write_slot(&mut self.flash, &self.map, &self.config, info, 0, header)
                .map_err(|err| StorageError::WriteStorage(err.to_string()))?;
        }
        write_slot(&mut self.flash, &self.map, &self.config, info, offset, data)
            .map_err(|err| StorageError::WriteStorage(err.to_string()))
    }

    /// Ends the download.
    pub fn close(&mut self, ctx: &mut StorageContext) -> Result<()> {
        debug!("storage close");
        if ctx.storage_loc.take().is_none() {
            error!("storage close: context not open");
            return Err(StorageError::CloseStorage);
        }
        Ok(())
    }

    /// Checks the downloaded image and arms the bootloader.
    pub fn verify(&mut self, ctx: &StorageContext) -> Result<()> {
        debug!("storage verify image={}", ctx.image_id);
        let image = image_index(ctx.image_id)
            .ok_or_else(|| StorageError::Verify(format!("image id {} out of range", ctx.image_id)))?;
        if self.config.verify_image_hash {
            let area = self
                .map
                .open(area_secondary(image))
                .map_err(|err| StorageError::Verify(err.to_string()))?;
            verify_sha256(&self.map, &self.flash, &area).map_err(|err| {
                error!("image hash check failed: {}", err);
                StorageError::Verify(err.to_string())
            })?;
        }
        self.arm(image, ctx)
    }

    /// Marks `app_id` pending without further checks.
    pub fn set_boot_pending(&mut self, app_id: u16, ctx: &StorageContext) -> Result<()> {
        debug!("storage set boot pending app={}", app_id);
        let image = image_index(app_id)
            .ok_or_else(|| StorageError::Verify(format!("image id {app_id} out of range")))?;
        self.arm(image, ctx)
    }

    fn arm(&mut self, image: u8, ctx: &StorageContext) -> Result<()> {
        trailer(&self.map, &self.config)
            .set_pending(&mut self.flash, image, !ctx.validate_after_reboot)
            .map_err(|err| {
                error!("set pending failed for image {}: {}", image, err);
                StorageError::Verify(err.to_string())
            })
    }

    /// Swap the bootloader will perform for `app_id`.
    pub fn get_boot_pending_status(&self, app_id: u16) -> Result<SwapType> {
        let image = image_index(app_id).ok_or_else(|| general(format!("image id {app_id} out of range")))?;
        let status = trailer(&self.map, &self.config).pending_status(&self.flash, image).map_err(|err| {
            error!("pending status failed: {}", err);
            general(err.to_string())
        })?;
        debug!("secondary slot boot pending status: {:?}", status);
        Ok(status)
    }

    /// Confirms the running image of `app_id`.
    pub fn image_validate(&mut self, app_id: u16) -> Result<()> {
        debug!("storage image validate app={}", app_id);
        let image = image_index(app_id).ok_or_else(|| general(format!("image id {app_id} out of range")))?;
        let trailer = trailer(&self.map, &self.config);
        let result = match self.config.confirm_strategy {
            ConfirmStrategy::SetConfirmed => trailer.set_confirmed(&mut self.flash, image),
            ConfirmStrategy::UnsetPending => trailer.unset_pending(&mut self.flash, image),
        };
        result.map_err(|err| {
            error!("image validate failed: {}", err);
            general(err.to_string())
        })
    }

    /// image_ok state of the primary slot of `app_id`.
    pub fn get_image_validate_status(&self, app_id: u16) -> Result<FlagState> {
        let image = image_index(app_id).ok_or_else(|| general(format!("image id {app_id} out of range")))?;
        let status = trailer(&self.map, &self.config).confirm_status(&self.flash, image).map_err(|err| {
            error!("confirm status failed: {}", err);
            general(err.to_string())
        })?;
        debug!("primary slot image validate status: {:?}", status);
        Ok(status)
    }

    fn slot_area(&self, slot: SlotId, image_num: u16) -> core::result::Result<FlashArea, AreaError> {
        let image = image_index(image_num).ok_or(AreaError::BadArgs)?;
        self.map.open(slot.area_id(image))
    }

    /// Version and vendor ids of the image in `slot`.
    pub fn get_app_info(&self, slot: SlotId, image_num: u16) -> Result<AppInfo> {
        debug!("storage get app info slot={:?} image={}", slot, image_num);
        let area = self.slot_area(slot, image_num).map_err(StorageError::OpenStorage)?;
        AppInfo::read(&self.map, &self.flash, &area, image_num).map_err(|err| {
            error!("app info for slot {:?} failed: {}", slot, err);
            match err {
                ImageError::NoImage => StorageError::NoImageInfo(err),
                other => StorageError::ReadStorage(other.to_string()),
            }
        })
    }

    /// Derives the state of `slot` from its header and trailer.
    pub fn get_slot_state(&self, slot: SlotId, image_num: u16) -> Result<SlotState> {
        let area = self.slot_area(slot, image_num).map_err(|err| general(err.to_string()))?;
        match ImageHeader::read(&self.map, &self.flash, &area) {
            Ok(_) => {}
            Err(ImageError::NoImage) => return Ok(SlotState::NoImage),
            Err(err) => return Err(general(err.to_string())),
        }
        let trailer = trailer(&self.map, &self.config);
        let magic = trailer.read_magic(&self.flash, &area).map_err(|err| general(err.to_string()))?;
        let state = match (slot, magic) {
            (SlotId::Primary, MagicState::Unset) => SlotState::Active,
            (SlotId::Primary, MagicState::Good) => {
                match trailer.read_image_ok(&self.flash, &area).map_err(|err| general(err.to_string()))? {
                    FlagState::Set => SlotState::Active,
                    FlagState::Bad | FlagState::Unset => SlotState::Verifying,
                }
            }
            (SlotId::Primary, MagicState::Bad) => SlotState::Unknown,
            (SlotId::Secondary, MagicState::Good) => SlotState::Pending,
            (SlotId::Secondary, MagicState::Bad | MagicState::Unset) => SlotState::Inactive,
        };
        debug!("slot {:?} image {} state {:?}", slot, image_num, state);
        Ok(state)
    }

    /// Changes the state of the inactive slot.
    pub fn set_slot_state(&mut self, slot: SlotId, image_num: u16, state: SlotState) -> Result<()> {
        debug!("storage set slot state slot={:?} image={} state={:?}", slot, image_num, state);
        if slot == SlotId::Primary {
            error!("requested state transition on the active slot is not allowed");
            return Err(general("active slot state cannot be changed".into()));
        }
        let current = self.get_slot_state(SlotId::Secondary, image_num)?;
        info!("slot {:?} current state {:?}", slot, current);
        let allowed = matches!(state, SlotState::NoImage | SlotState::Inactive | SlotState::Pending);
        if !allowed || current == SlotState::NoImage {
            error!("requested state transition {:?} -> {:?} not allowed", current, state);
            return Err(general(format!("transition {current:?} -> {state:?} not allowed")));
        }

        let image = image_index(image_num).ok_or_else(|| general(format!("image {image_num} out of range")))?;
        let trailer = trailer(&self.map, &self.config);
        let result = match state {
            SlotState::NoImage => {
                let area = self.map.open(area_secondary(image)).map_err(|err| general(err.to_string()))?;
                let sector = self.map.erase_size(&self.flash, &area).map_err(|err| general(err.to_string()))?;
                if sector == 0 {
                    return Err(general("device reports zero erase size".into()));
                }
                let len = (self.config.no_image_erase_len as usize).div_ceil(sector) * sector;
                let len = len.min(area.size as usize);
                info!("erase secondary slot header off={:#010x} size={:#010x}", area.offset, len);
                self.map.area_erase(&mut self.flash, &area, 0, len).map_err(Into::into)
            }
            SlotState::Inactive => trailer.unset_pending(&mut self.flash, image),
            _ => trailer.set_pending(&mut self.flash, image, false),
        };
        result.map_err(|err| {
            error!("set slot state failed: {}", err);
            general(err.to_string())
        })
    }
}

fn general(msg: String) -> StorageError {
    StorageError::General(msg)
}
