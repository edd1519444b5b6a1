// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: MCUboot image trailer fields and boot flags (pending/confirmed)
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (v1.0)
//! TEST_COVERAGE: Unit tests below + tests/ota_storage_host/tests/boot_flags.rs
//!
//! Trailer layout, measured back from the end of a slot:
//!
//! ```text
//! swap_info (8) | copy_done (8) | image_ok (8) | magic (16) | <end>
//! ```

use log::{debug, error};
use thiserror::Error;

use crate::flash::FlashMemory;
use crate::flash_map::{area_primary, area_secondary, AreaError, FlashArea, FlashMap};

// ============================================================================
// Layout
// ============================================================================

/// Boot magic as four little-endian words.
pub const BOOT_MAGIC_WORDS: [u32; 4] = [0xf395_c277, 0x7fef_d260, 0x0f50_5235, 0x8079_b62c];

/// Boot magic length in bytes.
pub const BOOT_MAGIC_SZ: usize = 16;

/// Slot size reserved per one-byte trailer field.
pub const TRAILER_ALIGN: u32 = 8;

/// Value written to a flag to mark it set.
pub const FLAG_SET: u8 = 0x01;

/// Default upper bound on the device write alignment.
pub const DEFAULT_MAX_ALIGN: usize = 8;

const TRAILER_MIN_SIZE: u32 = BOOT_MAGIC_SZ as u32 + 3 * TRAILER_ALIGN;

/// Boot magic bytes as they appear in flash.
pub fn boot_magic() -> [u8; BOOT_MAGIC_SZ] {
    let mut out = [0u8; BOOT_MAGIC_SZ];
    for (chunk, word) in out.chunks_exact_mut(4).zip(BOOT_MAGIC_WORDS) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    out
}

/// Offset of the magic within an area of `size` bytes.
pub const fn magic_off(size: u32) -> u32 {
    size - BOOT_MAGIC_SZ as u32
}

/// Offset of the image_ok flag.
pub const fn image_ok_off(size: u32) -> u32 {
    magic_off(size) - TRAILER_ALIGN
}

/// Offset of the copy_done flag.
pub const fn copy_done_off(size: u32) -> u32 {
    image_ok_off(size) - TRAILER_ALIGN
}

/// Offset of the swap_info byte.
pub const fn swap_info_off(size: u32) -> u32 {
    copy_done_off(size) - TRAILER_ALIGN
}

// ============================================================================
// States
// ============================================================================

/// Swap the bootloader performs on next reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SwapType {
    None = 1,
    Test = 2,
    Perm = 3,
    Revert = 4,
    Fail = 5,
    Panic = 0xff,
}

impl SwapType {
    /// Decodes the low nibble of a swap_info byte.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::None),
            2 => Some(Self::Test),
            3 => Some(Self::Perm),
            4 => Some(Self::Revert),
            5 => Some(Self::Fail),
            0xff => Some(Self::Panic),
            _ => None,
        }
    }
}

/// State of the boot magic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MagicState {
    Good = 1,
    Bad = 2,
    Unset = 3,
}

/// State of a one-byte trailer flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FlagState {
    Set = 1,
    Bad = 2,
    Unset = 3,
}

/// Packs image number and swap type into a swap_info byte.
pub fn swap_info(image: u8, swap: SwapType) -> Result<u8> {
    let ty = swap as u8;
    if image >= 0xf || ty >= 0xf {
        return Err(TrailerError::InvalidSwapInfo { image, swap: ty });
    }
    Ok((image << 4) | ty)
}

/// Errors raised while reading or writing trailer fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TrailerError {
    #[error(transparent)]
    Area(#[from] AreaError),
    /// Padded trailer write larger than the configured maximum alignment.
    #[error("padded trailer write of {len} bytes exceeds max alignment {max}")]
    AlignTooLarge { len: usize, max: usize },
    /// Image number or swap type does not fit a nibble.
    #[error("invalid swap info: image={image} type={swap:#x}")]
    InvalidSwapInfo { image: u8, swap: u8 },
    /// Area too small to hold a trailer.
    #[error("flash area {0} too small for a trailer")]
    AreaTooSmall(u8),
}

pub type Result<T> = core::result::Result<T, TrailerError>;

// ============================================================================
// Boot flag operations
// ============================================================================

/// Reads and writes the trailers of a flash layout.
#[derive(Debug, Clone, Copy)]
pub struct BootTrailer<'m> {
    map: &'m FlashMap,
    max_align: usize,
    encrypted_images: bool,
}

impl<'m> BootTrailer<'m> {
    pub fn new(map: &'m FlashMap) -> Self {
        Self { map, max_align: DEFAULT_MAX_ALIGN, encrypted_images: false }
    }

    /// Sets the largest padded trailer write accepted.
    pub fn with_max_align(mut self, max_align: usize) -> Self {
        self.max_align = max_align;
        self
    }

    /// Skips swap_info when images are encrypted.
    pub fn with_encrypted_images(mut self, encrypted: bool) -> Self {
        self.encrypted_images = encrypted;
        self
    }

    fn open(&self, id: u8) -> Result<FlashArea> {
        let area = self.map.open(id)?;
        if area.size < TRAILER_MIN_SIZE {
            return Err(TrailerError::AreaTooSmall(id));
        }
        Ok(area)
    }

    /// Writes `bytes` at `off`, padded to the device alignment.
    ///
    /// Padding keeps the bytes already in flash so that neighbouring fields
    /// survive. The padded length may not exceed `max_align`. The write stops
    /// at the end of the area.
    pub fn write_trailer<F: FlashMemory>(
        &self,
        flash: &mut F,
        area: &FlashArea,
        off: u32,
        bytes: &[u8],
    ) -> Result<()> {
        let align = self.map.align(flash, area)?;
        let padded = bytes.len().div_ceil(align) * align;
        if padded > self.max_align {
            error!("trailer write: padded len {} > max align {}", padded, self.max_align);
            return Err(TrailerError::AlignTooLarge { len: padded, max: self.max_align });
        }
        let avail = area.size.saturating_sub(off) as usize;
        let len = padded.min(avail);
        if bytes.len() > len {
            return Err(AreaError::BadArgs.into());
        }
        let mut buf = vec![area.erased_val(); len];
        self.map.area_read(flash, area, off, &mut buf)?;
        buf[..bytes.len()].copy_from_slice(bytes);
        self.map.area_write(flash, area, off, &buf)?;
        Ok(())
    }

    // Magic and image_ok are written unpadded; only swap_info goes through
    // write_trailer.
    fn write_magic<F: FlashMemory>(&self, flash: &mut F, area: &FlashArea) -> Result<()> {
        self.map.area_write(flash, area, magic_off(area.size), &boot_magic())?;
        Ok(())
    }

    fn write_image_ok<F: FlashMemory>(&self, flash: &mut F, area: &FlashArea) -> Result<()> {
        self.map.area_write(flash, area, image_ok_off(area.size), &[FLAG_SET])?;
        Ok(())
    }

    fn write_swap_info<F: FlashMemory>(
        &self,
        flash: &mut F,
        area: &FlashArea,
        image: u8,
        swap: SwapType,
    ) -> Result<()> {
        let info = swap_info(image, swap)?;
        self.write_trailer(flash, area, swap_info_off(area.size), &[info])
    }

    /// Reads the magic of `area`.
    pub fn read_magic<F: FlashMemory>(&self, flash: &F, area: &FlashArea) -> Result<MagicState> {
        let mut buf = [0u8; BOOT_MAGIC_SZ];
        self.map.area_read(flash, area, magic_off(area.size), &mut buf)?;
        let state = if buf == boot_magic() {
            MagicState::Good
        } else if buf.iter().all(|&b| b == area.erased_val()) {
            MagicState::Unset
        } else {
            MagicState::Bad
        };
        Ok(state)
    }

    fn read_flag<F: FlashMemory>(&self, flash: &F, area: &FlashArea, off: u32) -> Result<FlagState> {
        let mut buf = [0u8; 1];
        self.map.area_read(flash, area, off, &mut buf)?;
        let state = match buf[0] {
            v if v == area.erased_val() => FlagState::Unset,
            FLAG_SET => FlagState::Set,
            _ => FlagState::Bad,
        };
        Ok(state)
    }

    /// Reads the image_ok flag of `area`.
    pub fn read_image_ok<F: FlashMemory>(&self, flash: &F, area: &FlashArea) -> Result<FlagState> {
        self.read_flag(flash, area, image_ok_off(area.size))
    }

    /// Reads the copy_done flag of `area`.
    pub fn read_copy_done<F: FlashMemory>(&self, flash: &F, area: &FlashArea) -> Result<FlagState> {
        self.read_flag(flash, area, copy_done_off(area.size))
    }

    /// Swap type recorded in the swap_info byte, if any.
    pub fn read_swap_type<F: FlashMemory>(&self, flash: &F, area: &FlashArea) -> Result<Option<SwapType>> {
        let mut buf = [0u8; 1];
        self.map.area_read(flash, area, swap_info_off(area.size), &mut buf)?;
        if buf[0] == area.erased_val() {
            return Ok(None);
        }
        Ok(SwapType::from_u8(buf[0] & 0x0f))
    }

    /// Marks the secondary slot of `image` for a swap on next reset.
    pub fn set_pending<F: FlashMemory>(&self, flash: &mut F, image: u8, permanent: bool) -> Result<()> {
        let area = self.open(area_secondary(image))?;
        debug!("set pending: image={} permanent={} area={}", image, permanent, area.id);
        self.write_magic(flash, &area)?;
        if area.is_external() {
            if permanent {
                self.write_image_ok(flash, &area)?;
            }
            if !self.encrypted_images {
                let swap = if permanent { SwapType::Perm } else { SwapType::Test };
                self.write_swap_info(flash, &area, 0, swap)?;
            }
        }
        Ok(())
    }

    /// Cancels a pending swap by clearing the secondary magic.
    pub fn unset_pending<F: FlashMemory>(&self, flash: &mut F, image: u8) -> Result<()> {
        let area = self.open(area_secondary(image))?;
        debug!("unset pending: image={} area={}", image, area.id);
        self.map.area_write(flash, &area, magic_off(area.size), &[0u8; BOOT_MAGIC_SZ])?;
        Ok(())
    }

    /// Confirms the image running from the primary slot of `image`.
    pub fn set_confirmed<F: FlashMemory>(&self, flash: &mut F, image: u8) -> Result<()> {
        let area = self.open(area_primary(image))?;
        debug!("set confirmed: image={} area={}", image, area.id);
        self.write_magic(flash, &area)?;
        self.write_image_ok(flash, &area)
    }

    /// Swap the bootloader will perform for `image`.
    pub fn pending_status<F: FlashMemory>(&self, flash: &F, image: u8) -> Result<SwapType> {
        let area = self.open(area_secondary(image))?;
        if self.read_magic(flash, &area)? != MagicState::Good {
            return Ok(SwapType::None);
        }
        if let Some(swap) = self.read_swap_type(flash, &area)? {
            return Ok(swap);
        }
        match self.read_image_ok(flash, &area)? {
            FlagState::Set => Ok(SwapType::Perm),
            FlagState::Bad | FlagState::Unset => Ok(SwapType::Test),
        }
    }

    /// image_ok state of the primary slot of `image`.
    pub fn confirm_status<F: FlashMemory>(&self, flash: &F, image: u8) -> Result<FlagState> {
        let area = self.open(area_primary(image))?;
        self.read_image_ok(flash, &area)
    }
}
