// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Host integration test fixtures for ota-storage (board model, images, tarballs)
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: Shared by tests/*.rs
//!
//! The fixture board has internal flash (primaries) and one external serial
//! flash (secondaries), each `IMAGES_MAX * SLOT_SIZE` bytes.

use ota_storage::flash_map::{area_primary, area_secondary};
use ota_storage::image::{
    ImageHeader, ImageVersion, IMAGE_HEADER_SIZE, TLV_COMPANY_ID, TLV_INFO_MAGIC, TLV_PRODUCT_ID,
    TLV_PROT_INFO_MAGIC, TLV_SHA256,
};
use ota_storage::trailer::{boot_magic, magic_off};
use ota_storage::{
    ChunkInfo, MemFlash, MemType, OtaStorage, RegionGeometry, StorageConfig, StorageContext,
    StorageError,
};
use sha2::{Digest, Sha256};

pub const SLOT_SIZE: u32 = 0x8000;
pub const IMAGES_MAX: u8 = 2;
pub const INTERNAL_ERASE: usize = 0x200;
pub const EXTERNAL_ERASE: usize = 0x1000;

/// TOML layout with `images` primary/secondary pairs.
pub fn layout_toml(images: u8, extra: &str) -> String {
    let mut out = format!("image_count = {images}\nsector_size = {EXTERNAL_ERASE:#x}\n{extra}\n");
    for i in 0..images {
        let off = u32::from(i) * SLOT_SIZE;
        out.push_str(&format!(
            "[[areas]]\nrole = \"primary\"\nimage = {n}\ndevice_id = 0x7f\noffset = {off:#x}\nsize = {SLOT_SIZE:#x}\n\n\
             [[areas]]\nrole = \"secondary\"\nimage = {n}\ndevice_id = 0x80\noffset = {off:#x}\nsize = {SLOT_SIZE:#x}\n\n",
            n = i + 1
        ));
    }
    out
}

/// Fresh flash model matching [`layout_toml`].
pub fn flash() -> MemFlash {
    let size = IMAGES_MAX as usize * SLOT_SIZE as usize;
    MemFlash::new()
        .with_region(
            MemType::InternalFlash,
            RegionGeometry { base: 0, size, prog_size: 8, erase_size: INTERNAL_ERASE },
        )
        .with_region(
            MemType::ExternalFlash,
            RegionGeometry { base: 0, size, prog_size: 1, erase_size: EXTERNAL_ERASE },
        )
}

/// Initialized storage for `images` images; `extra` is spliced into the TOML.
pub fn board(images: u8, extra: &str) -> OtaStorage<MemFlash> {
    let config = StorageConfig::from_toml_str(&layout_toml(images, extra)).expect("fixture layout");
    let mut storage = OtaStorage::new(flash(), config).expect("storage");
    storage.init().expect("init");
    storage
}

/// Vendor ids stamped into a fixture image.
#[derive(Debug, Clone, Copy, Default)]
pub struct VendorIds {
    pub company: Option<u16>,
    pub product: Option<u16>,
}

fn tlv(ty: u16, value: &[u8]) -> Vec<u8> {
    let mut out = ty.to_le_bytes().to_vec();
    out.extend_from_slice(&(value.len() as u16).to_le_bytes());
    out.extend_from_slice(value);
    out
}

fn tlv_info(magic: u16, entries: &[u8]) -> Vec<u8> {
    let mut out = magic.to_le_bytes().to_vec();
    out.extend_from_slice(&((entries.len() + 4) as u16).to_le_bytes());
    out.extend_from_slice(entries);
    out
}

/// Builds a signed-by-hash MCUboot image with a `body_len`-byte payload.
pub fn mcuboot_image(body_len: usize, version: ImageVersion, ids: VendorIds) -> Vec<u8> {
    let body: Vec<u8> = (0..body_len).map(|i| (i * 7 % 253) as u8).collect();
    let mut prot_entries = Vec::new();
    if let Some(c) = ids.company {
        prot_entries.extend(tlv(TLV_COMPANY_ID, &c.to_be_bytes()));
    }
    if let Some(p) = ids.product {
        prot_entries.extend(tlv(TLV_PRODUCT_ID, &p.to_be_bytes()));
    }
    let prot = if prot_entries.is_empty() { Vec::new() } else { tlv_info(TLV_PROT_INFO_MAGIC, &prot_entries) };

    let header = ImageHeader {
        load_addr: 0,
        hdr_size: IMAGE_HEADER_SIZE as u16,
        protect_tlv_size: prot.len() as u16,
        img_size: body.len() as u32,
        flags: 0,
        version,
    };
    let mut out = header.encode().to_vec();
    out.extend_from_slice(&body);
    out.extend_from_slice(&prot);
    let digest = Sha256::digest(&out);
    out.extend(tlv_info(TLV_INFO_MAGIC, &tlv(TLV_SHA256, &digest)));
    out
}

/// Component of a fixture tarball.
pub struct Component<'a> {
    pub name: &'a str,
    pub file_type: &'a str,
    pub img_id: u16,
    pub data: &'a [u8],
}

/// Builds a ustar archive with a leading components.json.
pub fn tarball(version: &str, components: &[Component<'_>]) -> Vec<u8> {
    let mut files = vec![r#"{"fileName":"components.json","fileType":"component_list"}"#.to_string()];
    for c in components {
        files.push(format!(
            r#"{{"fileName":"{}","fileType":"{}","fileSize":"{}","imgID":"{}"}}"#,
            c.name,
            c.file_type,
            c.data.len(),
            c.img_id
        ));
    }
    let json = format!(
        r#"{{"numberOfComponents":"{}","version":"{}","files":[{}]}}"#,
        files.len(),
        version,
        files.join(",")
    );

    let mut builder = tar::Builder::new(Vec::new());
    append(&mut builder, "components.json", json.as_bytes());
    for c in components {
        append(&mut builder, c.name, c.data);
    }
    builder.into_inner().expect("finish tarball")
}

fn append(builder: &mut tar::Builder<Vec<u8>>, name: &str, data: &[u8]) {
    let mut header = tar::Header::new_ustar();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_entry_type(tar::EntryType::Regular);
    builder.append_data(&mut header, name, data).expect("append entry");
}

/// Streams `data` through `write` in chunks whose sizes cycle through `sizes`.
pub fn stream(
    storage: &mut OtaStorage<MemFlash>,
    ctx: &mut StorageContext,
    data: &[u8],
    sizes: &[usize],
) -> Result<(), StorageError> {
    let mut offset = 0usize;
    let mut sizes = sizes.iter().copied().filter(|&s| s > 0).cycle();
    while offset < data.len() {
        let len = sizes.next().unwrap_or(data.len()).min(data.len() - offset);
        let chunk = ChunkInfo {
            offset: offset as u32,
            buffer: &data[offset..offset + len],
            total_size: data.len() as u32,
        };
        storage.write(ctx, &chunk)?;
        offset += len;
    }
    Ok(())
}

/// Reads `len` bytes from the start of the secondary slot of `image`.
pub fn read_secondary(storage: &OtaStorage<MemFlash>, image: u8, len: usize) -> Vec<u8> {
    read_area(storage, area_secondary(image), len)
}

/// Reads `len` bytes from the start of the primary slot of `image`.
pub fn read_primary(storage: &OtaStorage<MemFlash>, image: u8, len: usize) -> Vec<u8> {
    read_area(storage, area_primary(image), len)
}

fn read_area(storage: &OtaStorage<MemFlash>, id: u8, len: usize) -> Vec<u8> {
    let area = storage.map().open(id).expect("area");
    let mut buf = vec![0u8; len];
    storage.map().area_read(storage.flash(), &area, 0, &mut buf).expect("read area");
    buf
}

/// Plays the bootloader: copies the secondary image of `image` into the
/// primary slot, leaves it in test mode and clears the secondary slot.
pub fn simulate_swap(storage: &mut OtaStorage<MemFlash>, image: u8) {
    let map = storage.map().clone();
    let primary = map.open(area_primary(image)).expect("primary");
    let secondary = map.open(area_secondary(image)).expect("secondary");

    let mut payload = vec![0u8; magic_off(SLOT_SIZE) as usize - 32];
    map.area_read(storage.flash(), &secondary, 0, &mut payload).expect("read secondary");

    let flash = storage.flash_mut();
    map.area_erase(flash, &primary, 0, primary.size as usize).expect("erase primary");
    map.area_write(flash, &primary, 0, &payload).expect("copy image");
    map.area_write(flash, &primary, magic_off(primary.size), &boot_magic()).expect("primary magic");
    map.area_erase(flash, &secondary, 0, secondary.size as usize).expect("erase secondary");
}
