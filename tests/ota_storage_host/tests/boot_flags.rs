// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Integration tests for trailer flags and slot state transitions
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 7 tests
//!
//! TEST_SCOPE:
//!   - set_boot_pending with and without encrypted images
//!   - confirm strategies (set-confirmed vs unset-pending)
//!   - set_slot_state rules for the inactive slot
//!   - shipped PSoC6 layout on 512-byte internal program rows
//!
//! TEST_SCENARIOS:
//!   - test_set_boot_pending_uses_context_mode(): test vs permanent from the context
//!   - test_encrypted_images_fall_back_to_image_ok(): no swap_info written
//!   - test_unset_pending_confirm_strategy(): validate clears the secondary magic
//!   - test_slot_state_transitions_on_inactive_slot(): Pending/Inactive/NoImage
//!   - test_active_slot_is_immutable(): primary transitions refused
//!   - test_disallowed_target_states(): Active/Verifying/Unknown refused
//!   - test_psoc6_layout_with_wide_internal_rows(): confirm and pending on 512-byte rows

use std::path::PathBuf;

use ota_storage::image::ImageVersion;
use ota_storage::trailer::{image_ok_off, swap_info_off};
use ota_storage::{
    BootTrailer, FlagState, MagicState, MemFlash, MemType, OtaStorage, RegionGeometry, SlotId, SlotState,
    StorageConfig, StorageContext, StorageError, SwapType,
};
use ota_storage_host::{board, mcuboot_image, read_secondary, stream, VendorIds};

fn download(storage: &mut ota_storage::OtaStorage<ota_storage::MemFlash>) -> Vec<u8> {
    let image = mcuboot_image(1000, ImageVersion { major: 1, minor: 0, revision: 0, build_num: 1 }, VendorIds::default());
    let mut ctx = StorageContext::new();
    storage.open(&mut ctx).expect("open");
    stream(storage, &mut ctx, &image, &[512]).expect("download");
    storage.close(&mut ctx).expect("close");
    image
}

#[test]
fn test_set_boot_pending_uses_context_mode() {
    let mut storage = board(1, "");
    download(&mut storage);
    let ctx = StorageContext::test_mode();
    storage.set_boot_pending(0, &ctx).expect("pending");
    assert_eq!(storage.get_boot_pending_status(0), Ok(SwapType::Test));

    let ctx = StorageContext::new();
    storage.set_boot_pending(0, &ctx).expect("pending");
    assert_eq!(storage.get_boot_pending_status(0), Ok(SwapType::Perm));
}

#[test]
fn test_encrypted_images_fall_back_to_image_ok() {
    let mut storage = board(1, "encrypted_images = true");
    download(&mut storage);
    storage.set_boot_pending(0, &StorageContext::new()).expect("pending");

    let map = storage.map().clone();
    let area = map.open(2).expect("secondary");
    let mut info = [0u8; 1];
    map.area_read(storage.flash(), &area, swap_info_off(area.size), &mut info).expect("read");
    assert_eq!(info, [0xff]);
    let mut ok = [0u8; 1];
    map.area_read(storage.flash(), &area, image_ok_off(area.size), &mut ok).expect("read");
    assert_eq!(ok, [0x01]);
    assert_eq!(storage.get_boot_pending_status(0), Ok(SwapType::Perm));
}

#[test]
fn test_unset_pending_confirm_strategy() {
    let mut storage = board(1, "confirm_strategy = \"unset-pending\"");
    download(&mut storage);
    storage.set_boot_pending(0, &StorageContext::new()).expect("pending");
    assert_eq!(storage.get_slot_state(SlotId::Secondary, 0), Ok(SlotState::Pending));

    storage.image_validate(0).expect("validate");
    let map = storage.map().clone();
    let area = map.open(2).expect("secondary");
    let trailer = BootTrailer::new(&map);
    assert_eq!(trailer.read_magic(storage.flash(), &area), Ok(MagicState::Bad));
    assert_eq!(storage.get_boot_pending_status(0), Ok(SwapType::None));
    assert_eq!(storage.get_image_validate_status(0), Ok(FlagState::Unset));
}

#[test]
fn test_slot_state_transitions_on_inactive_slot() {
    let mut storage = board(1, "");
    let image = download(&mut storage);
    assert_eq!(storage.get_slot_state(SlotId::Secondary, 0), Ok(SlotState::Inactive));

    storage.set_slot_state(SlotId::Secondary, 0, SlotState::Pending).expect("pending");
    assert_eq!(storage.get_slot_state(SlotId::Secondary, 0), Ok(SlotState::Pending));
    assert_eq!(storage.get_boot_pending_status(0), Ok(SwapType::Test));

    storage.set_slot_state(SlotId::Secondary, 0, SlotState::Inactive).expect("inactive");
    assert_eq!(storage.get_slot_state(SlotId::Secondary, 0), Ok(SlotState::Inactive));
    assert_eq!(read_secondary(&storage, 0, image.len()), image);

    storage.set_slot_state(SlotId::Secondary, 0, SlotState::NoImage).expect("no image");
    assert_eq!(storage.get_slot_state(SlotId::Secondary, 0), Ok(SlotState::NoImage));
    assert!(matches!(
        storage.set_slot_state(SlotId::Secondary, 0, SlotState::Pending),
        Err(StorageError::General(_))
    ));
}

#[test]
fn test_active_slot_is_immutable() {
    let mut storage = board(1, "");
    download(&mut storage);
    for state in [SlotState::NoImage, SlotState::Inactive, SlotState::Pending, SlotState::Active] {
        assert!(matches!(
            storage.set_slot_state(SlotId::Primary, 0, state),
            Err(StorageError::General(_))
        ));
    }
}

#[test]
fn test_disallowed_target_states() {
    let mut storage = board(1, "");
    download(&mut storage);
    for state in [SlotState::Active, SlotState::Verifying, SlotState::Unknown] {
        assert!(matches!(
            storage.set_slot_state(SlotId::Secondary, 0, state),
            Err(StorageError::General(_))
        ));
    }
    assert_eq!(storage.get_slot_state(SlotId::Secondary, 0), Ok(SlotState::Inactive));
}

#[test]
fn test_psoc6_layout_with_wide_internal_rows() {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../userspace/ota-storage/flashmaps/psoc6_1image_ext_flash.toml");
    let config = StorageConfig::from_path(path).expect("psoc6 layout");
    assert_eq!(config.max_align, 512);
    let flash = MemFlash::new()
        .with_region(
            MemType::InternalFlash,
            RegionGeometry { base: 0, size: 0x20_0000, prog_size: 512, erase_size: 0x200 },
        )
        .with_region(
            MemType::ExternalFlash,
            RegionGeometry { base: 0, size: 0x20_0000, prog_size: 1, erase_size: 0x1000 },
        );
    let mut storage = OtaStorage::new(flash, config).expect("storage");
    storage.init().expect("init");

    storage.image_validate(0).expect("confirm on 512-byte rows");
    assert_eq!(storage.get_image_validate_status(0), Ok(FlagState::Set));

    storage.set_boot_pending(0, &StorageContext::new()).expect("pending");
    assert_eq!(storage.get_boot_pending_status(0), Ok(SwapType::Perm));
}
