// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Integration tests for app info reporting
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 4 tests
//!
//! TEST_SCOPE:
//!   - version fields and revision/slot split
//!   - vendor company/product TLVs
//!   - empty and corrupted slots
//!
//! TEST_SCENARIOS:
//!   - test_app_info_for_downloaded_image(): secondary slot after download
//!   - test_app_info_defaults_without_vendor_tlvs(): ids fall back to 0xFFFF
//!   - test_app_info_empty_slot(): NoImageInfo on an erased slot
//!   - test_app_info_broken_tlv_area(): ReadStorage on a damaged TLV info block

use ota_storage::image::{ImageVersion, IMAGE_HEADER_SIZE};
use ota_storage::{AppInfo, SlotId, StorageContext, StorageError};
use ota_storage_host::{board, mcuboot_image, simulate_swap, stream, VendorIds};

fn version() -> ImageVersion {
    ImageVersion { major: 4, minor: 3, revision: 0x0a02, build_num: 1234 }
}

fn download(storage: &mut ota_storage::OtaStorage<ota_storage::MemFlash>, image: &[u8]) {
    let mut ctx = StorageContext::new();
    storage.open(&mut ctx).expect("open");
    stream(storage, &mut ctx, image, &[700]).expect("download");
    storage.close(&mut ctx).expect("close");
}

#[test]
fn test_app_info_for_downloaded_image() {
    let mut storage = board(1, "");
    let image = mcuboot_image(800, version(), VendorIds { company: Some(0x0009), product: Some(0x4242) });
    download(&mut storage, &image);

    let info = storage.get_app_info(SlotId::Secondary, 0).expect("app info");
    assert_eq!(
        info,
        AppInfo {
            app_id: 0,
            major: 4,
            minor: 3,
            build: 1234,
            revision: 0x0a,
            slot: 0x02,
            company_id: 0x0009,
            product_id: 0x4242,
        }
    );

    simulate_swap(&mut storage, 0);
    let primary = storage.get_app_info(SlotId::Primary, 0).expect("primary info");
    assert_eq!(primary, info);
}

#[test]
fn test_app_info_defaults_without_vendor_tlvs() {
    let mut storage = board(1, "");
    download(&mut storage, &mcuboot_image(800, version(), VendorIds::default()));
    let info = storage.get_app_info(SlotId::Secondary, 0).expect("app info");
    assert_eq!((info.company_id, info.product_id), (0xffff, 0xffff));
}

#[test]
fn test_app_info_empty_slot() {
    let storage = board(1, "");
    assert!(matches!(
        storage.get_app_info(SlotId::Secondary, 0),
        Err(StorageError::NoImageInfo(_))
    ));
}

#[test]
fn test_app_info_broken_tlv_area() {
    let mut storage = board(1, "");
    let mut image = mcuboot_image(800, version(), VendorIds { company: Some(1), product: None });
    image[IMAGE_HEADER_SIZE + 800] = 0x00;
    download(&mut storage, &image);
    assert!(matches!(
        storage.get_app_info(SlotId::Secondary, 0),
        Err(StorageError::ReadStorage(_))
    ));
}
