// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: OTA download storage for MCUboot-style flash layouts
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (v1.0)
//! TEST_COVERAGE: Unit tests per module + integration tests (via tests/ota_storage_host)
//!   - raw and tarball downloads, any chunking
//!   - pending/confirm trailer flags and slot state transitions
//!   - app info, SHA-256 image check, TOML layouts
//!
//! PUBLIC API:
//!   - FlashMemory / MemFlash: memory backend seam + in-memory model
//!   - FlashMap / FlashArea: area table and bounds-checked area I/O
//!   - BootTrailer: boot magic, image_ok, swap_info
//!   - Untar: streaming components.json tarball extractor
//!   - OtaStorage: open/write/verify/validate and slot state
//!
//! DEPENDENCIES:
//!   - serde + toml: flash layout configuration
//!   - serde_json: components.json manifest
//!   - semver: minimum version gate for tarballs
//!   - sha2: image hash verification
//!   - log: diagnostics

#![forbid(unsafe_code)]

pub mod config;
pub mod flash;
pub mod flash_map;
pub mod image;
pub mod storage;
pub mod trailer;
pub mod untar;

pub use config::{AreaConfig, AreaRole, ConfigError, ConfirmStrategy, EraseMode, StorageConfig};
pub use flash::{FlashError, FlashMemory, MemFlash, MemType, OpCounts, RegionGeometry};
pub use flash_map::{AreaError, FlashArea, FlashMap};
pub use image::{AppInfo, ImageError, ImageHeader, ImageVersion};
pub use storage::{ChunkInfo, OtaStorage, SlotId, SlotState, StorageContext, StorageError};
pub use trailer::{BootTrailer, FlagState, MagicState, SwapType, TrailerError};
pub use untar::{is_tar_header, FileInfo, TarCheck, Untar, UntarError, UntarSink};
