// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Streaming ustar extractor for multi-component OTA tarballs
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (v1.0)
//! TEST_COVERAGE: Unit tests below + tests/ota_storage_host/tests/tar_flow.rs
//!
//! The archive must start with `components.json`, which lists every component
//! file, its size and the image it belongs to. Component data is pushed to an
//! [`UntarSink`] as it streams in; the archive is never buffered whole.

use log::{debug, warn};
use serde::Deserialize;
use thiserror::Error;

use crate::flash_map::AreaError;

// ============================================================================
// Constants
// ============================================================================

pub const TAR_BLOCK_SIZE: usize = 512;
pub const MAX_TAR_FILES: usize = 8;
pub const VERSION_STRING_MAX: usize = 16;
pub const FILE_TYPE_LEN: usize = 16;
pub const NAME_LEN: usize = 100;

/// Name of the manifest entry.
pub const COMPONENTS_JSON: &str = "components.json";

const MAX_COMPONENTS_JSON: usize = 4096;

const USTAR_MAGIC: &[u8; 5] = b"ustar";
const MAGIC_OFF: usize = 257;
const NAME_OFF: usize = 0;
const SIZE_OFF: usize = 124;
const CHKSUM_OFF: usize = 148;
const CHKSUM_LEN: usize = 8;
const TYPEFLAG_OFF: usize = 156;
const PREFIX_OFF: usize = 345;
const PREFIX_LEN: usize = 155;

const REGTYPE: u8 = b'0';
const AREGTYPE: u8 = 0;

// ============================================================================
// Errors and types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UntarError {
    /// Archive structure is broken.
    #[error("invalid tar archive: {0}")]
    Invalid(String),
    /// components.json missing, malformed or out of limits.
    #[error("components.json: {0}")]
    ComponentsJson(String),
    /// The sink refused the manifest.
    #[error("archive rejected: {0}")]
    Rejected(String),
    /// The sink failed to store component data.
    #[error("component write failed: {0}")]
    Write(#[from] AreaError),
}

pub type Result<T> = core::result::Result<T, UntarError>;

/// Outcome of [`is_tar_header`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TarCheck {
    Valid,
    NotTar,
    NotEnoughData,
}

/// Checks whether `buf` starts with a ustar header block.
pub fn is_tar_header(buf: &[u8]) -> TarCheck {
    if buf.len() < TAR_BLOCK_SIZE {
        return TarCheck::NotEnoughData;
    }
    let magic = &buf[MAGIC_OFF..MAGIC_OFF + USTAR_MAGIC.len()];
    let term = buf[MAGIC_OFF + USTAR_MAGIC.len()];
    if magic == USTAR_MAGIC && (term == 0 || term == b' ') {
        TarCheck::Valid
    } else {
        TarCheck::NotTar
    }
}

/// One component listed in components.json.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub file_type: String,
    /// Declared size; `None` until the tar header supplies it.
    pub size: Option<u32>,
    /// 1-based image number the component targets.
    pub img_id: u16,
    pub found_in_tar: bool,
    /// Archive offset of the component's header block.
    pub header_offset: u32,
    /// Bytes forwarded to the sink so far.
    pub processed: u32,
}

impl FileInfo {
    /// True for the manifest's own entry.
    pub fn is_manifest(&self) -> bool {
        self.name == COMPONENTS_JSON
    }
}

/// Receives component data as it is extracted.
pub trait UntarSink {
    /// Called once components.json is parsed, before any component data.
    fn manifest(&mut self, _version: &str, _files: &[FileInfo]) -> Result<()> {
        Ok(())
    }

    /// Stores `data` at `offset` within `file`.
    fn write(&mut self, file: &FileInfo, offset: u32, data: &[u8]) -> Result<()>;
}

// ============================================================================
// components.json
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Number {
    Int(u64),
    Text(String),
}

impl Number {
    fn value(&self, what: &str) -> Result<u64> {
        match self {
            Number::Int(v) => Ok(*v),
            Number::Text(s) => s
                .trim()
                .parse()
                .map_err(|_| UntarError::ComponentsJson(format!("{what} is not a number: {s:?}"))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(rename = "numberOfComponents")]
    count: Number,
    #[serde(default)]
    version: String,
    files: Vec<ManifestFile>,
}

#[derive(Debug, Deserialize)]
struct ManifestFile {
    #[serde(rename = "fileName")]
    name: String,
    #[serde(rename = "fileType", default)]
    file_type: String,
    #[serde(rename = "fileSize", default)]
    size: Option<Number>,
    #[serde(rename = "imgID", default)]
    img_id: Option<Number>,
}

fn parse_manifest(raw: &[u8]) -> Result<(String, Vec<FileInfo>)> {
    let manifest: Manifest =
        serde_json::from_slice(raw).map_err(|err| UntarError::ComponentsJson(err.to_string()))?;
    let count = manifest.count.value("numberOfComponents")?;
    if manifest.files.len() > MAX_TAR_FILES {
        return Err(UntarError::ComponentsJson(format!("{} files exceed limit {MAX_TAR_FILES}", manifest.files.len())));
    }
    if count != manifest.files.len() as u64 {
        return Err(UntarError::ComponentsJson(format!(
            "numberOfComponents {count} but {} files listed",
            manifest.files.len()
        )));
    }
    if manifest.version.len() >= VERSION_STRING_MAX {
        return Err(UntarError::ComponentsJson("version string too long".into()));
    }

    let mut files = Vec::with_capacity(manifest.files.len());
    for entry in manifest.files {
        if entry.name.is_empty() || entry.name.len() >= NAME_LEN || entry.file_type.len() >= FILE_TYPE_LEN {
            return Err(UntarError::ComponentsJson(format!("bad file entry {:?}", entry.name)));
        }
        let size = match &entry.size {
            Some(n) => Some(
                u32::try_from(n.value("fileSize")?)
                    .map_err(|_| UntarError::ComponentsJson("fileSize out of range".into()))?,
            ),
            None => None,
        };
        let img_id = match &entry.img_id {
            Some(n) => u16::try_from(n.value("imgID")?)
                .ok()
                .filter(|&id| id >= 1)
                .ok_or_else(|| UntarError::ComponentsJson("imgID out of range".into()))?,
            None => 1,
        };
        if files.iter().any(|f: &FileInfo| f.name == entry.name) {
            return Err(UntarError::ComponentsJson(format!("duplicate file {:?}", entry.name)));
        }
        files.push(FileInfo {
            name: entry.name,
            file_type: entry.file_type,
            size,
            img_id,
            found_in_tar: false,
            header_offset: 0,
            processed: 0,
        });
    }
    Ok((manifest.version, files))
}

// ============================================================================
// Header parsing
// ============================================================================

fn octal(field: &[u8]) -> Option<u64> {
    let digits = field
        .iter()
        .skip_while(|&&b| b == b' ')
        .take_while(|&&b| (b'0'..=b'7').contains(&b));
    let mut value = 0u64;
    for &d in digits {
        value = value.checked_mul(8)?.checked_add(u64::from(d - b'0'))?;
    }
    Some(value)
}

fn cstr(field: &[u8]) -> Result<&str> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    core::str::from_utf8(&field[..end]).map_err(|_| UntarError::Invalid("non-UTF-8 entry name".into()))
}

fn checksum_ok(block: &[u8; TAR_BLOCK_SIZE]) -> bool {
    let Some(stored) = octal(&block[CHKSUM_OFF..CHKSUM_OFF + CHKSUM_LEN]) else {
        return false;
    };
    let sum: u64 = block
        .iter()
        .enumerate()
        .map(|(i, &b)| {
            if (CHKSUM_OFF..CHKSUM_OFF + CHKSUM_LEN).contains(&i) {
                u64::from(b' ')
            } else {
                u64::from(b)
            }
        })
        .sum();
    sum == stored
}

fn entry_path(block: &[u8; TAR_BLOCK_SIZE]) -> Result<String> {
    let name = cstr(&block[NAME_OFF..NAME_OFF + NAME_LEN])?;
    let prefix = cstr(&block[PREFIX_OFF..PREFIX_OFF + PREFIX_LEN])?;
    let full = if prefix.is_empty() { name.to_string() } else { format!("{prefix}/{name}") };
    if full.starts_with('/') || full.split('/').any(|part| part == "..") {
        return Err(UntarError::Invalid(format!("unsafe path {full:?}")));
    }
    Ok(full.trim_start_matches("./").to_string())
}

fn padding(size: u64) -> u64 {
    let rem = size % TAR_BLOCK_SIZE as u64;
    if rem == 0 {
        0
    } else {
        TAR_BLOCK_SIZE as u64 - rem
    }
}

// ============================================================================
// Extractor
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Manifest,
    File(usize),
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    FindHeader,
    Data { target: Target, remaining: u64, pad: u64 },
    Padding { remaining: u64 },
    Done,
}

/// Streaming extractor state.
#[derive(Debug, Clone)]
pub struct Untar {
    state: State,
    header: Box<[u8; TAR_BLOCK_SIZE]>,
    header_len: usize,
    manifest_buf: Vec<u8>,
    manifest_parsed: bool,
    version: String,
    files: Vec<FileInfo>,
    bytes_processed: u64,
}

impl Default for Untar {
    fn default() -> Self {
        Self::new()
    }
}

impl Untar {
    pub fn new() -> Self {
        Self {
            state: State::FindHeader,
            header: Box::new([0u8; TAR_BLOCK_SIZE]),
            header_len: 0,
            manifest_buf: Vec::new(),
            manifest_parsed: false,
            version: String::new(),
            files: Vec::new(),
            bytes_processed: 0,
        }
    }

    /// Version string from components.json, once parsed.
    pub fn version(&self) -> Option<&str> {
        self.manifest_parsed.then_some(self.version.as_str())
    }

    /// Components listed in components.json.
    pub fn files(&self) -> &[FileInfo] {
        &self.files
    }

    pub fn num_files_in_json(&self) -> usize {
        self.files.len()
    }

    /// Archive bytes consumed so far.
    pub fn bytes_processed(&self) -> u64 {
        self.bytes_processed
    }

    /// True once the end-of-archive marker was seen.
    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Consumes the next slice of the archive stream.
    ///
    /// Returns the number of bytes consumed; input past the end-of-archive
    /// marker is left unconsumed.
    pub fn feed<S: UntarSink>(&mut self, data: &[u8], sink: &mut S) -> Result<usize> {
        let mut pos = 0;
        while pos < data.len() {
            let rest = &data[pos..];
            let used = match self.state {
                State::Done => break,
                State::FindHeader => {
                    let n = rest.len().min(TAR_BLOCK_SIZE - self.header_len);
                    self.header[self.header_len..self.header_len + n].copy_from_slice(&rest[..n]);
                    self.header_len += n;
                    if self.header_len == TAR_BLOCK_SIZE {
                        self.header_len = 0;
                        let header_offset = self.bytes_processed + n as u64 - TAR_BLOCK_SIZE as u64;
                        self.on_header(header_offset)?;
                    }
                    n
                }
                State::Data { target, remaining, pad } => {
                    let n = rest.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
                    self.on_data(target, &rest[..n], sink)?;
                    let remaining = remaining - n as u64;
                    self.state = if remaining > 0 {
                        State::Data { target, remaining, pad }
                    } else {
                        if target == Target::Manifest {
                            self.finish_manifest(sink)?;
                        }
                        if pad > 0 {
                            State::Padding { remaining: pad }
                        } else {
                            State::FindHeader
                        }
                    };
                    n
                }
                State::Padding { remaining } => {
                    let n = rest.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
                    let remaining = remaining - n as u64;
                    self.state =
                        if remaining > 0 { State::Padding { remaining } } else { State::FindHeader };
                    n
                }
            };
            pos += used;
            self.bytes_processed += used as u64;
        }
        Ok(pos)
    }

    fn on_header(&mut self, header_offset: u64) -> Result<()> {
        let block = &*self.header;
        if block.iter().all(|&b| b == 0) {
            if !self.manifest_parsed {
                return Err(UntarError::ComponentsJson("archive ended before components.json".into()));
            }
            debug!("untar: end of archive at {:#x}", header_offset);
            self.state = State::Done;
            return Ok(());
        }
        if is_tar_header(block) != TarCheck::Valid {
            return Err(UntarError::Invalid(format!("missing ustar magic at {header_offset:#x}")));
        }
        if !checksum_ok(block) {
            return Err(UntarError::Invalid(format!("header checksum mismatch at {header_offset:#x}")));
        }
        let path = entry_path(block)?;
        let size = octal(&block[SIZE_OFF..SIZE_OFF + 12])
            .ok_or_else(|| UntarError::Invalid(format!("bad size for {path:?}")))?;
        let regular = matches!(block[TYPEFLAG_OFF], REGTYPE | AREGTYPE);

        let target = if !self.manifest_parsed {
            if !regular || path != COMPONENTS_JSON {
                return Err(UntarError::ComponentsJson(format!("first entry is {path:?}")));
            }
            if size as usize > MAX_COMPONENTS_JSON {
                return Err(UntarError::ComponentsJson(format!("{size} bytes is too large")));
            }
            self.manifest_buf.clear();
            Target::Manifest
        } else if !regular {
            debug!("untar: skipping non-regular entry {:?}", path);
            Target::Skip
        } else if let Some(index) = self.files.iter().position(|f| f.name == path) {
            let file = &mut self.files[index];
            if file.is_manifest() {
                Target::Skip
            } else {
                let size32 = u32::try_from(size)
                    .map_err(|_| UntarError::Invalid(format!("{path:?} too large")))?;
                match file.size {
                    Some(expected) if expected != size32 => {
                        return Err(UntarError::Invalid(format!(
                            "{path:?} is {size} bytes, components.json says {expected}"
                        )));
                    }
                    _ => file.size = Some(size32),
                }
                file.found_in_tar = true;
                file.header_offset = header_offset as u32;
                debug!("untar: component {:?} img={} size={}", path, file.img_id, size);
                Target::File(index)
            }
        } else {
            warn!("untar: {:?} not listed in components.json, skipping", path);
            Target::Skip
        };

        let pad = padding(size);
        self.state = if size > 0 {
            State::Data { target, remaining: size, pad }
        } else if target == Target::Manifest {
            return Err(UntarError::ComponentsJson("empty components.json".into()));
        } else {
            State::FindHeader
        };
        Ok(())
    }

    fn on_data<S: UntarSink>(&mut self, target: Target, data: &[u8], sink: &mut S) -> Result<()> {
        match target {
            Target::Manifest => self.manifest_buf.extend_from_slice(data),
            Target::File(index) => {
                let file = &mut self.files[index];
                sink.write(file, file.processed, data)?;
                file.processed += data.len() as u32;
            }
            Target::Skip => {}
        }
        Ok(())
    }

    fn finish_manifest<S: UntarSink>(&mut self, sink: &mut S) -> Result<()> {
        let (version, files) = parse_manifest(&self.manifest_buf)?;
        debug!("untar: components.json version={:?} files={}", version, files.len());
        self.manifest_buf = Vec::new();
        sink.manifest(&version, &files)?;
        self.version = version;
        self.files = files;
        self.manifest_parsed = true;
        Ok(())
    }
}
