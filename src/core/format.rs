//! Purpose: Centralize on-disk layout constants, format versioning, and prologue codecs.
//! Exports: `FORMAT_VERSION`, `StorePrologue`, store/lock field offsets, `format_version_error`.
//! Role: Shared policy for gating on-disk compatibility across create/open/validation paths.
//! Invariants: Version list is additive; bump only for incompatible on-disk changes.
//! Invariants: Mutable prologue fields are 8-byte aligned so they can be accessed atomically.
use crate::core::error::{Error, ErrorKind, Result};

pub const FORMAT_VERSION: u32 = 1;
pub const SUPPORTED_FORMAT_VERSIONS: &[u32] = &[FORMAT_VERSION];
/// Bumped when record payload conventions change without changing the framing.
pub const DATA_VERSION: u32 = 1;

const STORE_MAGIC: [u8; 4] = *b"LGST";
const LOCK_MAGIC: [u8; 4] = *b"LGSL";
const ENDIANNESS_LE: u8 = 1;

pub const PROLOGUE_SIZE: usize = 64;
pub const WRITE_POSITION_OFFSET: usize = 40;
pub const LAST_SEQUENCE_OFFSET: usize = 48;
pub const INDEX_HIGH_WATER_OFFSET: usize = 56;
pub const INDEX_ARRAY_OFFSET: usize = PROLOGUE_SIZE;

pub const LOCK_FILE_SIZE: usize = 64;
pub const LOCK_TOKEN_OFFSET: usize = 8;

pub fn format_version_error(detected: u32) -> Error {
    let supported = SUPPORTED_FORMAT_VERSIONS
        .iter()
        .map(|version| version.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    Error::new(ErrorKind::Corrupt)
        .with_message(format!(
            "unsupported format version {detected} (supported: {supported})"
        ))
        .with_hint("Open the queue with a ledgerstone release that wrote it, or replay it into a new queue.")
}

pub fn align8(value: usize) -> usize {
    (value + 7) & !7
}

/// Immutable part of a cycle file prologue, written once at creation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StorePrologue {
    pub format_version: u32,
    pub data_version: u32,
    pub cycle: u32,
    pub index_count: u32,
    pub index_spacing: u32,
    pub sequence_bits: u32,
    pub data_start: u64,
}

impl StorePrologue {
    pub fn new(cycle: u32, index_count: u32, index_spacing: u32, sequence_bits: u32) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            data_version: DATA_VERSION,
            cycle,
            index_count,
            index_spacing,
            sequence_bits,
            data_start: data_start(index_count) as u64,
        }
    }

    pub fn encode(&self) -> [u8; PROLOGUE_SIZE] {
        let mut buf = [0u8; PROLOGUE_SIZE];
        buf[0..4].copy_from_slice(&STORE_MAGIC);
        write_u32(&mut buf, 4, self.format_version);
        buf[8] = ENDIANNESS_LE;
        write_u32(&mut buf, 12, self.data_version);
        write_u32(&mut buf, 16, self.cycle);
        write_u32(&mut buf, 20, self.index_count);
        write_u32(&mut buf, 24, self.index_spacing);
        write_u32(&mut buf, 28, self.sequence_bits);
        write_u64(&mut buf, 32, self.data_start);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < PROLOGUE_SIZE {
            return Err(Error::new(ErrorKind::Corrupt).with_message("prologue too small"));
        }
        if buf[0..4] != STORE_MAGIC {
            return Err(Error::new(ErrorKind::Corrupt).with_message("bad cycle file magic"));
        }
        let format_version = read_u32(buf, 4);
        if !SUPPORTED_FORMAT_VERSIONS.contains(&format_version) {
            return Err(format_version_error(format_version));
        }
        if buf[8] != ENDIANNESS_LE {
            return Err(Error::new(ErrorKind::Corrupt).with_message("unsupported endianness"));
        }
        Ok(Self {
            format_version,
            data_version: read_u32(buf, 12),
            cycle: read_u32(buf, 16),
            index_count: read_u32(buf, 20),
            index_spacing: read_u32(buf, 24),
            sequence_bits: read_u32(buf, 28),
            data_start: read_u64(buf, 32),
        })
    }

    pub fn validate(&self, file_size: u64) -> Result<()> {
        if self.index_count == 0 || !self.index_count.is_power_of_two() {
            return Err(Error::new(ErrorKind::Corrupt).with_message("invalid index count"));
        }
        if self.index_spacing == 0 || !self.index_spacing.is_power_of_two() {
            return Err(Error::new(ErrorKind::Corrupt).with_message("invalid index spacing"));
        }
        if self.sequence_bits == 0 || self.sequence_bits >= 64 {
            return Err(Error::new(ErrorKind::Corrupt).with_message("invalid sequence bits"));
        }
        if self.data_start != data_start(self.index_count) as u64 {
            return Err(Error::new(ErrorKind::Corrupt).with_message("data start mismatch"));
        }
        if self.data_start >= file_size {
            return Err(Error::new(ErrorKind::Corrupt).with_message("file smaller than prologue"));
        }
        Ok(())
    }
}

/// First data byte: prologue plus the level-1 index array.
pub fn data_start(index_count: u32) -> usize {
    align8(INDEX_ARRAY_OFFSET + index_count as usize * 8)
}

pub fn encode_lock_prologue() -> [u8; LOCK_FILE_SIZE] {
    let mut buf = [0u8; LOCK_FILE_SIZE];
    buf[0..4].copy_from_slice(&LOCK_MAGIC);
    write_u32(&mut buf, 4, FORMAT_VERSION);
    buf
}

pub fn validate_lock_prologue(buf: &[u8]) -> Result<()> {
    if buf.len() < LOCK_FILE_SIZE || buf[0..4] != LOCK_MAGIC {
        return Err(Error::new(ErrorKind::Corrupt).with_message("bad lock file magic"));
    }
    let version = read_u32(buf, 4);
    if !SUPPORTED_FORMAT_VERSIONS.contains(&version) {
        return Err(format_version_error(version));
    }
    Ok(())
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(out)
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(out)
}

fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}
