use std::time::{SystemTime, UNIX_EPOCH};

use tracing::warn;
use uuid::Uuid;

use crate::checksum::ChecksumKind;
use crate::util::{le_u16, le_u32, le_u64, put_u16, put_u32, put_u64};
use crate::{DiskError, Result, StorageBackend};

pub const CONTAINER_MAGIC: [u8; 4] = *b"AVCH";
pub const HEADER_SIZE: usize = 4096;

const CHECKSUM_FIELD: usize = 4;
const CREATOR_OFFSET: usize = 80;
const CREATOR_UNITS: usize = 64;

pub const HEADER_VERSION_XOR: u16 = 1;
pub const HEADER_VERSION_CRC32C: u16 = 2;

/// Which on-disk copy a structure was loaded from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CopySource {
    Primary,
    Secondary,
}

/// Container header. One copy lives at offset 0, the other in the last 4 KiB of the file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerHeader {
    pub sequence: u64,
    pub timestamp: u64,
    pub file_write_id: Uuid,
    pub log_id: Uuid,
    pub region_offset: u64,
    pub version: u16,
    pub creator: String,
}

impl ContainerHeader {
    pub fn new(version: u16, region_offset: u64, creator: &str) -> Self {
        Self {
            sequence: 1,
            timestamp: now_unix(),
            file_write_id: Uuid::new_v4(),
            log_id: Uuid::new_v4(),
            region_offset,
            version,
            creator: creator.to_owned(),
        }
    }

    pub fn checksum_kind(version: u16) -> Result<ChecksumKind> {
        match version {
            HEADER_VERSION_XOR => Ok(ChecksumKind::XorFold),
            HEADER_VERSION_CRC32C => Ok(ChecksumKind::Crc32c),
            _ => Err(DiskError::Unsupported("container header version")),
        }
    }

    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() != HEADER_SIZE {
            return Err(DiskError::InvalidFormat("container header truncated"));
        }
        if raw[..4] != CONTAINER_MAGIC {
            return Err(DiskError::InvalidFormat("container header magic mismatch"));
        }
        let version = le_u16(raw, 72);
        let kind = Self::checksum_kind(version)?;
        if kind.compute(raw, CHECKSUM_FIELD) != le_u32(raw, CHECKSUM_FIELD) {
            return Err(DiskError::CorruptImage("container header checksum mismatch"));
        }
        let sequence1 = le_u64(raw, 8);
        let sequence2 = le_u64(raw, 16);
        if sequence1 != sequence2 {
            return Err(DiskError::CorruptImage("container header update was torn"));
        }

        let units: Vec<u16> = (0..CREATOR_UNITS)
            .map(|i| le_u16(raw, CREATOR_OFFSET + i * 2))
            .take_while(|u| *u != 0)
            .collect();
        let creator = String::from_utf16(&units)
            .map_err(|_| DiskError::CorruptImage("container creator is not UTF-16"))?;

        Ok(Self {
            sequence: sequence1,
            timestamp: le_u64(raw, 24),
            file_write_id: uuid_le(&raw[32..48]),
            log_id: uuid_le(&raw[48..64]),
            region_offset: le_u64(raw, 64),
            version,
            creator,
        })
    }

    /// Final image of this header (both sequence counters equal).
    pub fn encode(&self) -> Result<Vec<u8>> {
        self.encode_with_sequences(self.sequence, self.sequence)
    }

    fn encode_with_sequences(&self, sequence1: u64, sequence2: u64) -> Result<Vec<u8>> {
        let kind = Self::checksum_kind(self.version)?;
        let mut raw = vec![0u8; HEADER_SIZE];
        raw[..4].copy_from_slice(&CONTAINER_MAGIC);
        put_u64(&mut raw, 8, sequence1);
        put_u64(&mut raw, 16, sequence2);
        put_u64(&mut raw, 24, self.timestamp);
        raw[32..48].copy_from_slice(&self.file_write_id.to_bytes_le());
        raw[48..64].copy_from_slice(&self.log_id.to_bytes_le());
        put_u64(&mut raw, 64, self.region_offset);
        put_u16(&mut raw, 72, self.version);

        let units: Vec<u16> = self.creator.encode_utf16().collect();
        if units.len() > CREATOR_UNITS {
            return Err(DiskError::InvalidConfig("creator longer than 64 UTF-16 units"));
        }
        for (i, unit) in units.iter().enumerate() {
            put_u16(&mut raw, CREATOR_OFFSET + i * 2, *unit);
        }

        let checksum = kind.compute(&raw, CHECKSUM_FIELD);
        put_u32(&mut raw, CHECKSUM_FIELD, checksum);
        Ok(raw)
    }
}

fn uuid_le(bytes: &[u8]) -> Uuid {
    let mut b = [0u8; 16];
    b.copy_from_slice(bytes);
    Uuid::from_bytes_le(b)
}

pub(crate) fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Offset of the trailing header copy for a file of `file_len` bytes.
pub fn secondary_header_offset(file_len: u64) -> Option<u64> {
    file_len
        .checked_sub(HEADER_SIZE as u64)
        .filter(|off| *off >= HEADER_SIZE as u64)
}

fn read_copy<B: StorageBackend>(backend: &mut B, offset: u64) -> Result<ContainerHeader> {
    let mut raw = vec![0u8; HEADER_SIZE];
    match backend.read_at(offset, &mut raw) {
        Ok(()) => ContainerHeader::parse(&raw),
        Err(DiskError::OutOfBounds { .. }) => {
            Err(DiskError::InvalidFormat("container header truncated"))
        }
        Err(e) => Err(e),
    }
}

/// Load the newest valid header copy.
///
/// Both copies are checked; when both are valid the higher sequence wins (the primary on a
/// tie). Fails only if neither copy validates, reporting the primary's error.
pub fn read_headers<B: StorageBackend>(backend: &mut B) -> Result<(ContainerHeader, CopySource)> {
    let len = backend.len()?;
    let primary = read_copy(backend, 0);
    let secondary = match secondary_header_offset(len) {
        Some(off) => read_copy(backend, off),
        None => Err(DiskError::InvalidFormat("container too small for header copy")),
    };

    match (primary, secondary) {
        (Ok(p), Ok(s)) if s.sequence > p.sequence => {
            warn!(primary = p.sequence, secondary = s.sequence, "using newer secondary header");
            Ok((s, CopySource::Secondary))
        }
        (Ok(p), _) => Ok((p, CopySource::Primary)),
        (Err(e), Ok(s)) => {
            warn!(error = %e, "primary header invalid, using secondary copy");
            Ok((s, CopySource::Secondary))
        }
        (Err(e), Err(_)) => Err(DiskError::open_failed("container header", true, e)),
    }
}

/// Write `header` to both copies with the two-phase torn-write protocol: each copy first
/// gets an in-progress image (`sequence1 = n`, `sequence2 = n - 1`), then the final one.
/// The primary is completed before the secondary is touched.
pub fn write_headers<B: StorageBackend>(
    backend: &mut B,
    header: &ContainerHeader,
    secondary_offset: u64,
) -> Result<()> {
    let in_progress =
        header.encode_with_sequences(header.sequence, header.sequence.saturating_sub(1))?;
    let done = header.encode()?;
    for offset in [0, secondary_offset] {
        backend.write_at(offset, &in_progress)?;
        backend.flush()?;
        backend.write_at(offset, &done)?;
        backend.flush()?;
    }
    Ok(())
}
