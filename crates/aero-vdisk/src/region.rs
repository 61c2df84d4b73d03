use tracing::warn;
use uuid::Uuid;

use crate::checksum::crc32c_with_zeroed_field;
use crate::header::CopySource;
use crate::util::{le_u32, le_u64, put_u32, put_u64};
use crate::{DiskError, Result, StorageBackend};

pub const REGION_DIRECTORY_MAGIC: [u8; 4] = *b"regi";
pub const REGION_DIRECTORY_SIZE: usize = 64 * 1024;
pub const MAX_REGION_ENTRIES: u32 = 2047;

const CHECKSUM_FIELD: usize = 4;
const ENTRIES_OFFSET: usize = 16;
const ENTRY_SIZE: usize = 32;
const FLAG_REQUIRED: u32 = 0x1;

pub const BAT_REGION: Uuid = Uuid::from_u128(0x7a3c_51e2_9b04_4d8f_a1c6_0e52_b8d9_3f10);
pub const LOG_REGION: Uuid = Uuid::from_u128(0x4e81_07d3_62fa_4b19_8c2e_d5a0_91b7_6c24);
pub const METADATA_REGION: Uuid = Uuid::from_u128(0xc29f_4a68_1d3b_4e75_b0f1_6a8e_27c4_d953);
pub const FREE_SPACE_REGION: Uuid = Uuid::from_u128(0x18d6_e3b2_5f40_4a9c_9e73_2b1f_c6a5_087e);

const KNOWN_REGIONS: [Uuid; 4] = [BAT_REGION, LOG_REGION, METADATA_REGION, FREE_SPACE_REGION];
const REQUIRED_REGIONS: [Uuid; 3] = [BAT_REGION, LOG_REGION, METADATA_REGION];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionEntry {
    pub id: Uuid,
    pub offset: u64,
    pub length: u32,
    pub required: bool,
}

impl RegionEntry {
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length as u64)
    }
}

/// Checksummed index of the container's top-level structures.
///
/// Parsing keeps only known regions; unknown optional entries are dropped.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegionDirectory {
    entries: Vec<RegionEntry>,
}

impl RegionDirectory {
    pub fn new(entries: Vec<RegionEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[RegionEntry] {
        &self.entries
    }

    pub fn find(&self, id: Uuid) -> Option<&RegionEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// A region that validation guarantees to be present.
    pub fn required(&self, id: Uuid) -> Result<RegionEntry> {
        self.find(id)
            .copied()
            .ok_or(DiskError::CorruptImage("required region missing"))
    }

    pub fn parse(raw: &[u8], file_len: u64) -> Result<Self> {
        if raw.len() != REGION_DIRECTORY_SIZE {
            return Err(DiskError::InvalidFormat("region directory truncated"));
        }
        if raw[..4] != REGION_DIRECTORY_MAGIC {
            return Err(DiskError::InvalidFormat("region directory magic mismatch"));
        }
        if crc32c_with_zeroed_field(raw, CHECKSUM_FIELD) != le_u32(raw, CHECKSUM_FIELD) {
            return Err(DiskError::CorruptImage("region directory checksum mismatch"));
        }
        let count = le_u32(raw, 8);
        if count > MAX_REGION_ENTRIES {
            return Err(DiskError::CorruptImage("region entry count too large"));
        }

        let mut all: Vec<RegionEntry> = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            let at = ENTRIES_OFFSET + i * ENTRY_SIZE;
            let mut id = [0u8; 16];
            id.copy_from_slice(&raw[at..at + 16]);
            let flags = le_u32(raw, at + 28);
            let entry = RegionEntry {
                id: Uuid::from_bytes_le(id),
                offset: le_u64(raw, at + 16),
                length: le_u32(raw, at + 24),
                required: flags & FLAG_REQUIRED != 0,
            };
            if !KNOWN_REGIONS.contains(&entry.id) {
                if entry.required {
                    return Err(DiskError::Unsupported("unknown required region"));
                }
                continue;
            }
            if all.iter().any(|e| e.id == entry.id) {
                return Err(DiskError::CorruptImage("duplicate region entry"));
            }
            if entry.length == 0 || entry.offset < crate::header::HEADER_SIZE as u64 {
                return Err(DiskError::CorruptImage("region entry out of range"));
            }
            let end = entry
                .offset
                .checked_add(entry.length as u64)
                .ok_or(DiskError::CorruptImage("region entry overflows"))?;
            if end > file_len {
                return Err(DiskError::CorruptImage("region entry beyond end of file"));
            }
            if all.iter().any(|e| entry.offset < e.end() && e.offset < end) {
                return Err(DiskError::CorruptImage("region entries overlap"));
            }
            all.push(entry);
        }

        for id in REQUIRED_REGIONS {
            if !all.iter().any(|e| e.id == id) {
                return Err(DiskError::CorruptImage("required region missing"));
            }
        }
        Ok(Self { entries: all })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.entries.len() > MAX_REGION_ENTRIES as usize {
            return Err(DiskError::InvalidConfig("too many region entries"));
        }
        let mut raw = vec![0u8; REGION_DIRECTORY_SIZE];
        raw[..4].copy_from_slice(&REGION_DIRECTORY_MAGIC);
        put_u32(&mut raw, 8, self.entries.len() as u32);
        for (i, entry) in self.entries.iter().enumerate() {
            let at = ENTRIES_OFFSET + i * ENTRY_SIZE;
            raw[at..at + 16].copy_from_slice(&entry.id.to_bytes_le());
            put_u64(&mut raw, at + 16, entry.offset);
            put_u32(&mut raw, at + 24, entry.length);
            put_u32(&mut raw, at + 28, if entry.required { FLAG_REQUIRED } else { 0 });
        }
        let checksum = crc32c_with_zeroed_field(&raw, CHECKSUM_FIELD);
        put_u32(&mut raw, CHECKSUM_FIELD, checksum);
        Ok(raw)
    }
}

fn read_copy<B: StorageBackend>(
    backend: &mut B,
    offset: u64,
    file_len: u64,
) -> Result<RegionDirectory> {
    let mut raw = vec![0u8; REGION_DIRECTORY_SIZE];
    match backend.read_at(offset, &mut raw) {
        Ok(()) => RegionDirectory::parse(&raw, file_len),
        Err(DiskError::OutOfBounds { .. }) => {
            Err(DiskError::InvalidFormat("region directory truncated"))
        }
        Err(e) => Err(e),
    }
}

/// Load the region directory at `primary`, falling back to the copy at `secondary` when the
/// primary does not validate.
pub fn read_region_directory<B: StorageBackend>(
    backend: &mut B,
    primary: u64,
    secondary: u64,
) -> Result<(RegionDirectory, CopySource)> {
    let file_len = backend.len()?;
    let primary_err = match read_copy(backend, primary, file_len) {
        Ok(dir) => return Ok((dir, CopySource::Primary)),
        Err(e) => e,
    };
    warn!(error = %primary_err, "primary region directory invalid, trying secondary copy");
    match read_copy(backend, secondary, file_len) {
        Ok(dir) => Ok((dir, CopySource::Secondary)),
        Err(_) => Err(DiskError::open_failed("region directory", true, primary_err)),
    }
}
