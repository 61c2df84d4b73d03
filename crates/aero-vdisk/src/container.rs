use tracing::{debug, info};
use uuid::Uuid;

use crate::checksum::{crc32c_with_zeroed_field, ChecksumKind};
use crate::grain::{GrainDirectory, GrainEngine, GrainGeometry, GrainLayout};
use crate::header::{
    now_unix, read_headers, secondary_header_offset, write_headers, ContainerHeader, CopySource,
    HEADER_SIZE, HEADER_VERSION_CRC32C, HEADER_VERSION_XOR,
};
use crate::log::{
    replay_log, LogDescriptor, LogEntry, LogRegion, LogWriter, ReplayReport, LOG_BLOCK,
};
use crate::metadata::{write_pair, MetadataStore, MetadataWrite};
use crate::region::{
    read_region_directory, RegionDirectory, RegionEntry, BAT_REGION, LOG_REGION,
    METADATA_REGION, REGION_DIRECTORY_SIZE,
};
use crate::util::{align_up_u64, le_u32, le_u64, put_u32, put_u64};
use crate::{DiskError, Extent, Result, StorageBackend, VirtualDisk, ZeroDisk, SECTOR_SIZE};

pub const REGION_DIRECTORY_OFFSET: u64 = 64 * 1024;
pub const METADATA_OFFSET: u64 = 192 * 1024;
pub const LOG_OFFSET: u64 = 256 * 1024;

pub const METADATA_MAGIC: [u8; 4] = *b"meta";
const METADATA_SIZE: usize = 4096;
const BAT_ALIGN: u64 = 4096;

const DEFAULT_GRAIN_SIZE: u64 = 1024 * 1024;
const DEFAULT_GRAINS_PER_TABLE: u32 = 1024;
const DEFAULT_LOG_SIZE: u64 = 1024 * 1024;
const MIN_LOG_SIZE: u64 = 16 * LOG_BLOCK;
const DEFAULT_CREATOR: &str = "aero-vdisk";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerConfig {
    pub capacity_bytes: u64,
    pub grain_size_bytes: u64,
    pub grains_per_table: u32,
    pub log_size_bytes: u64,
    pub creator: String,
    pub checksum: ChecksumKind,
}

impl ContainerConfig {
    /// 1 MiB grains, 1024 entries per table, a 1 MiB log and CRC32C headers.
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            capacity_bytes,
            grain_size_bytes: DEFAULT_GRAIN_SIZE,
            grains_per_table: DEFAULT_GRAINS_PER_TABLE,
            log_size_bytes: DEFAULT_LOG_SIZE,
            creator: DEFAULT_CREATOR.to_owned(),
            checksum: ChecksumKind::Crc32c,
        }
    }

    fn geometry(&self) -> Result<GrainGeometry> {
        if self.capacity_bytes % SECTOR_SIZE as u64 != 0 {
            return Err(DiskError::InvalidConfig(
                "capacity_bytes must be a multiple of 512",
            ));
        }
        if self.log_size_bytes < MIN_LOG_SIZE
            || self.log_size_bytes % LOG_BLOCK != 0
            || self.log_size_bytes > u32::MAX as u64
        {
            return Err(DiskError::InvalidConfig(
                "log_size_bytes must be a multiple of 4096 between 64 KiB and 4 GiB",
            ));
        }
        if u32::try_from(self.grain_size_bytes).is_err() {
            return Err(DiskError::InvalidConfig("grain_size_bytes too large"));
        }
        let geometry = GrainGeometry {
            capacity: self.capacity_bytes,
            grain_size: self.grain_size_bytes,
            grains_per_table: self.grains_per_table,
        };
        geometry.check().map_err(DiskError::InvalidConfig)?;
        Ok(geometry)
    }
}

/// Contents of the metadata region: the virtual geometry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContainerMetadata {
    pub capacity: u64,
    pub grain_size: u32,
    pub grains_per_table: u32,
}

impl ContainerMetadata {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() != METADATA_SIZE || raw[..4] != METADATA_MAGIC {
            return Err(DiskError::InvalidFormat("container metadata magic mismatch"));
        }
        if crc32c_with_zeroed_field(raw, 4) != le_u32(raw, 4) {
            return Err(DiskError::CorruptImage("container metadata checksum mismatch"));
        }
        Ok(Self {
            capacity: le_u64(raw, 8),
            grain_size: le_u32(raw, 16),
            grains_per_table: le_u32(raw, 20),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut raw = vec![0u8; METADATA_SIZE];
        raw[..4].copy_from_slice(&METADATA_MAGIC);
        put_u64(&mut raw, 8, self.capacity);
        put_u32(&mut raw, 16, self.grain_size);
        put_u32(&mut raw, 20, self.grains_per_table);
        let checksum = crc32c_with_zeroed_field(&raw, 4);
        put_u32(&mut raw, 4, checksum);
        raw
    }

    fn geometry(&self) -> GrainGeometry {
        GrainGeometry {
            capacity: self.capacity,
            grain_size: self.grain_size as u64,
            grains_per_table: self.grains_per_table,
        }
    }
}

/// What `open` had to do to get the image into a consistent state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenReport {
    pub header_source: CopySource,
    pub region_source: CopySource,
    pub replay: ReplayReport,
}

/// Journaled metadata: every grain-table update is logged and flushed before it is applied
/// in place.
///
/// The file always ends with a copy of the header, so allocations are placed before it and
/// the copy is rewritten at the new end.
pub struct LoggedMetadata {
    header: ContainerHeader,
    writer: LogWriter,
    durable_len: u64,
}

impl LoggedMetadata {
    pub fn header(&self) -> &ContainerHeader {
        &self.header
    }

    pub fn log_id(&self) -> Uuid {
        self.writer.log_id()
    }

    /// Make everything durable in place, then start a fresh log under a new id and publish
    /// it through both header copies. Older entries no longer match and are never replayed.
    pub fn checkpoint<B: StorageBackend>(&mut self, backend: &mut B) -> Result<()> {
        backend.flush()?;
        let len = backend.len()?;
        let secondary = secondary_header_offset(len)
            .ok_or(DiskError::CorruptImage("container truncated"))?;

        let mut next = self.header.clone();
        next.sequence += 1;
        next.log_id = Uuid::new_v4();
        next.timestamp = now_unix();
        write_headers(backend, &next, secondary)?;

        debug!(sequence = next.sequence, log_id = %next.log_id, "container checkpoint");
        self.writer.reset(next.log_id);
        self.header = next;
        self.durable_len = len;
        Ok(())
    }
}

impl MetadataStore for LoggedMetadata {
    fn allocate<B: StorageBackend>(
        &mut self,
        backend: &mut B,
        len: u64,
        align: u64,
    ) -> Result<u64> {
        let old_secondary = secondary_header_offset(backend.len()?)
            .ok_or(DiskError::CorruptImage("container truncated"))?;
        let offset = align_up_u64(old_secondary, align)?;
        let end = offset.checked_add(len).ok_or(DiskError::OffsetOverflow)?;
        backend.set_len(end + HEADER_SIZE as u64)?;
        backend.write_at(end, &self.header.encode()?)?;

        // The old trailing copy may now sit inside the allocation; callers expect zeros.
        let stale_start = old_secondary.max(offset);
        let stale_end = (old_secondary + HEADER_SIZE as u64).min(end);
        if stale_start < stale_end {
            let zeros = vec![0u8; (stale_end - stale_start) as usize];
            backend.write_at(stale_start, &zeros)?;
        }
        Ok(offset)
    }

    fn commit<B: StorageBackend>(
        &mut self,
        backend: &mut B,
        writes: &[MetadataWrite],
    ) -> Result<()> {
        let mut descriptors = Vec::with_capacity(writes.len() * 2);
        for write in writes {
            for target in std::iter::once(&write.primary).chain(write.mirror.as_ref()) {
                descriptors.push(LogDescriptor::Data {
                    file_offset: target.offset,
                    data: target.bytes.clone(),
                });
            }
        }

        if !self.writer.fits(LogEntry::encoded_len(&descriptors)?)? {
            self.checkpoint(backend)?;
        }
        let last_file_offset = backend.len()?;
        // The append flushes, which also orders any grain data written before it.
        self.writer
            .append(backend, descriptors, self.durable_len, last_file_offset)?;
        for write in writes {
            write_pair(backend, write)?;
        }
        Ok(())
    }

    fn flush<B: StorageBackend>(&mut self, backend: &mut B) -> Result<()> {
        backend.flush()?;
        self.durable_len = backend.len()?;
        if self.writer.is_settled() {
            return Ok(());
        }
        if !self.writer.fits(LOG_BLOCK)? {
            return self.checkpoint(backend);
        }
        self.writer.append_tail(backend, self.durable_len)?;
        Ok(())
    }
}

/// Log-structured container image.
///
/// Layout: header at 0, region directory (and its copy) at 64 KiB and 128 KiB, metadata at
/// 192 KiB, the log at 256 KiB, then the grain directory ("BAT"). Grain tables and grains
/// are appended after that, and the last 4 KiB always hold the second header copy.
///
/// Opening validates both header copies and both region directories (falling back to the
/// redundant copy when needed) and replays the log. If replay applied or rejected anything,
/// or the primary header was damaged, it then checkpoints; otherwise the file is left
/// untouched and the log is appended to where it ended.
pub struct ContainerDisk<B, P = ZeroDisk> {
    engine: GrainEngine<B, LoggedMetadata, P>,
    metadata: ContainerMetadata,
    regions: RegionDirectory,
    report: OpenReport,
}

impl<B: StorageBackend> ContainerDisk<B> {
    pub fn create(backend: B, config: ContainerConfig) -> Result<Self> {
        Self::create_inner(backend, config, None)
    }

    pub fn open(backend: B) -> Result<Self> {
        Self::open_inner(backend, None)
    }
}

impl<B: StorageBackend, P: VirtualDisk> ContainerDisk<B, P> {
    pub fn create_with_parent(backend: B, config: ContainerConfig, parent: P) -> Result<Self> {
        Self::create_inner(backend, config, Some(parent))
    }

    pub fn open_with_parent(backend: B, parent: P) -> Result<Self> {
        Self::open_inner(backend, Some(parent))
    }

    fn create_inner(mut backend: B, config: ContainerConfig, parent: Option<P>) -> Result<Self> {
        let geometry = config.geometry()?;
        if backend.len()? != 0 {
            return Err(DiskError::InvalidConfig("backend must be empty"));
        }

        let bat_offset = LOG_OFFSET + config.log_size_bytes;
        let bat_len = align_up_u64(geometry.directory_bytes(), BAT_ALIGN)?;
        let bat_len32 = u32::try_from(bat_len)
            .map_err(|_| DiskError::InvalidConfig("grain directory too large"))?;
        let data_start = bat_offset + bat_len;
        let file_len = data_start + HEADER_SIZE as u64;

        let regions = RegionDirectory::new(vec![
            RegionEntry {
                id: METADATA_REGION,
                offset: METADATA_OFFSET,
                length: METADATA_SIZE as u32,
                required: true,
            },
            RegionEntry {
                id: LOG_REGION,
                offset: LOG_OFFSET,
                length: config.log_size_bytes as u32,
                required: true,
            },
            RegionEntry {
                id: BAT_REGION,
                offset: bat_offset,
                length: bat_len32,
                required: true,
            },
        ]);
        let metadata = ContainerMetadata {
            capacity: geometry.capacity,
            grain_size: geometry.grain_size as u32,
            grains_per_table: geometry.grains_per_table,
        };
        let version = match config.checksum {
            ChecksumKind::XorFold => HEADER_VERSION_XOR,
            ChecksumKind::Crc32c => HEADER_VERSION_CRC32C,
        };
        let header = ContainerHeader::new(version, REGION_DIRECTORY_OFFSET, &config.creator);
        // Surface an over-long creator before touching the backend.
        header.encode()?;

        backend.set_len(file_len)?;
        let region_raw = regions.encode()?;
        backend.write_at(REGION_DIRECTORY_OFFSET, &region_raw)?;
        backend.write_at(REGION_DIRECTORY_OFFSET + REGION_DIRECTORY_SIZE as u64, &region_raw)?;
        backend.write_at(METADATA_OFFSET, &metadata.encode())?;
        backend.flush()?;
        write_headers(&mut backend, &header, file_len - HEADER_SIZE as u64)?;

        let region = LogRegion {
            offset: LOG_OFFSET,
            size: config.log_size_bytes,
        };
        let store = LoggedMetadata {
            writer: LogWriter::new(region, header.log_id),
            header,
            durable_len: file_len,
        };
        let layout = GrainLayout {
            table_floor: data_start,
            grain_floor: data_start,
        };
        let engine = GrainEngine::new(
            backend,
            store,
            geometry,
            layout,
            GrainDirectory::empty(bat_offset, &geometry),
            None,
            parent,
            None,
        )?;
        Ok(Self {
            engine,
            metadata,
            regions,
            report: OpenReport {
                header_source: CopySource::Primary,
                region_source: CopySource::Primary,
                replay: ReplayReport::default(),
            },
        })
    }

    fn open_inner(mut backend: B, parent: Option<P>) -> Result<Self> {
        let (header, header_source) = read_headers(&mut backend)?;
        if header.region_offset < HEADER_SIZE as u64 {
            return Err(DiskError::CorruptImage("region directory overlaps header"));
        }
        let region_copy = header
            .region_offset
            .checked_add(REGION_DIRECTORY_SIZE as u64)
            .ok_or(DiskError::CorruptImage("region directory offset overflow"))?;
        let (regions, region_source) =
            read_region_directory(&mut backend, header.region_offset, region_copy)?;

        let log_entry = regions.required(LOG_REGION)?;
        let meta_entry = regions.required(METADATA_REGION)?;
        let bat_entry = regions.required(BAT_REGION)?;
        if log_entry.length as u64 % LOG_BLOCK != 0 || (log_entry.length as u64) < LOG_BLOCK {
            return Err(DiskError::CorruptImage("log region size invalid"));
        }
        if (meta_entry.length as usize) < METADATA_SIZE {
            return Err(DiskError::CorruptImage("metadata region too small"));
        }

        let region = LogRegion {
            offset: log_entry.offset,
            size: log_entry.length as u64,
        };
        let replay = replay_log(&mut backend, region, header.log_id)
            .map_err(|e| DiskError::open_failed("log", false, e))?;
        if !replay.applied.is_empty() {
            info!(applied = replay.applied.len(), "container log replayed");
        }

        let mut raw = vec![0u8; METADATA_SIZE];
        backend.read_at(meta_entry.offset, &mut raw)?;
        let metadata = ContainerMetadata::parse(&raw)
            .map_err(|e| DiskError::open_failed("metadata region", false, e))?;
        let geometry = metadata.geometry();
        geometry.check().map_err(DiskError::CorruptImage)?;
        if geometry.directory_bytes() > bat_entry.length as u64 {
            return Err(DiskError::CorruptImage("grain directory larger than BAT region"));
        }
        let directory = GrainDirectory::read(&mut backend, bat_entry.offset, &geometry)
            .map_err(|e| DiskError::open_failed("grain directory", false, e))?;

        let data_start = regions
            .entries()
            .iter()
            .map(RegionEntry::end)
            .chain([region_copy + REGION_DIRECTORY_SIZE as u64])
            .max()
            .unwrap_or(0);
        let layout = GrainLayout {
            table_floor: data_start,
            grain_floor: data_start,
        };

        let durable_len = backend.len()?;
        let mut store = LoggedMetadata {
            writer: LogWriter::new(region, header.log_id),
            header,
            durable_len,
        };
        // A settled log with an intact primary header needs no writes, which keeps clean
        // images openable from read-only media.
        if replay.is_clean() && header_source == CopySource::Primary {
            if let Some(sequence) = replay.last_sequence {
                store.writer.resume(replay.end, sequence);
            }
        } else {
            store.checkpoint(&mut backend)?;
        }

        let engine = GrainEngine::new(
            backend, store, geometry, layout, directory, None, parent, None,
        )?;
        Ok(Self {
            engine,
            metadata,
            regions,
            report: OpenReport {
                header_source,
                region_source,
                replay,
            },
        })
    }

    pub fn open_report(&self) -> &OpenReport {
        &self.report
    }

    pub fn metadata(&self) -> &ContainerMetadata {
        &self.metadata
    }

    pub fn regions(&self) -> &RegionDirectory {
        &self.regions
    }

    pub fn header(&self) -> &ContainerHeader {
        self.engine.store().header()
    }

    pub fn grain_entry(&mut self, grain: u64) -> Result<u32> {
        self.engine.grain_entry(grain)
    }

    pub fn map(&mut self, offset: u64, len: u64) -> Result<Option<Extent>> {
        self.engine.map(offset, len)
    }

    /// Flush and start a fresh log.
    pub fn checkpoint(&mut self) -> Result<()> {
        let (backend, store) = self.engine.backend_and_store();
        store.checkpoint(backend)
    }

    pub fn into_backend(self) -> B {
        self.engine.into_parts().0
    }

    pub fn into_parts(self) -> (B, Option<P>) {
        let (backend, _, parent) = self.engine.into_parts();
        (backend, parent)
    }
}

impl<B: StorageBackend, P: VirtualDisk> VirtualDisk for ContainerDisk<B, P> {
    fn capacity_bytes(&self) -> u64 {
        self.engine.capacity_bytes()
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.engine.read_at(offset, buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.engine.write_at(offset, buf)
    }

    fn flush(&mut self) -> Result<()> {
        self.engine.flush()
    }

    fn extents_in(&mut self, offset: u64, len: u64) -> Result<Vec<Extent>> {
        self.engine.extents_in(offset, len)
    }
}
