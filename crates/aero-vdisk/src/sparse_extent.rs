use tracing::warn;

use crate::compression::{GrainDecoder, ZlibGrainDecoder};
use crate::grain::{GrainDirectory, GrainEngine, GrainGeometry, GrainLayout};
use crate::metadata::DirectMetadata;
use crate::util::{align_up_u64, le_u16, le_u32, le_u64, put_u16, put_u32, put_u64};
use crate::{DiskError, Extent, Result, StorageBackend, VirtualDisk, ZeroDisk, SECTOR_SIZE};

pub const SPARSE_EXTENT_MAGIC: [u8; 4] = *b"KDMV";

const SECTOR: u64 = SECTOR_SIZE as u64;
const NEWLINE_CHECK: [u8; 4] = *b"\n \r\n";

pub const FLAG_NEWLINE_CHECK: u32 = 0x1;
pub const FLAG_REDUNDANT_TABLES: u32 = 0x2;
pub const FLAG_COMPRESSED: u32 = 0x1_0000;
pub const FLAG_MARKERS: u32 = 0x2_0000;

pub const COMPRESSION_NONE: u16 = 0;
pub const COMPRESSION_DEFLATE: u16 = 1;

/// Directory stored after the grains (stream-optimised writers).
const GD_AT_END: u64 = u64::MAX;

const DEFAULT_GRAIN_SIZE: u64 = 64 * 1024;
const DEFAULT_GRAINS_PER_TABLE: u32 = 512;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SparseExtentConfig {
    pub capacity_bytes: u64,
    pub grain_size_bytes: u64,
    pub grains_per_table: u32,
    pub redundant_tables: bool,
}

impl SparseExtentConfig {
    /// 64 KiB grains, 512 entries per table, redundant tables on.
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            capacity_bytes,
            grain_size_bytes: DEFAULT_GRAIN_SIZE,
            grains_per_table: DEFAULT_GRAINS_PER_TABLE,
            redundant_tables: true,
        }
    }

    fn geometry(&self) -> Result<GrainGeometry> {
        if self.capacity_bytes % SECTOR != 0 {
            return Err(DiskError::InvalidConfig(
                "capacity_bytes must be a multiple of 512",
            ));
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

/// The 512-byte header at sector 0. Sector-valued fields are kept in sectors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SparseExtentHeader {
    pub version: u32,
    pub flags: u32,
    pub capacity_sectors: u64,
    pub grain_sectors: u64,
    pub descriptor_offset: u64,
    pub descriptor_size: u64,
    pub grains_per_table: u32,
    pub redundant_directory_sector: u64,
    pub directory_sector: u64,
    pub overhead_sectors: u64,
    pub unclean_shutdown: bool,
    pub compression: u16,
}

impl SparseExtentHeader {
    pub fn parse(raw: &[u8; SECTOR_SIZE]) -> Result<Self> {
        if raw[..4] != SPARSE_EXTENT_MAGIC {
            return Err(DiskError::InvalidFormat("sparse extent magic mismatch"));
        }
        let header = Self {
            version: le_u32(raw, 4),
            flags: le_u32(raw, 8),
            capacity_sectors: le_u64(raw, 12),
            grain_sectors: le_u64(raw, 20),
            descriptor_offset: le_u64(raw, 28),
            descriptor_size: le_u64(raw, 36),
            grains_per_table: le_u32(raw, 44),
            redundant_directory_sector: le_u64(raw, 48),
            directory_sector: le_u64(raw, 56),
            overhead_sectors: le_u64(raw, 64),
            unclean_shutdown: raw[72] != 0,
            compression: le_u16(raw, 77),
        };

        if !(1..=3).contains(&header.version) {
            return Err(DiskError::Unsupported("sparse extent version"));
        }
        if header.flags & FLAG_NEWLINE_CHECK != 0 && raw[73..77] != NEWLINE_CHECK {
            return Err(DiskError::CorruptImage("sparse extent newline check failed"));
        }
        let compressed = header.flags & FLAG_COMPRESSED != 0;
        match (compressed, header.compression) {
            (false, COMPRESSION_NONE) | (true, COMPRESSION_DEFLATE) => {}
            (_, COMPRESSION_NONE | COMPRESSION_DEFLATE) => {
                return Err(DiskError::Unsupported(
                    "sparse extent compression flag does not match algorithm",
                ))
            }
            _ => return Err(DiskError::Unsupported("sparse extent compression algorithm")),
        }
        if header.directory_sector == GD_AT_END {
            return Err(DiskError::Unsupported("grain directory at end of file"));
        }
        Ok(header)
    }

    pub fn encode(&self) -> [u8; SECTOR_SIZE] {
        let mut raw = [0u8; SECTOR_SIZE];
        raw[..4].copy_from_slice(&SPARSE_EXTENT_MAGIC);
        put_u32(&mut raw, 4, self.version);
        put_u32(&mut raw, 8, self.flags);
        put_u64(&mut raw, 12, self.capacity_sectors);
        put_u64(&mut raw, 20, self.grain_sectors);
        put_u64(&mut raw, 28, self.descriptor_offset);
        put_u64(&mut raw, 36, self.descriptor_size);
        put_u32(&mut raw, 44, self.grains_per_table);
        put_u64(&mut raw, 48, self.redundant_directory_sector);
        put_u64(&mut raw, 56, self.directory_sector);
        put_u64(&mut raw, 64, self.overhead_sectors);
        raw[72] = self.unclean_shutdown as u8;
        raw[73..77].copy_from_slice(&NEWLINE_CHECK);
        put_u16(&mut raw, 77, self.compression);
        raw
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    pub fn has_redundant_tables(&self) -> bool {
        self.flags & FLAG_REDUNDANT_TABLES != 0
    }

    fn geometry(&self) -> Result<GrainGeometry> {
        let geometry = GrainGeometry {
            capacity: self
                .capacity_sectors
                .checked_mul(SECTOR)
                .ok_or(DiskError::CorruptImage("sparse extent capacity overflow"))?,
            grain_size: self
                .grain_sectors
                .checked_mul(SECTOR)
                .ok_or(DiskError::CorruptImage("sparse extent grain size overflow"))?,
            grains_per_table: self.grains_per_table,
        };
        geometry.check().map_err(DiskError::CorruptImage)?;
        Ok(geometry)
    }
}

/// Hosted sparse extent (`KDMV`) image: a grain engine with in-place metadata, optional
/// redundant tables and an optional read-through parent.
///
/// Compressed extents open read-only. The header's unclean-shutdown byte is set before the
/// first write after open or flush, and cleared again by [`VirtualDisk::flush`].
pub struct SparseExtentDisk<B, P = ZeroDisk> {
    engine: GrainEngine<B, DirectMetadata, P>,
    header: SparseExtentHeader,
    dirty: bool,
    opened_unclean: bool,
}

impl<B: StorageBackend> SparseExtentDisk<B> {
    pub fn create(backend: B, config: SparseExtentConfig) -> Result<Self> {
        Self::create_inner(backend, config, None)
    }

    pub fn open(backend: B) -> Result<Self> {
        Self::open_inner(backend, None)
    }
}

impl<B: StorageBackend, P: VirtualDisk> SparseExtentDisk<B, P> {
    /// Create a differencing image whose unallocated grains read through to `parent`.
    pub fn create_with_parent(backend: B, config: SparseExtentConfig, parent: P) -> Result<Self> {
        Self::create_inner(backend, config, Some(parent))
    }

    pub fn open_with_parent(backend: B, parent: P) -> Result<Self> {
        Self::open_inner(backend, Some(parent))
    }

    fn create_inner(mut backend: B, config: SparseExtentConfig, parent: Option<P>) -> Result<Self> {
        let geometry = config.geometry()?;
        if backend.len()? != 0 {
            return Err(DiskError::InvalidConfig("backend must be empty"));
        }
        let dir_sectors = geometry.directory_bytes() / SECTOR;

        let mut flags = FLAG_NEWLINE_CHECK;
        let mut next_sector = 1u64;
        let redundant_directory_sector = if config.redundant_tables {
            flags |= FLAG_REDUNDANT_TABLES;
            let s = next_sector;
            next_sector += dir_sectors;
            s
        } else {
            0
        };
        let directory_sector = next_sector;
        next_sector += dir_sectors;
        let overhead = align_up_u64(next_sector * SECTOR, geometry.grain_size)?;

        let header = SparseExtentHeader {
            version: 1,
            flags,
            capacity_sectors: geometry.capacity / SECTOR,
            grain_sectors: geometry.grain_size / SECTOR,
            descriptor_offset: 0,
            descriptor_size: 0,
            grains_per_table: geometry.grains_per_table,
            redundant_directory_sector,
            directory_sector,
            overhead_sectors: overhead / SECTOR,
            unclean_shutdown: false,
            compression: COMPRESSION_NONE,
        };

        // Zero-filled directories: every table starts unallocated.
        backend.set_len(overhead)?;
        backend.write_at(0, &header.encode())?;
        backend.flush()?;

        let directory = GrainDirectory::empty(directory_sector * SECTOR, &geometry);
        let mirror = config
            .redundant_tables
            .then(|| GrainDirectory::empty(redundant_directory_sector * SECTOR, &geometry));
        let layout = GrainLayout {
            table_floor: SECTOR,
            grain_floor: overhead,
        };
        let engine = GrainEngine::new(
            backend,
            DirectMetadata,
            geometry,
            layout,
            directory,
            mirror,
            parent,
            None,
        )?;
        Ok(Self {
            engine,
            header,
            dirty: false,
            opened_unclean: false,
        })
    }

    fn open_inner(mut backend: B, parent: Option<P>) -> Result<Self> {
        let mut raw = [0u8; SECTOR_SIZE];
        match backend.read_at(0, &mut raw) {
            Ok(()) => {}
            Err(DiskError::OutOfBounds { .. }) => {
                return Err(DiskError::InvalidFormat("sparse extent header truncated"))
            }
            Err(e) => return Err(e),
        }
        let header = SparseExtentHeader::parse(&raw)?;
        let geometry = header.geometry()?;

        let directory_offset = header
            .directory_sector
            .checked_mul(SECTOR)
            .ok_or(DiskError::CorruptImage("grain directory offset overflow"))?;
        if directory_offset < SECTOR {
            return Err(DiskError::CorruptImage("grain directory overlaps header"));
        }
        let directory = GrainDirectory::read(&mut backend, directory_offset, &geometry)
            .map_err(|e| DiskError::open_failed("grain directory", false, e))?;

        let mirror = if header.has_redundant_tables() {
            let offset = header
                .redundant_directory_sector
                .checked_mul(SECTOR)
                .ok_or(DiskError::CorruptImage("redundant directory offset overflow"))?;
            if offset < SECTOR {
                return Err(DiskError::CorruptImage("redundant directory overlaps header"));
            }
            Some(
                GrainDirectory::read(&mut backend, offset, &geometry)
                    .map_err(|e| DiskError::open_failed("redundant grain directory", false, e))?,
            )
        } else {
            None
        };

        let overhead = header
            .overhead_sectors
            .checked_mul(SECTOR)
            .ok_or(DiskError::CorruptImage("sparse extent overhead overflow"))?;
        let layout = GrainLayout {
            table_floor: SECTOR,
            grain_floor: overhead.max(SECTOR),
        };

        if header.unclean_shutdown {
            warn!("sparse extent was not closed cleanly");
        }

        let decoder = header
            .is_compressed()
            .then(|| Box::new(ZlibGrainDecoder) as Box<dyn GrainDecoder>);
        let engine = GrainEngine::new(
            backend,
            DirectMetadata,
            geometry,
            layout,
            directory,
            mirror,
            parent,
            decoder,
        )?;
        Ok(Self {
            engine,
            opened_unclean: header.unclean_shutdown,
            header,
            dirty: false,
        })
    }

    pub fn header(&self) -> &SparseExtentHeader {
        &self.header
    }

    /// Whether the image carried the unclean-shutdown marker when it was opened.
    pub fn opened_unclean(&self) -> bool {
        self.opened_unclean
    }

    pub fn grain_size(&self) -> u64 {
        self.engine.geometry().grain_size
    }

    /// Sector offset stored for `grain`, or 0 when it is unallocated.
    pub fn grain_entry(&mut self, grain: u64) -> Result<u32> {
        self.engine.grain_entry(grain)
    }

    /// See [`GrainEngine::map`].
    pub fn map(&mut self, offset: u64, len: u64) -> Result<Option<Extent>> {
        self.engine.map(offset, len)
    }

    pub fn into_backend(self) -> B {
        self.engine.into_parts().0
    }

    pub fn into_parts(self) -> (B, Option<P>) {
        let (backend, _, parent) = self.engine.into_parts();
        (backend, parent)
    }

    fn write_header(&mut self, unclean: bool) -> Result<()> {
        self.header.unclean_shutdown = unclean;
        let raw = self.header.encode();
        let backend = self.engine.backend_mut();
        backend.write_at(0, &raw)?;
        backend.flush()
    }
}

impl<B: StorageBackend, P: VirtualDisk> VirtualDisk for SparseExtentDisk<B, P> {
    fn capacity_bytes(&self) -> u64 {
        self.engine.capacity_bytes()
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.engine.read_at(offset, buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.engine.is_writable() {
            return Err(DiskError::ReadOnly("compressed sparse extent"));
        }
        if !self.dirty && !buf.is_empty() {
            self.write_header(true)?;
            self.dirty = true;
        }
        self.engine.write_at(offset, buf)
    }

    fn flush(&mut self) -> Result<()> {
        self.engine.flush()?;
        if self.dirty {
            self.write_header(false)?;
            self.dirty = false;
        }
        Ok(())
    }

    fn is_writable(&self) -> bool {
        self.engine.is_writable()
    }

    fn extents_in(&mut self, offset: u64, len: u64) -> Result<Vec<Extent>> {
        self.engine.extents_in(offset, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemBackend;

    fn small_config() -> SparseExtentConfig {
        SparseExtentConfig {
            capacity_bytes: 1 << 20,
            grain_size_bytes: 4096,
            grains_per_table: 16,
            redundant_tables: true,
        }
    }

    #[test]
    fn header_layout_is_bit_exact() {
        let disk = SparseExtentDisk::create(MemBackend::new(), small_config()).unwrap();
        let raw = disk.header().encode();
        assert_eq!(&raw[..4], b"KDMV");
        assert_eq!(le_u32(&raw, 4), 1);
        assert_eq!(le_u32(&raw, 8), FLAG_NEWLINE_CHECK | FLAG_REDUNDANT_TABLES);
        assert_eq!(le_u64(&raw, 12), (1 << 20) / 512);
        assert_eq!(le_u64(&raw, 20), 8);
        assert_eq!(le_u32(&raw, 44), 16);
        assert_eq!(le_u64(&raw, 48), 1);
        assert_eq!(le_u64(&raw, 56), 2);
        assert_eq!(&raw[73..77], b"\n \r\n");
        assert_eq!(le_u16(&raw, 77), 0);
    }

    #[test]
    fn create_rejects_invalid_config() {
        let mut cfg = small_config();
        cfg.grain_size_bytes = 3000;
        assert!(matches!(
            SparseExtentDisk::create(MemBackend::new(), cfg).err(),
            Some(DiskError::InvalidConfig(_))
        ));
        cfg = small_config();
        cfg.capacity_bytes = 1000;
        assert!(matches!(
            SparseExtentDisk::create(MemBackend::new(), cfg).err(),
            Some(DiskError::InvalidConfig(_))
        ));
    }

    #[test]
    fn data_survives_reopen() {
        let mut disk = SparseExtentDisk::create(MemBackend::new(), small_config()).unwrap();
        disk.write_at(70_000, b"hello").unwrap();
        disk.flush().unwrap();

        let mut disk = SparseExtentDisk::open(disk.into_backend()).unwrap();
        assert!(!disk.opened_unclean());
        let mut buf = [0u8; 5];
        disk.read_at(70_000, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn unclean_flag_tracks_unflushed_writes() {
        let mut disk = SparseExtentDisk::create(MemBackend::new(), small_config()).unwrap();
        disk.write_at(0, &[1]).unwrap();
        let snapshot = disk.engine.backend_mut().clone();
        assert!(SparseExtentDisk::open(snapshot).unwrap().opened_unclean());

        disk.flush().unwrap();
        let reopened = SparseExtentDisk::open(disk.into_backend()).unwrap();
        assert!(!reopened.opened_unclean());
    }

    #[test]
    fn rejects_bad_magic_and_newline_check() {
        let disk = SparseExtentDisk::create(MemBackend::new(), small_config()).unwrap();
        let mut bytes = disk.into_backend().into_vec();

        let mut bad_nl = bytes.clone();
        bad_nl[74] = b'x';
        assert!(matches!(
            SparseExtentDisk::open(MemBackend::from_vec(bad_nl)).err(),
            Some(DiskError::CorruptImage(_))
        ));

        bytes[0] = b'X';
        assert!(matches!(
            SparseExtentDisk::open(MemBackend::from_vec(bytes)).err(),
            Some(DiskError::InvalidFormat(_))
        ));
    }

    #[test]
    fn rejects_unknown_compression_and_mismatched_flags() {
        let disk = SparseExtentDisk::create(MemBackend::new(), small_config()).unwrap();
        let bytes = disk.into_backend().into_vec();

        let mut unknown = bytes.clone();
        put_u16(&mut unknown, 77, 7);
        assert!(matches!(
            SparseExtentDisk::open(MemBackend::from_vec(unknown)).err(),
            Some(DiskError::Unsupported(_))
        ));

        let mut mismatch = bytes;
        put_u16(&mut mismatch, 77, COMPRESSION_DEFLATE);
        assert!(matches!(
            SparseExtentDisk::open(MemBackend::from_vec(mismatch)).err(),
            Some(DiskError::Unsupported(_))
        ));
    }

    #[test]
    fn directory_at_end_of_file_is_unsupported() {
        let disk = SparseExtentDisk::create(MemBackend::new(), small_config()).unwrap();
        let mut bytes = disk.into_backend().into_vec();
        put_u64(&mut bytes, 56, GD_AT_END);
        assert!(matches!(
            SparseExtentDisk::open(MemBackend::from_vec(bytes)).err(),
            Some(DiskError::Unsupported(_))
        ));
    }
}
