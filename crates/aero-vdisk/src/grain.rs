use std::num::NonZeroUsize;

use lru::LruCache;
use tracing::debug;

use crate::compression::GrainDecoder;
use crate::disk::check_window;
use crate::metadata::{MetadataStore, MetadataWrite, WriteTarget};
use crate::util::{checked_range, le_u32, le_u64, try_zeroed_vec};
use crate::{DiskError, Extent, ExtentSet, Result, StorageBackend, VirtualDisk, SECTOR_SIZE};

/// Table and directory value meaning "not allocated".
pub const GRAIN_UNALLOCATED: u32 = 0;

/// `lba: u64` followed by `size: u32`, then the compressed payload.
pub const GRAIN_MARKER_LEN: u64 = 12;

const SECTOR: u64 = SECTOR_SIZE as u64;
const MAX_DIRECTORY_BYTES: u64 = 128 * 1024 * 1024;
const MAX_TABLE_ENTRIES: u32 = 1 << 22;
const MAX_GRAIN_SIZE: u64 = 256 * 1024 * 1024;
const TABLE_CACHE_ENTRIES: usize = 64;

/// Shape of a two-level grain map.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GrainGeometry {
    pub capacity: u64,
    pub grain_size: u64,
    pub grains_per_table: u32,
}

impl GrainGeometry {
    /// Checks the invariants every format relies on. Callers map the message onto
    /// `InvalidConfig` (create) or `CorruptImage`/`Unsupported` (open).
    pub fn check(&self) -> std::result::Result<(), &'static str> {
        if self.grain_size < SECTOR || !self.grain_size.is_power_of_two() {
            return Err("grain size must be a power of two and at least 512 bytes");
        }
        if self.grain_size > MAX_GRAIN_SIZE {
            return Err("grain size too large");
        }
        if self.grains_per_table == 0 || self.grains_per_table > MAX_TABLE_ENTRIES {
            return Err("grains per table out of range");
        }
        if self.capacity == 0 {
            return Err("capacity must be non-zero");
        }
        let entries = self.directory_entries().ok_or("capacity too large")?;
        if entries.saturating_mul(4) > MAX_DIRECTORY_BYTES {
            return Err("grain directory too large");
        }
        Ok(())
    }

    /// Logical bytes covered by one grain table.
    pub fn table_coverage(&self) -> u64 {
        self.grain_size.saturating_mul(self.grains_per_table as u64)
    }

    pub fn directory_entries(&self) -> Option<u64> {
        let coverage = self.table_coverage();
        (coverage != 0).then(|| self.capacity.div_ceil(coverage))
    }

    /// On-disk size of the directory, rounded up to a whole sector.
    pub fn directory_bytes(&self) -> u64 {
        let entries = self.directory_entries().unwrap_or(0);
        (entries * 4).div_ceil(SECTOR) * SECTOR
    }

    /// On-disk size of one grain table, rounded up to a whole sector.
    pub fn table_bytes(&self) -> u64 {
        (self.grains_per_table as u64 * 4).div_ceil(SECTOR) * SECTOR
    }
}

/// Where allocations may legally point. Anything below these floors is format metadata.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GrainLayout {
    pub table_floor: u64,
    pub grain_floor: u64,
}

/// A loaded grain directory and the file offset it lives at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GrainDirectory {
    pub offset: u64,
    pub entries: Vec<u32>,
}

impl GrainDirectory {
    /// An all-unallocated directory, as written by `create`.
    pub fn empty(offset: u64, geometry: &GrainGeometry) -> Self {
        let entries = geometry.directory_entries().unwrap_or(0) as usize;
        Self {
            offset,
            entries: vec![GRAIN_UNALLOCATED; entries],
        }
    }

    pub fn read<B: StorageBackend>(
        backend: &mut B,
        offset: u64,
        geometry: &GrainGeometry,
    ) -> Result<Self> {
        let count = geometry
            .directory_entries()
            .ok_or(DiskError::CorruptImage("grain directory size overflow"))?;
        let bytes = count
            .checked_mul(4)
            .ok_or(DiskError::OffsetOverflow)?;
        if bytes > MAX_DIRECTORY_BYTES {
            return Err(DiskError::Unsupported("grain directory too large"));
        }
        let mut raw = try_zeroed_vec(bytes)?;
        match backend.read_at(offset, &mut raw) {
            Ok(()) => {}
            Err(DiskError::OutOfBounds { .. }) => {
                return Err(DiskError::CorruptImage("grain directory truncated"))
            }
            Err(e) => return Err(e),
        }
        Ok(Self {
            offset,
            entries: decode_entries(&raw),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_entries(&self.entries)
    }
}

fn decode_entries(raw: &[u8]) -> Vec<u32> {
    raw.chunks_exact(4).map(|c| le_u32(c, 0)).collect()
}

fn encode_entries(entries: &[u32]) -> Vec<u8> {
    entries.iter().flat_map(|e| e.to_le_bytes()).collect()
}

fn to_sector(offset: u64) -> Result<u32> {
    if offset % SECTOR != 0 {
        return Err(DiskError::CorruptImage("allocation not sector aligned"));
    }
    u32::try_from(offset / SECTOR)
        .map_err(|_| DiskError::Unsupported("offset beyond 32-bit sector range"))
}

/// Sparse grain-mapped address space with optional copy-on-write parent.
///
/// Logical bytes are split into fixed-size grains. A directory of sector offsets points at
/// grain tables, and each table entry points at the grain's backing data (or is
/// [`GRAIN_UNALLOCATED`]). Unallocated grains read through to `parent`, or as zeros.
///
/// First writes to a grain allocate it at the end of the backing file, copy the parent's
/// content for the whole grain, and then persist the table update through `S`. In-memory
/// tables only change once `S` reports success, so a failed write leaves the engine as it
/// was.
pub struct GrainEngine<B, S, P> {
    backend: B,
    store: S,
    parent: Option<P>,
    geometry: GrainGeometry,
    layout: GrainLayout,
    directory: GrainDirectory,
    mirror: Option<GrainDirectory>,
    tables: LruCache<u64, Vec<u32>>,
    decoder: Option<Box<dyn GrainDecoder>>,
}

impl<B: StorageBackend, S: MetadataStore, P: VirtualDisk> GrainEngine<B, S, P> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backend: B,
        store: S,
        geometry: GrainGeometry,
        layout: GrainLayout,
        directory: GrainDirectory,
        mirror: Option<GrainDirectory>,
        parent: Option<P>,
        decoder: Option<Box<dyn GrainDecoder>>,
    ) -> Result<Self> {
        geometry.check().map_err(DiskError::InvalidConfig)?;
        let entries = geometry.directory_entries().unwrap_or(0) as usize;
        if directory.entries.len() != entries
            || mirror.as_ref().is_some_and(|m| m.entries.len() != entries)
        {
            return Err(DiskError::InvalidConfig("grain directory size mismatch"));
        }
        let cache_len = NonZeroUsize::new(TABLE_CACHE_ENTRIES)
            .ok_or(DiskError::InvalidConfig("table cache size must be > 0"))?;
        Ok(Self {
            backend,
            store,
            parent,
            geometry,
            layout,
            directory,
            mirror,
            tables: LruCache::new(cache_len),
            decoder,
        })
    }

    pub fn geometry(&self) -> &GrainGeometry {
        &self.geometry
    }

    pub fn directory(&self) -> &GrainDirectory {
        &self.directory
    }

    pub fn mirror_directory(&self) -> Option<&GrainDirectory> {
        self.mirror.as_ref()
    }

    pub fn is_compressed(&self) -> bool {
        self.decoder.is_some()
    }

    pub fn parent(&self) -> Option<&P> {
        self.parent.as_ref()
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Split borrow for formats that need both at once.
    pub fn backend_and_store(&mut self) -> (&mut B, &mut S) {
        (&mut self.backend, &mut self.store)
    }

    pub fn into_parts(self) -> (B, S, Option<P>) {
        (self.backend, self.store, self.parent)
    }

    /// Raw table entry (sector offset or [`GRAIN_UNALLOCATED`]) for grain `grain`.
    pub fn grain_entry(&mut self, grain: u64) -> Result<u32> {
        let gpt = self.geometry.grains_per_table as u64;
        let table_idx = grain / gpt;
        let dir_entry = self.directory_entry(table_idx)?;
        if dir_entry == GRAIN_UNALLOCATED {
            return Ok(GRAIN_UNALLOCATED);
        }
        let table = self.load_table(table_idx, dir_entry)?;
        Ok(table[(grain % gpt) as usize])
    }

    fn directory_entry(&self, table_idx: u64) -> Result<u32> {
        usize::try_from(table_idx)
            .ok()
            .and_then(|i| self.directory.entries.get(i).copied())
            .ok_or(DiskError::CorruptImage("grain directory index out of range"))
    }

    fn backend_read_at(&mut self, offset: u64, buf: &mut [u8], ctx: &'static str) -> Result<()> {
        match self.backend.read_at(offset, buf) {
            Ok(()) => Ok(()),
            Err(DiskError::OutOfBounds { .. }) => Err(DiskError::CorruptImage(ctx)),
            Err(e) => Err(e),
        }
    }

    /// Validates a directory entry and returns its table's byte offset.
    fn table_offset(&self, dir_entry: u32) -> Result<u64> {
        if dir_entry == GRAIN_UNALLOCATED {
            return Err(DiskError::CorruptImage("grain table unallocated"));
        }
        let offset = dir_entry as u64 * SECTOR;
        if offset < self.layout.table_floor {
            return Err(DiskError::CorruptImage("grain table overlaps metadata"));
        }
        Ok(offset)
    }

    fn load_table(&mut self, table_idx: u64, dir_entry: u32) -> Result<&Vec<u32>> {
        if !self.tables.contains(&table_idx) {
            let offset = self.table_offset(dir_entry)?;
            let mut raw = try_zeroed_vec(self.geometry.grains_per_table as u64 * 4)?;
            self.backend_read_at(offset, &mut raw, "grain table truncated")?;
            self.tables.push(table_idx, decode_entries(&raw));
        }
        self.tables
            .get(&table_idx)
            .ok_or(DiskError::Io("grain table missing after load".into()))
    }

    /// Validates a data grain entry and returns its byte offset.
    fn grain_offset(&mut self, entry: u32) -> Result<u64> {
        let offset = entry as u64 * SECTOR;
        if offset < self.layout.grain_floor {
            return Err(DiskError::CorruptImage("grain overlaps metadata"));
        }
        let end = offset
            .checked_add(self.geometry.grain_size)
            .ok_or(DiskError::OffsetOverflow)?;
        if end > self.backend.len()? {
            return Err(DiskError::CorruptImage("grain beyond end of file"));
        }
        Ok(offset)
    }

    /// Reads and validates the marker of a compressed grain: `(marker offset, payload size)`.
    fn grain_marker(&mut self, grain: u64, entry: u32) -> Result<(u64, u64)> {
        let marker = entry as u64 * SECTOR;
        if marker < self.layout.grain_floor {
            return Err(DiskError::CorruptImage("grain marker overlaps metadata"));
        }
        let mut header = [0u8; GRAIN_MARKER_LEN as usize];
        self.backend_read_at(marker, &mut header, "grain marker truncated")?;
        let lba = le_u64(&header, 0);
        let size = le_u32(&header, 8) as u64;
        if lba != grain * (self.geometry.grain_size / SECTOR) {
            return Err(DiskError::CorruptImage("grain marker lba mismatch"));
        }
        // Deflate can expand incompressible input slightly; anything beyond this is bogus.
        let max_size = self.geometry.grain_size * 2 + SECTOR;
        if size == 0 || size > max_size {
            return Err(DiskError::CorruptImage("grain marker size out of range"));
        }
        Ok((marker, size))
    }

    fn read_parent(&mut self, offset: u64, out: &mut [u8]) -> Result<()> {
        let Some(parent) = self.parent.as_mut() else {
            out.fill(0);
            return Ok(());
        };
        let parent_cap = parent.capacity_bytes();
        let n = if offset >= parent_cap {
            0
        } else {
            (parent_cap - offset).min(out.len() as u64) as usize
        };
        if n > 0 {
            parent.read_at(offset, &mut out[..n])?;
        }
        out[n..].fill(0);
        Ok(())
    }

    fn read_compressed(
        &mut self,
        grain: u64,
        entry: u32,
        within: usize,
        out: &mut [u8],
    ) -> Result<()> {
        let (marker, size) = self.grain_marker(grain, entry)?;
        let mut payload = try_zeroed_vec(size)?;
        self.backend_read_at(marker + GRAIN_MARKER_LEN, &mut payload, "grain payload truncated")?;

        let mut decoded = try_zeroed_vec(self.geometry.grain_size)?;
        let decoder = self
            .decoder
            .as_ref()
            .ok_or(DiskError::Unsupported("no grain decoder configured"))?;
        let produced = decoder.decode(&payload, &mut decoded)?;
        let grain_start = grain * self.geometry.grain_size;
        let visible = (self.geometry.capacity - grain_start).min(self.geometry.grain_size);
        if (produced as u64) < visible {
            return Err(DiskError::CorruptImage("compressed grain short"));
        }
        out.copy_from_slice(&decoded[within..within + out.len()]);
        Ok(())
    }

    fn allocate_grain(&mut self, grain: u64, within: usize, data: &[u8]) -> Result<()> {
        let gs = self.geometry.grain_size;
        let gpt = self.geometry.grains_per_table as u64;
        let grain_start = grain * gs;
        let table_idx = grain / gpt;
        let slot = grain % gpt;

        // Copy-on-write: the whole grain is materialised from the parent, even when `data`
        // covers all of it.
        let mut buf = try_zeroed_vec(gs)?;
        let visible = (self.geometry.capacity - grain_start).min(gs) as usize;
        self.read_parent(grain_start, &mut buf[..visible])?;
        buf[within..within + data.len()].copy_from_slice(data);

        let dir_entry = self.directory_entry(table_idx)?;
        let new_table = dir_entry == GRAIN_UNALLOCATED;
        let (table_offset, mirror_table_offset) = if new_table {
            let table_bytes = self.geometry.table_bytes();
            let primary = self.store.allocate(&mut self.backend, table_bytes, SECTOR)?;
            let mirror = match self.mirror {
                Some(_) => Some(self.store.allocate(&mut self.backend, table_bytes, SECTOR)?),
                None => None,
            };
            debug!(table = table_idx, offset = primary, mirror = ?mirror, "allocated grain table");
            (primary, mirror)
        } else {
            let mirror = match &self.mirror {
                Some(m) => {
                    let entry = m
                        .entries
                        .get(table_idx as usize)
                        .copied()
                        .unwrap_or(GRAIN_UNALLOCATED);
                    if entry == GRAIN_UNALLOCATED {
                        return Err(DiskError::CorruptImage("mirror grain table missing"));
                    }
                    Some(self.table_offset(entry)?)
                }
                None => None,
            };
            (self.table_offset(dir_entry)?, mirror)
        };
        let table_sector = to_sector(table_offset)?;
        let mirror_table_sector = mirror_table_offset.map(to_sector).transpose()?;

        let grain_offset = self.store.allocate(&mut self.backend, gs, gs)?;
        let grain_sector = to_sector(grain_offset)?;
        self.backend.write_at(grain_offset, &buf)?;

        let entry_bytes = grain_sector.to_le_bytes().to_vec();
        let mut writes = vec![MetadataWrite {
            primary: WriteTarget::new(table_offset + slot * 4, entry_bytes.clone()),
            mirror: mirror_table_offset.map(|m| WriteTarget::new(m + slot * 4, entry_bytes)),
        }];
        if new_table {
            let dir_slot = table_idx * 4;
            writes.push(MetadataWrite {
                primary: WriteTarget::new(
                    self.directory.offset + dir_slot,
                    table_sector.to_le_bytes().to_vec(),
                ),
                mirror: match (&self.mirror, mirror_table_sector) {
                    (Some(m), Some(sector)) => Some(WriteTarget::new(
                        m.offset + dir_slot,
                        sector.to_le_bytes().to_vec(),
                    )),
                    _ => None,
                },
            });
        }
        self.store.commit(&mut self.backend, &writes)?;

        if new_table {
            self.directory.entries[table_idx as usize] = table_sector;
            if let (Some(m), Some(sector)) = (self.mirror.as_mut(), mirror_table_sector) {
                m.entries[table_idx as usize] = sector;
            }
            self.tables
                .push(table_idx, vec![GRAIN_UNALLOCATED; gpt as usize]);
        }
        // An evicted table reloads from disk, which already holds the new entry.
        if let Some(table) = self.tables.get_mut(&table_idx) {
            table[slot as usize] = grain_sector;
        }
        debug!(grain, offset = grain_offset, "allocated grain");
        Ok(())
    }

    /// Physical extent backing `[offset, offset + len)`, clipped to the grain containing
    /// `offset`. `None` when that grain is unallocated or `len` is zero.
    ///
    /// For compressed grains the extent covers the marker and payload instead.
    pub fn map(&mut self, offset: u64, len: u64) -> Result<Option<Extent>> {
        checked_range(offset, 1, self.geometry.capacity)?;
        if len == 0 {
            return Ok(None);
        }
        let gs = self.geometry.grain_size;
        let grain = offset / gs;
        let within = offset % gs;
        let entry = self.grain_entry(grain)?;
        if entry == GRAIN_UNALLOCATED {
            return Ok(None);
        }
        if self.is_compressed() {
            let (marker, size) = self.grain_marker(grain, entry)?;
            return Ok(Some(Extent::new(marker, GRAIN_MARKER_LEN + size)));
        }
        let phys = self.grain_offset(entry)?;
        Ok(Some(Extent::new(phys + within, len.min(gs - within))))
    }

    fn push_parent_extents(&mut self, set: &mut ExtentSet, start: u64, end: u64) -> Result<()> {
        let Some(parent) = self.parent.as_mut() else {
            return Ok(());
        };
        let end = end.min(parent.capacity_bytes());
        if start >= end {
            return Ok(());
        }
        for e in parent.extents_in(start, end - start)? {
            set.insert(e);
        }
        Ok(())
    }
}

impl<B: StorageBackend, S: MetadataStore, P: VirtualDisk> VirtualDisk for GrainEngine<B, S, P> {
    fn capacity_bytes(&self) -> u64 {
        self.geometry.capacity
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.geometry.capacity)?;
        let gs = self.geometry.grain_size;

        let mut pos = 0usize;
        while pos < buf.len() {
            let abs = offset + pos as u64;
            let grain = abs / gs;
            let within = (abs % gs) as usize;
            let chunk_len = (gs as usize - within).min(buf.len() - pos);
            let out = &mut buf[pos..pos + chunk_len];

            let entry = self.grain_entry(grain)?;
            if entry == GRAIN_UNALLOCATED {
                self.read_parent(abs, out)?;
            } else if self.is_compressed() {
                self.read_compressed(grain, entry, within, out)?;
            } else {
                let phys = self.grain_offset(entry)?;
                self.backend_read_at(phys + within as u64, out, "grain data truncated")?;
            }
            pos += chunk_len;
        }
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.is_compressed() {
            return Err(DiskError::ReadOnly("compressed grains cannot be written"));
        }
        checked_range(offset, buf.len(), self.geometry.capacity)?;
        let gs = self.geometry.grain_size;

        let mut pos = 0usize;
        while pos < buf.len() {
            let abs = offset + pos as u64;
            let grain = abs / gs;
            let within = (abs % gs) as usize;
            let chunk_len = (gs as usize - within).min(buf.len() - pos);
            let data = &buf[pos..pos + chunk_len];

            let entry = self.grain_entry(grain)?;
            if entry == GRAIN_UNALLOCATED {
                self.allocate_grain(grain, within, data)?;
            } else {
                let phys = self.grain_offset(entry)?;
                self.backend.write_at(phys + within as u64, data)?;
            }
            pos += chunk_len;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.store.flush(&mut self.backend)
    }

    fn is_writable(&self) -> bool {
        !self.is_compressed()
    }

    fn extents_in(&mut self, offset: u64, len: u64) -> Result<Vec<Extent>> {
        check_window(offset, len, self.geometry.capacity)?;
        let mut set = ExtentSet::new();
        if len == 0 {
            return Ok(Vec::new());
        }
        let end = offset + len;
        let gs = self.geometry.grain_size;
        let gpt = self.geometry.grains_per_table as u64;

        // Consecutive unallocated grains are handed to the parent as one range.
        let mut run: Option<u64> = None;
        let mut grain = offset / gs;
        while grain * gs < end {
            let grain_start = grain * gs;
            let table_idx = grain / gpt;
            if self.directory_entry(table_idx)? == GRAIN_UNALLOCATED {
                run.get_or_insert(grain_start);
                grain = (table_idx + 1) * gpt;
                continue;
            }
            if self.grain_entry(grain)? == GRAIN_UNALLOCATED {
                run.get_or_insert(grain_start);
            } else {
                if let Some(start) = run.take() {
                    self.push_parent_extents(&mut set, start.max(offset), grain_start)?;
                }
                if let Some(e) = Extent::new(grain_start, gs).intersect(offset, len) {
                    set.insert(e);
                }
            }
            grain += 1;
        }
        if let Some(start) = run {
            self.push_parent_extents(&mut set, start.max(offset), end)?;
        }
        Ok(set.into_vec())
    }
}
