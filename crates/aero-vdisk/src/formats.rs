use crate::header::{secondary_header_offset, CONTAINER_MAGIC};
use crate::sparse_extent::SPARSE_EXTENT_MAGIC;
use crate::{ContainerDisk, Extent, RawDisk, Result, SparseExtentDisk, StorageBackend, VirtualDisk};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DiskFormat {
    Raw,
    SparseExtent,
    Container,
}

fn magic_at<B: StorageBackend>(backend: &mut B, offset: u64) -> Result<[u8; 4]> {
    let mut magic = [0u8; 4];
    backend.read_at(offset, &mut magic)?;
    Ok(magic)
}

/// Detect the on-disk image format from magic values.
///
/// Detection is conservative: unknown images fall back to [`DiskFormat::Raw`]. A container
/// is recognised by either header copy, so one with a damaged primary header still opens
/// (and then falls back to the trailing copy).
pub fn detect_format<B: StorageBackend>(backend: &mut B) -> Result<DiskFormat> {
    let len = backend.len()?;
    if len < 4 {
        return Ok(DiskFormat::Raw);
    }

    let first = magic_at(backend, 0)?;
    if first == CONTAINER_MAGIC {
        return Ok(DiskFormat::Container);
    }
    if first == SPARSE_EXTENT_MAGIC {
        return Ok(DiskFormat::SparseExtent);
    }
    if let Some(secondary) = secondary_header_offset(len) {
        if magic_at(backend, secondary)? == CONTAINER_MAGIC {
            return Ok(DiskFormat::Container);
        }
    }
    Ok(DiskFormat::Raw)
}

/// A convenience wrapper that can open any supported image format from a single backend.
pub enum DiskImage<B> {
    Raw(RawDisk<B>),
    SparseExtent(SparseExtentDisk<B>),
    Container(Box<ContainerDisk<B>>),
}

impl<B: StorageBackend> DiskImage<B> {
    pub fn format(&self) -> DiskFormat {
        match self {
            Self::Raw(_) => DiskFormat::Raw,
            Self::SparseExtent(_) => DiskFormat::SparseExtent,
            Self::Container(_) => DiskFormat::Container,
        }
    }

    pub fn open_with_format(format: DiskFormat, backend: B) -> Result<Self> {
        match format {
            DiskFormat::Raw => Ok(Self::Raw(RawDisk::open(backend)?)),
            DiskFormat::SparseExtent => Ok(Self::SparseExtent(SparseExtentDisk::open(backend)?)),
            DiskFormat::Container => Ok(Self::Container(Box::new(ContainerDisk::open(backend)?))),
        }
    }

    pub fn open_auto(mut backend: B) -> Result<Self> {
        let format = detect_format(&mut backend)?;
        Self::open_with_format(format, backend)
    }

    pub fn into_backend(self) -> B {
        match self {
            Self::Raw(d) => d.into_backend(),
            Self::SparseExtent(d) => d.into_backend(),
            Self::Container(d) => d.into_backend(),
        }
    }
}

impl<B: StorageBackend> VirtualDisk for DiskImage<B> {
    fn capacity_bytes(&self) -> u64 {
        match self {
            Self::Raw(d) => d.capacity_bytes(),
            Self::SparseExtent(d) => d.capacity_bytes(),
            Self::Container(d) => d.capacity_bytes(),
        }
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        match self {
            Self::Raw(d) => d.read_at(offset, buf),
            Self::SparseExtent(d) => d.read_at(offset, buf),
            Self::Container(d) => d.read_at(offset, buf),
        }
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        match self {
            Self::Raw(d) => d.write_at(offset, buf),
            Self::SparseExtent(d) => d.write_at(offset, buf),
            Self::Container(d) => d.write_at(offset, buf),
        }
    }

    fn flush(&mut self) -> Result<()> {
        match self {
            Self::Raw(d) => d.flush(),
            Self::SparseExtent(d) => d.flush(),
            Self::Container(d) => d.flush(),
        }
    }

    fn is_writable(&self) -> bool {
        match self {
            Self::Raw(d) => d.is_writable(),
            Self::SparseExtent(d) => d.is_writable(),
            Self::Container(d) => d.is_writable(),
        }
    }

    fn extents_in(&mut self, offset: u64, len: u64) -> Result<Vec<Extent>> {
        match self {
            Self::Raw(d) => d.extents_in(offset, len),
            Self::SparseExtent(d) => d.extents_in(offset, len),
            Self::Container(d) => d.extents_in(offset, len),
        }
    }
}
