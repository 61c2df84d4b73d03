use crate::util::align_up_u64;
use crate::{DiskError, Result, StorageBackend};

/// One contiguous metadata write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteTarget {
    pub offset: u64,
    pub bytes: Vec<u8>,
}

impl WriteTarget {
    pub fn new(offset: u64, bytes: Vec<u8>) -> Self {
        Self { offset, bytes }
    }
}

/// A metadata update and, when the image keeps redundant tables, its mirror.
///
/// Both halves are applied together or not at all; see [`write_pair`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetadataWrite {
    pub primary: WriteTarget,
    pub mirror: Option<WriteTarget>,
}

/// How an image allocates backing space and persists grain-table updates.
pub trait MetadataStore {
    /// Reserve `len` bytes at the end of the backing file, aligned to `align`.
    fn allocate<B: StorageBackend>(&mut self, backend: &mut B, len: u64, align: u64) -> Result<u64>;

    /// Durably record `writes`. Grain data written before this call must be durable first.
    fn commit<B: StorageBackend>(&mut self, backend: &mut B, writes: &[MetadataWrite])
        -> Result<()>;

    fn flush<B: StorageBackend>(&mut self, backend: &mut B) -> Result<()>;
}

/// Append-only allocation: `align_up(len, align)` is the next free offset.
pub(crate) fn append_allocate<B: StorageBackend>(
    backend: &mut B,
    len: u64,
    align: u64,
) -> Result<u64> {
    let offset = align_up_u64(backend.len()?, align)?;
    let end = offset.checked_add(len).ok_or(DiskError::OffsetOverflow)?;
    backend.set_len(end)?;
    Ok(offset)
}

/// Write primary then mirror. If the mirror fails, the primary's previous bytes are restored
/// before the error is returned.
pub(crate) fn write_pair<B: StorageBackend>(backend: &mut B, write: &MetadataWrite) -> Result<()> {
    let primary = &write.primary;
    let Some(mirror) = &write.mirror else {
        return backend.write_at(primary.offset, &primary.bytes);
    };

    let mut previous = vec![0u8; primary.bytes.len()];
    backend.read_at(primary.offset, &mut previous)?;
    backend.write_at(primary.offset, &primary.bytes)?;
    if let Err(e) = backend.write_at(mirror.offset, &mirror.bytes) {
        // Best-effort rollback; the original error is what the caller needs to see.
        let _ = backend.write_at(primary.offset, &previous);
        return Err(e);
    }
    Ok(())
}

/// Metadata written in place, with no journal (hosted sparse extents).
#[derive(Clone, Copy, Debug, Default)]
pub struct DirectMetadata;

impl MetadataStore for DirectMetadata {
    fn allocate<B: StorageBackend>(
        &mut self,
        backend: &mut B,
        len: u64,
        align: u64,
    ) -> Result<u64> {
        append_allocate(backend, len, align)
    }

    fn commit<B: StorageBackend>(
        &mut self,
        backend: &mut B,
        writes: &[MetadataWrite],
    ) -> Result<()> {
        // Barrier: grain data must not be referenced before it is on the device.
        backend.flush()?;
        for write in writes {
            write_pair(backend, write)?;
        }
        backend.flush()
    }

    fn flush<B: StorageBackend>(&mut self, backend: &mut B) -> Result<()> {
        backend.flush()
    }
}
