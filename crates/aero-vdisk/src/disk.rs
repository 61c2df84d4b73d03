use std::collections::VecDeque;

use crate::util::checked_range;
use crate::{DiskError, Extent, Result, StorageBackend};

pub const SECTOR_SIZE: usize = 512;

/// Window size used by [`Extents`] when walking an address space.
const EXTENT_WINDOW_BYTES: u64 = 1 << 30;

/// Byte-addressed disk interface shared by every image format and stream combinator.
///
/// File-system drivers consume this trait. Implementations that cannot be written to keep the
/// default [`VirtualDisk::is_writable`] override and fail writes with [`DiskError::ReadOnly`].
pub trait VirtualDisk {
    fn capacity_bytes(&self) -> u64;

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()>;

    fn flush(&mut self) -> Result<()>;

    fn is_writable(&self) -> bool {
        true
    }

    /// Occupied extents intersecting `[offset, offset + len)`, ascending and non-overlapping.
    ///
    /// The default treats the whole window as data, which is correct (if pessimistic) for
    /// dense disks.
    fn extents_in(&mut self, offset: u64, len: u64) -> Result<Vec<Extent>> {
        check_window(offset, len, self.capacity_bytes())?;
        if len == 0 {
            return Ok(Vec::new());
        }
        Ok(vec![Extent::new(offset, len)])
    }

    /// Lazily enumerate every occupied extent of the disk.
    ///
    /// The iterator is restartable: calling `extents()` again starts from offset 0.
    fn extents(&mut self) -> Extents<'_, Self>
    where
        Self: Sized,
    {
        Extents::new(self)
    }

    fn read_sectors(&mut self, lba: u64, buf: &mut [u8]) -> Result<()> {
        let offset = sector_offset(lba, buf.len())?;
        self.read_at(offset, buf)
    }

    fn write_sectors(&mut self, lba: u64, buf: &[u8]) -> Result<()> {
        let offset = sector_offset(lba, buf.len())?;
        self.write_at(offset, buf)
    }
}

fn sector_offset(lba: u64, len: usize) -> Result<u64> {
    if !len.is_multiple_of(SECTOR_SIZE) {
        return Err(DiskError::UnalignedLength {
            len,
            alignment: SECTOR_SIZE,
        });
    }
    lba.checked_mul(SECTOR_SIZE as u64)
        .ok_or(DiskError::OffsetOverflow)
}

pub(crate) fn check_window(offset: u64, len: u64, capacity: u64) -> Result<()> {
    let end = offset.checked_add(len).ok_or(DiskError::OffsetOverflow)?;
    if end > capacity {
        return Err(DiskError::OutOfBounds {
            offset,
            len: usize::try_from(len).unwrap_or(usize::MAX),
            capacity,
        });
    }
    Ok(())
}

impl<D: VirtualDisk + ?Sized> VirtualDisk for &mut D {
    fn capacity_bytes(&self) -> u64 {
        (**self).capacity_bytes()
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_at(offset, buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        (**self).write_at(offset, buf)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }

    fn is_writable(&self) -> bool {
        (**self).is_writable()
    }

    fn extents_in(&mut self, offset: u64, len: u64) -> Result<Vec<Extent>> {
        (**self).extents_in(offset, len)
    }
}

impl<D: VirtualDisk + ?Sized> VirtualDisk for Box<D> {
    fn capacity_bytes(&self) -> u64 {
        (**self).capacity_bytes()
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_at(offset, buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        (**self).write_at(offset, buf)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }

    fn is_writable(&self) -> bool {
        (**self).is_writable()
    }

    fn extents_in(&mut self, offset: u64, len: u64) -> Result<Vec<Extent>> {
        (**self).extents_in(offset, len)
    }
}

/// Lazy extent enumeration over a [`VirtualDisk`].
///
/// Walks the address space in fixed windows and coalesces extents that touch across a
/// window boundary, so callers see the same extents regardless of the window size.
pub struct Extents<'a, D: ?Sized> {
    disk: &'a mut D,
    pos: u64,
    capacity: u64,
    window: u64,
    buffered: VecDeque<Extent>,
    pending: Option<Extent>,
    done: bool,
}

impl<'a, D: VirtualDisk + ?Sized> Extents<'a, D> {
    pub fn new(disk: &'a mut D) -> Self {
        Self::with_window(disk, EXTENT_WINDOW_BYTES)
    }

    pub fn with_window(disk: &'a mut D, window: u64) -> Self {
        let capacity = disk.capacity_bytes();
        Self {
            disk,
            pos: 0,
            capacity,
            window: window.max(1),
            buffered: VecDeque::new(),
            pending: None,
            done: false,
        }
    }
}

impl<D: VirtualDisk + ?Sized> Iterator for Extents<'_, D> {
    type Item = Result<Extent>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(e) = self.buffered.pop_front() {
                match self.pending {
                    None => self.pending = Some(e),
                    Some(p) if p.end() == e.start => {
                        self.pending = Some(Extent::new(p.start, p.length + e.length));
                    }
                    Some(p) => {
                        self.pending = Some(e);
                        return Some(Ok(p));
                    }
                }
                continue;
            }

            if self.done || self.pos >= self.capacity {
                self.done = true;
                return self.pending.take().map(Ok);
            }

            let len = self.window.min(self.capacity - self.pos);
            match self.disk.extents_in(self.pos, len) {
                Ok(v) => {
                    self.buffered.extend(v.into_iter().filter(|e| !e.is_empty()));
                    self.pos += len;
                }
                Err(e) => {
                    self.done = true;
                    self.pending = None;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Dense, fixed-capacity disk stored directly in a backend (raw image).
pub struct RawDisk<B> {
    backend: B,
    capacity: u64,
}

impl<B: StorageBackend> RawDisk<B> {
    pub fn create(mut backend: B, capacity: u64) -> Result<Self> {
        backend.set_len(capacity)?;
        Ok(Self { backend, capacity })
    }

    pub fn open(mut backend: B) -> Result<Self> {
        let capacity = backend.len()?;
        Ok(Self { backend, capacity })
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn into_backend(self) -> B {
        self.backend
    }
}

impl<B: StorageBackend> VirtualDisk for RawDisk<B> {
    fn capacity_bytes(&self) -> u64 {
        self.capacity
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.capacity)?;
        self.backend.read_at(offset, buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.capacity)?;
        self.backend.write_at(offset, buf)
    }

    fn flush(&mut self) -> Result<()> {
        self.backend.flush()
    }
}
