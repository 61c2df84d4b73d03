use crate::disk::check_window;
use crate::util::checked_range;
use crate::{DiskError, Extent, Result, VirtualDisk};

/// A length-bounded window onto another disk.
///
/// Offsets are translated by adding `base`. Pass the inner disk by value to hand over
/// ownership, or as `&mut disk` to borrow it for the lifetime of the view.
pub struct SubRangeDisk<D> {
    inner: D,
    base: u64,
    len: u64,
}

impl<D: VirtualDisk> SubRangeDisk<D> {
    pub fn new(inner: D, base: u64, len: u64) -> Result<Self> {
        check_window(base, len, inner.capacity_bytes())?;
        Ok(Self { inner, base, len })
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    pub fn into_inner(self) -> D {
        self.inner
    }

    fn translate(&self, offset: u64) -> Result<u64> {
        self.base
            .checked_add(offset)
            .ok_or(DiskError::OffsetOverflow)
    }
}

impl<D: VirtualDisk> VirtualDisk for SubRangeDisk<D> {
    fn capacity_bytes(&self) -> u64 {
        self.len
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.len)?;
        let abs = self.translate(offset)?;
        self.inner.read_at(abs, buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.len)?;
        let abs = self.translate(offset)?;
        self.inner.write_at(abs, buf)
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }

    fn is_writable(&self) -> bool {
        self.inner.is_writable()
    }

    fn extents_in(&mut self, offset: u64, len: u64) -> Result<Vec<Extent>> {
        check_window(offset, len, self.len)?;
        let abs = self.translate(offset)?;
        let inner = self.inner.extents_in(abs, len)?;
        Ok(inner
            .into_iter()
            .filter_map(|e| e.intersect(abs, len))
            .map(|e| e.shifted(self.base, 0))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemBackend, RawDisk};

    fn raw_with_pattern(len: usize) -> RawDisk<MemBackend> {
        let data: Vec<u8> = (0..len).map(|i| i as u8).collect();
        RawDisk::open(MemBackend::from_vec(data)).unwrap()
    }

    #[test]
    fn translates_reads_and_writes_by_base() {
        let mut raw = raw_with_pattern(32);
        {
            let mut view = SubRangeDisk::new(&mut raw, 5, 10).unwrap();
            let mut buf = [0u8; 4];
            view.read_at(2, &mut buf).unwrap();
            assert_eq!(buf, [7, 8, 9, 10]);
            view.write_at(0, &[0xEE]).unwrap();
        }
        let mut b = [0u8; 1];
        raw.read_at(5, &mut b).unwrap();
        assert_eq!(b, [0xEE]);
    }

    #[test]
    fn rejects_requests_past_declared_length() {
        let mut view = SubRangeDisk::new(raw_with_pattern(32), 5, 10).unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(
            view.read_at(8, &mut buf).unwrap_err(),
            DiskError::OutOfBounds { .. }
        ));
        assert!(matches!(
            view.write_at(10, &[1]).unwrap_err(),
            DiskError::OutOfBounds { .. }
        ));
    }

    #[test]
    fn window_must_fit_inside_inner_disk() {
        assert!(matches!(
            SubRangeDisk::new(raw_with_pattern(32), 30, 10).err(),
            Some(DiskError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn extents_are_rebased_to_view_coordinates() {
        let mut view = SubRangeDisk::new(raw_with_pattern(32), 5, 10).unwrap();
        assert_eq!(view.extents_in(0, 10).unwrap(), vec![Extent::new(0, 10)]);
        assert_eq!(view.extents_in(4, 3).unwrap(), vec![Extent::new(4, 3)]);
    }
}
