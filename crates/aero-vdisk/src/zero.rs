use crate::disk::check_window;
use crate::util::checked_range;
use crate::{DiskError, Extent, Result, VirtualDisk};

/// A read-only stream of zeros with a fixed length. Reports no extents.
#[derive(Clone, Copy, Debug)]
pub struct ZeroDisk {
    len: u64,
}

impl ZeroDisk {
    pub fn new(len: u64) -> Self {
        Self { len }
    }
}

impl VirtualDisk for ZeroDisk {
    fn capacity_bytes(&self) -> u64 {
        self.len
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.len)?;
        buf.fill(0);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.len)?;
        Err(DiskError::ReadOnly("zero-fill stream"))
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_writable(&self) -> bool {
        false
    }

    fn extents_in(&mut self, offset: u64, len: u64) -> Result<Vec<Extent>> {
        check_window(offset, len, self.len)?;
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_zero_and_rejects_writes() {
        let mut z = ZeroDisk::new(64);
        let mut buf = [0xAAu8; 16];
        z.read_at(48, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 16]);

        assert!(matches!(
            z.write_at(0, &[1]).unwrap_err(),
            DiskError::ReadOnly(_)
        ));
        assert!(matches!(
            z.read_at(60, &mut buf).unwrap_err(),
            DiskError::OutOfBounds { .. }
        ));
        assert!(z.extents_in(0, 64).unwrap().is_empty());
    }
}
