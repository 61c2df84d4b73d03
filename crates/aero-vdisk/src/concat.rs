use crate::disk::check_window;
use crate::util::checked_range;
use crate::{DiskError, Extent, Result, VirtualDisk};

/// Several disks laid end to end as one address space.
///
/// Each child is boxed; box `&mut disk` to keep ownership with the caller.
pub struct ConcatDisk<'a> {
    children: Vec<Box<dyn VirtualDisk + 'a>>,
    /// Start offset of each child in the composite address space.
    starts: Vec<u64>,
    capacity: u64,
}

impl<'a> ConcatDisk<'a> {
    pub fn new(children: Vec<Box<dyn VirtualDisk + 'a>>) -> Result<Self> {
        let mut starts = Vec::with_capacity(children.len());
        let mut capacity = 0u64;
        for child in &children {
            starts.push(capacity);
            capacity = capacity
                .checked_add(child.capacity_bytes())
                .ok_or(DiskError::OffsetOverflow)?;
        }
        Ok(Self {
            children,
            starts,
            capacity,
        })
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn into_children(self) -> Vec<Box<dyn VirtualDisk + 'a>> {
        self.children
    }

    /// Resolve a composite offset to `(child index, child-local offset)`.
    pub fn locate(&self, offset: u64) -> Option<(usize, u64)> {
        if offset >= self.capacity {
            return None;
        }
        // Last child starting at or before `offset`; zero-length children are skipped since
        // the following child shares their start.
        let idx = self.starts.partition_point(|&s| s <= offset).checked_sub(1)?;
        Some((idx, offset - self.starts[idx]))
    }

    fn child_len(&self, idx: usize) -> u64 {
        self.children[idx].capacity_bytes()
    }

    /// The child holding `abs`, the local offset, and how many of `remaining` bytes it
    /// takes.
    fn span(&self, abs: u64, remaining: usize) -> Result<(usize, u64, usize)> {
        let (idx, local) = self
            .locate(abs)
            .ok_or(DiskError::Io("concat offset did not resolve".into()))?;
        let chunk_len = ((self.child_len(idx) - local) as usize).min(remaining);
        Ok((idx, local, chunk_len))
    }
}

impl VirtualDisk for ConcatDisk<'_> {
    fn capacity_bytes(&self) -> u64 {
        self.capacity
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.capacity)?;
        let mut pos = 0usize;
        while pos < buf.len() {
            let (idx, local, chunk_len) = self.span(offset + pos as u64, buf.len() - pos)?;
            self.children[idx].read_at(local, &mut buf[pos..pos + chunk_len])?;
            pos += chunk_len;
        }
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.capacity)?;
        // Refuse up front so a read-only child never leaves a partial write behind.
        let mut pos = 0usize;
        while pos < buf.len() {
            let (idx, _, chunk_len) = self.span(offset + pos as u64, buf.len() - pos)?;
            if !self.children[idx].is_writable() {
                return Err(DiskError::ReadOnly("concat child is read-only"));
            }
            pos += chunk_len;
        }

        let mut pos = 0usize;
        while pos < buf.len() {
            let (idx, local, chunk_len) = self.span(offset + pos as u64, buf.len() - pos)?;
            self.children[idx].write_at(local, &buf[pos..pos + chunk_len])?;
            pos += chunk_len;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        for child in &mut self.children {
            child.flush()?;
        }
        Ok(())
    }

    fn is_writable(&self) -> bool {
        self.children.iter().all(|c| c.is_writable())
    }

    fn extents_in(&mut self, offset: u64, len: u64) -> Result<Vec<Extent>> {
        check_window(offset, len, self.capacity)?;
        let end = offset + len;
        let mut out = Vec::new();
        let Some((first, _)) = self.locate(offset) else {
            return Ok(out);
        };
        for idx in first..self.children.len() {
            let start = self.starts[idx];
            if start >= end {
                break;
            }
            let child_len = self.child_len(idx);
            let lo = offset.max(start);
            let hi = end.min(start + child_len);
            if lo >= hi {
                continue;
            }
            for e in self.children[idx].extents_in(lo - start, hi - lo)? {
                out.push(e.shifted(0, start));
            }
        }
        Ok(out)
    }
}
