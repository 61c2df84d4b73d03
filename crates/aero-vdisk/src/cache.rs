use crate::util::checked_range;
use crate::{DiskError, Extent, Result, VirtualDisk};
use lru::LruCache;
use std::num::NonZeroUsize;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
}

/// A read-through LRU block cache in front of a [`VirtualDisk`].
///
/// Reads are rounded out to fixed-size, aligned blocks which are kept until evicted. Writes
/// go straight to the inner disk and then drop every cached block they overlap, so a read
/// after a write always observes the written bytes.
pub struct BlockCachedDisk<D> {
    inner: D,
    block_size: usize,
    cache: LruCache<u64, Vec<u8>>,
    stats: BlockCacheStats,
}

impl<D: VirtualDisk> BlockCachedDisk<D> {
    pub fn new(inner: D, block_size: usize, max_cached_blocks: usize) -> Result<Self> {
        if block_size == 0 {
            return Err(DiskError::InvalidConfig("block_size must be > 0"));
        }
        let max_cached_blocks = NonZeroUsize::new(max_cached_blocks)
            .ok_or(DiskError::InvalidConfig("max_cached_blocks must be > 0"))?;
        Ok(Self {
            inner,
            block_size,
            cache: LruCache::new(max_cached_blocks),
            stats: BlockCacheStats::default(),
        })
    }

    pub fn stats(&self) -> BlockCacheStats {
        self.stats
    }

    pub fn cached_blocks(&self) -> usize {
        self.cache.len()
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    pub fn into_inner(self) -> D {
        self.inner
    }

    fn block_start(&self, block_idx: u64) -> Result<u64> {
        block_idx
            .checked_mul(self.block_size as u64)
            .ok_or(DiskError::OffsetOverflow)
    }

    fn ensure_block_cached(&mut self, block_idx: u64) -> Result<()> {
        if self.cache.get(&block_idx).is_some() {
            self.stats.hits += 1;
            return Ok(());
        }
        self.stats.misses += 1;

        let start = self.block_start(block_idx)?;
        let capacity = self.inner.capacity_bytes();
        // The final block may be short when capacity is not block aligned.
        let len = (capacity - start).min(self.block_size as u64) as usize;

        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| DiskError::QuotaExceeded)?;
        data.resize(len, 0);
        self.inner.read_at(start, &mut data)?;

        if self.cache.push(block_idx, data).is_some_and(|(k, _)| k != block_idx) {
            self.stats.evictions += 1;
        }
        Ok(())
    }

    fn invalidate(&mut self, offset: u64, len: u64) {
        if len == 0 {
            return;
        }
        let bs = self.block_size as u64;
        let first = offset / bs;
        let last = (offset + len - 1) / bs;
        if last - first + 1 <= self.cache.len() as u64 {
            for idx in first..=last {
                if self.cache.pop(&idx).is_some() {
                    self.stats.invalidations += 1;
                }
            }
        } else {
            // Large writes: scan the cache instead of every block index in the range.
            let keys: Vec<u64> = self
                .cache
                .iter()
                .map(|(k, _)| *k)
                .filter(|k| (first..=last).contains(k))
                .collect();
            for key in keys {
                self.cache.pop(&key);
                self.stats.invalidations += 1;
            }
        }
    }
}

impl<D: VirtualDisk> VirtualDisk for BlockCachedDisk<D> {
    fn capacity_bytes(&self) -> u64 {
        self.inner.capacity_bytes()
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.capacity_bytes())?;

        let mut pos = 0usize;
        while pos < buf.len() {
            let abs = offset + pos as u64;
            let block_idx = abs / self.block_size as u64;
            let within = (abs % self.block_size as u64) as usize;
            let remaining = buf.len() - pos;
            let chunk_len = (self.block_size - within).min(remaining);

            self.ensure_block_cached(block_idx)?;
            let data = self.cache.get(&block_idx).ok_or(DiskError::Io(
                "cache missing block after ensure_block_cached".into(),
            ))?;
            buf[pos..pos + chunk_len].copy_from_slice(&data[within..within + chunk_len]);

            pos += chunk_len;
        }

        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.capacity_bytes())?;
        self.inner.write_at(offset, buf)?;
        self.invalidate(offset, buf.len() as u64);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }

    fn is_writable(&self) -> bool {
        self.inner.is_writable()
    }

    fn extents_in(&mut self, offset: u64, len: u64) -> Result<Vec<Extent>> {
        self.inner.extents_in(offset, len)
    }
}
