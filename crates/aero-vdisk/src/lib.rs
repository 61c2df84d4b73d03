//! Growable virtual disk containers and the byte-stream plumbing they are built from.
//!
//! Images are thin-provisioned: storage is allocated in fixed-size grains on first write,
//! unwritten ranges read as zeros or fall through to a parent image. This crate provides:
//!
//! - [`VirtualDisk`]: random-access byte stream with sector helpers and extent queries
//! - [`SubRangeDisk`], [`ConcatDisk`], [`ZeroDisk`]: stream composition
//! - [`SparseExtentDisk`]: grain-table sparse extent with optional mirrored tables and a
//!   read-only compressed variant
//! - [`ContainerDisk`]: container with redundant headers, a region directory and a
//!   write-ahead log that is replayed on open
//! - [`BlockCachedDisk`]: read-through LRU block cache wrapper
//! - [`DiskImage`]: format detection over a single backend
//!
//! Metadata updates of the grain-based formats flow through a [`MetadataStore`], so the
//! same allocation engine serves both the direct-write extent and the logged container.

mod backend;
mod cache;
mod checksum;
mod compression;
mod concat;
mod container;
mod disk;
mod error;
mod extent;
mod formats;
mod grain;
mod header;
mod log;
mod metadata;
mod region;
mod sparse_extent;
mod sub_range;
mod util;
mod zero;

pub use backend::{MemBackend, StdFileBackend, StorageBackend};
pub use cache::{BlockCacheStats, BlockCachedDisk};
pub use checksum::ChecksumKind;
pub use compression::{GrainDecoder, ZlibGrainDecoder};
pub use concat::ConcatDisk;
pub use container::{
    ContainerConfig, ContainerDisk, ContainerMetadata, LoggedMetadata, OpenReport,
};
pub use disk::{Extents, RawDisk, VirtualDisk, SECTOR_SIZE};
pub use error::{DiskError, ErrorKind, Result};
pub use extent::{Extent, ExtentSet};
pub use formats::{detect_format, DiskFormat, DiskImage};
pub use grain::{GrainDirectory, GrainEngine, GrainGeometry, GrainLayout, GRAIN_UNALLOCATED};
pub use header::{read_headers, write_headers, ContainerHeader, CopySource};
pub use log::{replay_log, LogDescriptor, LogEntry, LogRegion, LogWriter, ReplayReport};
pub use metadata::{DirectMetadata, MetadataStore, MetadataWrite, WriteTarget};
pub use region::{read_region_directory, RegionDirectory, RegionEntry};
pub use sparse_extent::{SparseExtentConfig, SparseExtentDisk, SparseExtentHeader};
pub use sub_range::SubRangeDisk;
pub use zero::ZeroDisk;

/// On-disk constants for callers that inspect or craft images directly.
pub mod layout {
    pub use crate::container::{LOG_OFFSET, METADATA_OFFSET, REGION_DIRECTORY_OFFSET};
    pub use crate::header::{
        secondary_header_offset, CONTAINER_MAGIC, HEADER_SIZE, HEADER_VERSION_CRC32C,
        HEADER_VERSION_XOR,
    };
    pub use crate::log::{LOG_BLOCK, LOG_ENTRY_MAGIC};
    pub use crate::region::{
        BAT_REGION, FREE_SPACE_REGION, LOG_REGION, METADATA_REGION, REGION_DIRECTORY_SIZE,
    };
    pub use crate::sparse_extent::{
        COMPRESSION_DEFLATE, COMPRESSION_NONE, FLAG_COMPRESSED, FLAG_MARKERS, FLAG_NEWLINE_CHECK,
        FLAG_REDUNDANT_TABLES, SPARSE_EXTENT_MAGIC,
    };
}

#[cfg(test)]
mod proptests;
