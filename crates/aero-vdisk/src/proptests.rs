use crate::{
    BlockCachedDisk, ChecksumKind, ConcatDisk, ContainerConfig, ContainerDisk, MemBackend,
    RawDisk, SparseExtentConfig, SparseExtentDisk, SubRangeDisk, VirtualDisk, SECTOR_SIZE,
};
use proptest::prelude::*;
use proptest::test_runner::TestCaseResult;

#[derive(Debug, Clone)]
enum Op {
    Write { offset: u32, data: Vec<u8> },
    Read { offset: u32, len: usize },
    Flush,
    Reopen,
}

const MAX_DISK_SIZE: u32 = 1024 * 1024; // 1 MiB
const MAX_OPS: usize = 64;
const MAX_RW_LEN: usize = 8 * 1024;
const LOG_SIZE: u64 = 64 * 1024;

const SECTOR_SIZE_U32: u32 = SECTOR_SIZE as u32;
const MAX_DISK_SECTORS: u32 = MAX_DISK_SIZE / SECTOR_SIZE_U32;

fn disk_size_strategy() -> impl Strategy<Value = u32> {
    // Every grain format requires a sector-multiple capacity.
    (1u32..=MAX_DISK_SECTORS).prop_map(|sectors| sectors * SECTOR_SIZE_U32)
}

fn div_ceil_u32(n: u32, d: u32) -> u32 {
    n.div_ceil(d)
}

fn grain_size_strategy() -> impl Strategy<Value = u64> {
    prop_oneof![
        Just(512u64),
        Just(1024u64),
        Just(4096u64),
        Just(16 * 1024u64),
    ]
}

fn grains_per_table_strategy() -> impl Strategy<Value = u32> {
    // Few entries per table means many lazily allocated tables.
    prop_oneof![Just(1u32), Just(4u32), Just(128u32), Just(512u32)]
}

fn cache_block_size_strategy() -> impl Strategy<Value = usize> {
    prop_oneof![Just(512usize), Just(1024usize), Just(3072usize), Just(4096usize)]
}

fn max_cached_blocks_strategy() -> impl Strategy<Value = usize> {
    // Small cache sizes ensure we hit eviction/invalidation paths frequently.
    prop_oneof![Just(1usize), Just(2usize)]
}

#[derive(Debug, Clone, Copy)]
struct Grains {
    grain_size: u64,
    grains_per_table: u32,
}

fn grains_strategy() -> impl Strategy<Value = Grains> {
    (grain_size_strategy(), grains_per_table_strategy()).prop_map(
        |(grain_size, grains_per_table)| Grains {
            grain_size,
            grains_per_table,
        },
    )
}

fn extent_config(disk_size: u32, grains: Grains, redundant_tables: bool) -> SparseExtentConfig {
    SparseExtentConfig {
        capacity_bytes: disk_size as u64,
        grain_size_bytes: grains.grain_size,
        grains_per_table: grains.grains_per_table,
        redundant_tables,
    }
}

fn container_config(disk_size: u32, grains: Grains, checksum: ChecksumKind) -> ContainerConfig {
    ContainerConfig {
        capacity_bytes: disk_size as u64,
        grain_size_bytes: grains.grain_size,
        grains_per_table: grains.grains_per_table,
        log_size_bytes: LOG_SIZE,
        creator: "proptest".into(),
        checksum,
    }
}

fn offset_strategy(disk_size: u32) -> BoxedStrategy<u32> {
    let max_offset = disk_size;

    let any = 0u32..=max_offset;
    let sector_aligned =
        (0u32..=max_offset / SECTOR_SIZE_U32).prop_map(|lba| lba * SECTOR_SIZE_U32);
    let sector_boundary_plus_delta = (0u32..=max_offset / SECTOR_SIZE_U32, 0u32..SECTOR_SIZE_U32)
        .prop_map(move |(lba, delta)| {
            let off = lba * SECTOR_SIZE_U32 + delta;
            off.min(max_offset)
        });
    let grain_aligned = (0u32..=max_offset / 4096).prop_map(|g| g * 4096);
    let near_end =
        (0u32..=SECTOR_SIZE_U32).prop_map(move |delta| max_offset.saturating_sub(delta));

    prop_oneof![
        4 => any,
        2 => sector_aligned,
        2 => sector_boundary_plus_delta,
        2 => grain_aligned,
        1 => near_end,
    ]
    .boxed()
}

fn write_op_strategy(disk_size: u32) -> BoxedStrategy<Op> {
    offset_strategy(disk_size)
        .prop_flat_map(move |offset| {
            let remaining = disk_size - offset;
            let max_len = (remaining as usize).min(MAX_RW_LEN);
            (Just(offset), prop::collection::vec(any::<u8>(), 0..=max_len))
        })
        .prop_map(|(offset, data)| Op::Write { offset, data })
        .boxed()
}

fn read_op_strategy(disk_size: u32) -> BoxedStrategy<Op> {
    offset_strategy(disk_size)
        .prop_flat_map(move |offset| {
            let remaining = disk_size - offset;
            let max_len = (remaining as usize).min(MAX_RW_LEN);
            (Just(offset), 0usize..=max_len)
        })
        .prop_map(|(offset, len)| Op::Read { offset, len })
        .boxed()
}

fn op_strategy(disk_size: u32) -> BoxedStrategy<Op> {
    prop_oneof![
        5 => write_op_strategy(disk_size),
        4 => read_op_strategy(disk_size),
        1 => Just(Op::Flush),
        1 => Just(Op::Reopen),
    ]
    .boxed()
}

fn ops_strategy(disk_size: u32) -> BoxedStrategy<Vec<Op>> {
    prop::collection::vec(op_strategy(disk_size), 1..=MAX_OPS).boxed()
}

fn raw_scenario_strategy() -> BoxedStrategy<(u32, Vec<Op>)> {
    disk_size_strategy()
        .prop_flat_map(|disk_size| (Just(disk_size), ops_strategy(disk_size)))
        .boxed()
}

fn grain_scenario_strategy() -> BoxedStrategy<(u32, Grains, bool, Vec<Op>)> {
    (disk_size_strategy(), grains_strategy(), any::<bool>())
        .prop_flat_map(|(disk_size, grains, flag)| {
            (Just(disk_size), Just(grains), Just(flag), ops_strategy(disk_size))
        })
        .boxed()
}

fn cow_scenario_strategy() -> BoxedStrategy<(u32, Grains, u8, Vec<Op>)> {
    (disk_size_strategy(), grains_strategy(), any::<u8>())
        .prop_flat_map(|(disk_size, grains, seed)| {
            (Just(disk_size), Just(grains), Just(seed), ops_strategy(disk_size))
        })
        .boxed()
}

fn cached_grain_scenario_strategy() -> BoxedStrategy<(u32, Grains, usize, usize, Vec<Op>)> {
    (grains_strategy(), cache_block_size_strategy())
        .prop_flat_map(|(grains, cache_block_size)| {
            let min_disk_size = (cache_block_size * 3) as u32;
            (
                div_ceil_u32(min_disk_size, SECTOR_SIZE_U32)..=MAX_DISK_SECTORS,
                Just(grains),
                Just(cache_block_size),
                max_cached_blocks_strategy(),
            )
        })
        .prop_flat_map(|(disk_sectors, grains, cache_block_size, max_cached_blocks)| {
            let disk_size = disk_sectors * SECTOR_SIZE_U32;
            (
                Just(disk_size),
                Just(grains),
                Just(cache_block_size),
                Just(max_cached_blocks),
                ops_strategy(disk_size),
            )
        })
        .boxed()
}

fn concat_scenario_strategy() -> BoxedStrategy<(u32, u32, Grains, Vec<Op>)> {
    (2u32..=MAX_DISK_SECTORS, grains_strategy())
        .prop_flat_map(|(sectors, grains)| {
            (Just(sectors), 1u32..sectors, Just(grains))
        })
        .prop_flat_map(|(sectors, split, grains)| {
            let disk_size = sectors * SECTOR_SIZE_U32;
            (
                Just(disk_size),
                Just(split * SECTOR_SIZE_U32),
                Just(grains),
                ops_strategy(disk_size),
            )
        })
        .boxed()
}

fn run_ops<D, Reopen>(
    mut disk: D,
    mut model: Vec<u8>,
    ops: &[Op],
    mut reopen: Reopen,
) -> TestCaseResult
where
    D: VirtualDisk,
    Reopen: FnMut(D) -> D,
{
    let capacity = disk.capacity_bytes() as usize;
    prop_assert_eq!(capacity, model.len());

    for op in ops {
        match op {
            Op::Write { offset, data } => {
                let offset = *offset as usize;
                disk.write_at(offset as u64, data).unwrap();
                model[offset..offset + data.len()].copy_from_slice(data);

                // Read-after-write must match what we wrote.
                let mut read_back = vec![0xA5u8; data.len()];
                disk.read_at(offset as u64, &mut read_back).unwrap();
                prop_assert_eq!(read_back.as_slice(), data.as_slice());
            }
            Op::Read { offset, len } => {
                let offset = *offset as usize;
                let len = *len;
                let mut buf = vec![0xA5u8; len];
                disk.read_at(offset as u64, &mut buf).unwrap();
                prop_assert_eq!(buf.as_slice(), &model[offset..offset + len]);
            }
            Op::Flush => {
                disk.flush().unwrap();
            }
            Op::Reopen => {
                // Model "close" as a flush + re-open using the same backend.
                disk.flush().unwrap();
                disk = reopen(disk);
                prop_assert_eq!(disk.capacity_bytes() as usize, capacity);
            }
        }
    }

    // Ensure persisted correctness across a final close/open cycle.
    disk.flush().unwrap();
    disk = reopen(disk);
    prop_assert_eq!(disk.capacity_bytes() as usize, capacity);

    let mut all = vec![0u8; capacity];
    disk.read_at(0, &mut all).unwrap();
    prop_assert_eq!(all.as_slice(), model.as_slice());

    check_extents_cover_data(&mut disk, &model)
}

/// Reported extents must be sorted, disjoint, in range, and cover every non-zero byte.
fn check_extents_cover_data<D: VirtualDisk>(disk: &mut D, model: &[u8]) -> TestCaseResult {
    let extents = disk.extents_in(0, model.len() as u64).unwrap();
    let mut prev_end = 0u64;
    for e in &extents {
        prop_assert!(e.length > 0);
        prop_assert!(e.start >= prev_end, "extents overlap or are unsorted: {:?}", extents);
        prev_end = e.end();
    }
    prop_assert!(prev_end <= model.len() as u64);

    let mut covered = vec![false; model.len()];
    for e in &extents {
        covered[e.start as usize..e.end() as usize].fill(true);
    }
    for (i, byte) in model.iter().enumerate() {
        if *byte != 0 {
            prop_assert!(covered[i], "non-zero byte at {} outside every extent", i);
        }
    }
    Ok(())
}

fn make_base_pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(31).wrapping_add(seed as u32) as u8)
        .collect()
}

fn patterned_parent(disk_size: u32, seed: u8) -> (RawDisk<MemBackend>, Vec<u8>) {
    let mut parent = RawDisk::create(MemBackend::new(), disk_size as u64).unwrap();
    let model = make_base_pattern(disk_size as usize, seed);
    parent.write_at(0, &model).unwrap();
    (parent, model)
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 32,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_raw_disk_matches_reference((disk_size, ops) in raw_scenario_strategy()) {
        let disk = RawDisk::create(MemBackend::new(), disk_size as u64).unwrap();
        let model = vec![0u8; disk_size as usize];

        run_ops(disk, model, &ops, |disk| RawDisk::open(disk.into_backend()).unwrap())?;
    }

    #[test]
    fn prop_sparse_extent_matches_reference((disk_size, grains, redundant, ops) in grain_scenario_strategy()) {
        let disk = SparseExtentDisk::create(
            MemBackend::new(),
            extent_config(disk_size, grains, redundant),
        )
        .unwrap();
        let model = vec![0u8; disk_size as usize];

        run_ops(disk, model, &ops, |disk| SparseExtentDisk::open(disk.into_backend()).unwrap())?;
    }

    #[test]
    fn prop_sparse_extent_child_matches_reference((disk_size, grains, seed, ops) in cow_scenario_strategy()) {
        let (parent, model) = patterned_parent(disk_size, seed);
        let disk = SparseExtentDisk::create_with_parent(
            MemBackend::new(),
            extent_config(disk_size, grains, true),
            parent,
        )
        .unwrap();

        run_ops(disk, model, &ops, |disk| {
            let (backend, parent) = disk.into_parts();
            SparseExtentDisk::open_with_parent(backend, parent.unwrap()).unwrap()
        })?;
    }

    #[test]
    fn prop_container_matches_reference((disk_size, grains, xor, ops) in grain_scenario_strategy()) {
        let checksum = if xor { ChecksumKind::XorFold } else { ChecksumKind::Crc32c };
        let disk = ContainerDisk::create(
            MemBackend::new(),
            container_config(disk_size, grains, checksum),
        )
        .unwrap();
        let model = vec![0u8; disk_size as usize];

        run_ops(disk, model, &ops, |disk| ContainerDisk::open(disk.into_backend()).unwrap())?;
    }

    #[test]
    fn prop_container_child_matches_reference((disk_size, grains, seed, ops) in cow_scenario_strategy()) {
        let (parent, model) = patterned_parent(disk_size, seed);
        let disk = ContainerDisk::create_with_parent(
            MemBackend::new(),
            container_config(disk_size, grains, ChecksumKind::Crc32c),
            parent,
        )
        .unwrap();

        run_ops(disk, model, &ops, |disk| {
            let (backend, parent) = disk.into_parts();
            ContainerDisk::open_with_parent(backend, parent.unwrap()).unwrap()
        })?;
    }

    #[test]
    fn prop_cached_sparse_extent_matches_reference((disk_size, grains, cache_block_size, max_cached_blocks, ops) in cached_grain_scenario_strategy()) {
        let inner = SparseExtentDisk::create(
            MemBackend::new(),
            extent_config(disk_size, grains, false),
        )
        .unwrap();
        let disk = BlockCachedDisk::new(inner, cache_block_size, max_cached_blocks).unwrap();
        let model = vec![0u8; disk_size as usize];

        run_ops(disk, model, &ops, move |disk| {
            let inner = disk.into_inner();
            let inner = SparseExtentDisk::open(inner.into_backend()).unwrap();
            BlockCachedDisk::new(inner, cache_block_size, max_cached_blocks).unwrap()
        })?;
    }

    #[test]
    fn prop_cached_container_matches_reference((disk_size, grains, cache_block_size, max_cached_blocks, ops) in cached_grain_scenario_strategy()) {
        let inner = ContainerDisk::create(
            MemBackend::new(),
            container_config(disk_size, grains, ChecksumKind::Crc32c),
        )
        .unwrap();
        let disk = BlockCachedDisk::new(inner, cache_block_size, max_cached_blocks).unwrap();
        let model = vec![0u8; disk_size as usize];

        run_ops(disk, model, &ops, move |disk| {
            let inner = disk.into_inner();
            let inner = ContainerDisk::open(inner.into_backend()).unwrap();
            BlockCachedDisk::new(inner, cache_block_size, max_cached_blocks).unwrap()
        })?;
    }

    #[test]
    fn prop_concat_matches_reference((disk_size, split, grains, ops) in concat_scenario_strategy()) {
        // A window into a larger raw disk followed by a sparse extent; writes that straddle
        // the boundary must land in both.
        let raw = RawDisk::create(MemBackend::new(), split as u64 + 4096).unwrap();
        let head = SubRangeDisk::new(raw, 4096, split as u64).unwrap();
        let tail = SparseExtentDisk::create(
            MemBackend::new(),
            extent_config(disk_size - split, grains, false),
        )
        .unwrap();
        let disk = ConcatDisk::new(vec![Box::new(head), Box::new(tail)]).unwrap();
        let model = vec![0u8; disk_size as usize];

        run_ops(disk, model, &ops, |disk| disk)?;
    }
}
