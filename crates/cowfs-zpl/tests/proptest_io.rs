//! Property-based tests for range locks and the read/write paths.

mod common;

use common::TestFs;
use cowfs_zpl::range_lock::{FileGeometry, RangeLock, RangeLockMode, RANGE_UNBOUNDED};
use cowfs_zpl::types::{Cred, IoFlags};
use cowfs_zpl::ZplConfig;
use proptest::prelude::*;

/// Geometry of a file whose block size can no longer grow.
fn settled() -> FileGeometry {
    FileGeometry {
        size: 1 << 20,
        block_size: 4096,
        max_block_size: 4096,
    }
}

/// Splits `[0, 1 MiB)` into disjoint ranges at the given cut points.
fn disjoint_ranges(mut cuts: Vec<u64>) -> Vec<(u64, u64)> {
    cuts.sort_unstable();
    cuts.dedup();
    let mut ranges = Vec::new();
    let mut start = 0;
    for cut in cuts.into_iter().chain(std::iter::once(1 << 20)) {
        if cut > start {
            ranges.push((start, cut - start));
            start = cut;
        }
    }
    ranges
}

#[derive(Clone, Debug)]
enum IoOp {
    Write { offset: u64, len: usize, fill: u8 },
    Append { len: usize, fill: u8 },
    Truncate { size: u64 },
}

fn any_io_op() -> impl Strategy<Value = IoOp> {
    prop_oneof![
        4 => (0u64..40_000, 1usize..10_000, any::<u8>())
            .prop_map(|(offset, len, fill)| IoOp::Write { offset, len, fill }),
        1 => (1usize..5_000, any::<u8>()).prop_map(|(len, fill)| IoOp::Append { len, fill }),
        1 => (0u64..50_000).prop_map(|size| IoOp::Truncate { size }),
    ]
}

proptest! {
    #[test]
    fn test_disjoint_writers_hold_together(cuts in proptest::collection::vec(1u64..(1 << 20), 0..16)) {
        let lock = RangeLock::new();
        let ranges = disjoint_ranges(cuts);
        let held: Vec<_> = ranges
            .iter()
            .map(|&(off, len)| lock.lock(off, len, RangeLockMode::Writer, settled))
            .collect();
        prop_assert_eq!(lock.held_count(), ranges.len());
        for (entry, &(off, len)) in held.iter().zip(&ranges) {
            prop_assert_eq!(entry.offset(), off);
            prop_assert_eq!(entry.len(), len);
            prop_assert!(!entry.is_whole_file());
        }
        drop(held);
        prop_assert_eq!(lock.held_count(), 0);
    }

    #[test]
    fn test_readers_share_any_ranges(ranges in proptest::collection::vec((0u64..1 << 20, 1u64..1 << 16), 1..16)) {
        let lock = RangeLock::new();
        let held: Vec<_> = ranges
            .iter()
            .map(|&(off, len)| lock.lock(off, len, RangeLockMode::Reader, settled))
            .collect();
        prop_assert_eq!(lock.held_count(), ranges.len());
        drop(held);
        prop_assert_eq!(lock.held_count(), 0);
    }

    #[test]
    fn test_growing_writer_locks_whole_file(size in 0u64..4096, block in 512u64..4096, end in 1u64..1 << 20) {
        let lock = RangeLock::new();
        let geometry = || FileGeometry { size, block_size: block, max_block_size: 1 << 17 };
        let entry = lock.lock(0, end, RangeLockMode::Writer, geometry);
        if size.max(end) > block {
            prop_assert!(entry.is_whole_file());
            prop_assert_eq!(entry.len(), RANGE_UNBOUNDED);
        } else {
            prop_assert_eq!(entry.len(), end);
        }
    }

    #[test]
    fn test_appender_starts_at_end_of_file(size in 0u64..1 << 20, len in 1u64..4096) {
        let lock = RangeLock::new();
        let entry = lock.lock(0, len, RangeLockMode::Append, || FileGeometry { size, ..settled() });
        prop_assert_eq!(entry.offset(), size);
        prop_assert_eq!(entry.mode(), RangeLockMode::Append);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Any sequence of writes, appends and truncates reads back like a flat
    /// byte vector, whatever block size the file grows into.
    #[test]
    fn test_io_matches_flat_model(ops in proptest::collection::vec(any_io_op(), 1..24), small_blocks in any::<bool>()) {
        let config = ZplConfig {
            max_block_size: if small_blocks { 4096 } else { 128 * 1024 },
            read_chunk_size: 3000,
            ..Default::default()
        };
        let fs = TestFs::with_config(config);
        let root = fs.root();
        let f = fs.create_file(&root, "model");
        let cred = Cred::root();
        let mut model: Vec<u8> = Vec::new();

        for op in &ops {
            match *op {
                IoOp::Write { offset, len, fill } => {
                    let res = fs.mount.write(&f, offset as i64, &vec![fill; len], IoFlags::WRITE, &cred).unwrap();
                    prop_assert_eq!(res.written, len);
                    let end = offset as usize + len;
                    if model.len() < end {
                        model.resize(end, 0);
                    }
                    model[offset as usize..end].fill(fill);
                }
                IoOp::Append { len, fill } => {
                    let res = fs
                        .mount
                        .write(&f, 0, &vec![fill; len], IoFlags::WRITE | IoFlags::APPEND, &cred)
                        .unwrap();
                    prop_assert_eq!(res.offset, model.len() as u64);
                    model.extend(std::iter::repeat(fill).take(len));
                }
                IoOp::Truncate { size } => {
                    fs.mount.truncate(&f, size, &cred).unwrap();
                    model.resize(size as usize, 0);
                }
            }
            prop_assert_eq!(f.size(), model.len() as u64);
        }

        prop_assert_eq!(fs.read_all(&f), model.clone());
        let mid = model.len() / 2;
        let tail = fs.mount.read(&f, mid as i64, model.len(), IoFlags::READ).unwrap();
        prop_assert_eq!(&tail[..], &model[mid..]);
    }
}
