//! Property-based tests for archive/restore invariants

mod common;

use arius::{filesystem, ChunkHash};
use common::*;
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::fs;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

/// File sets: names drawn from a small pool so runs overlap and repeat content
fn file_set() -> impl Strategy<Value = BTreeMap<String, (u64, usize)>> {
    prop::collection::btree_map(
        prop::sample::select(vec!["a.bin", "b.bin", "dir/c.bin", "dir/sub/d.bin", "e.bin"])
            .prop_map(str::to_string),
        (0u64..4, prop_oneof![Just(0usize), 1usize..2_000, 10_000usize..60_000]),
        1..5,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn prop_archive_then_restore_returns_content(files in file_set(), dedup in any::<bool>()) {
        runtime().block_on(async {
            let harness = TestHarness::with_chunker(small_chunker());
            for (name, (seed, len)) in &files {
                harness.write(name, &random_bytes(*seed, *len));
            }

            harness.archive_with(|o| {
                o.dedup = dedup;
                o.remove_local = true;
            }).await;
            let summary = harness.restore_with(|o| o.download = true).await;
            assert_eq!(summary.binaries_restored, files.len());

            for (name, (seed, len)) in &files {
                assert_eq!(fs::read(harness.path(name)).unwrap(), random_bytes(*seed, *len));
            }
        });
    }

    #[test]
    fn prop_entry_history_is_monotonic(runs in prop::collection::vec(file_set(), 1..4)) {
        runtime().block_on(async {
            let harness = TestHarness::with_chunker(small_chunker());
            for files in &runs {
                // Each run sees exactly this file set
                for pair in filesystem::scan(harness.root(), &globset::GlobSet::empty()).unwrap().pairs {
                    for path in pair.binary.iter().chain(pair.pointer.iter()) {
                        fs::remove_file(path).unwrap();
                    }
                }
                for (name, (seed, len)) in files {
                    harness.write(name, &random_bytes(*seed, *len));
                }
                harness.archive_with(|o| o.dedup = true).await;

                let repository = harness.open().await;
                let live: BTreeMap<_, _> = repository
                    .entries(None, false)
                    .unwrap()
                    .into_iter()
                    .map(|e| (e.relative_name, e.binary_hash))
                    .collect();
                assert_eq!(live.len(), files.len());
                for (name, (seed, len)) in files {
                    let expected = repository.hasher().hash_chunk(&random_bytes(*seed, *len));
                    assert_eq!(live[name].map(ChunkHash::from), Some(expected));
                }
            }

            // Every version's view is consistent with the one before it
            let repository = harness.open().await;
            let versions = repository.versions().unwrap();
            assert!(versions.windows(2).all(|w| w[0] < w[1]));
            let mut previous = 0;
            for version in &versions {
                let with_deleted = repository.entries(Some(*version), true).unwrap().len();
                assert!(with_deleted >= previous, "names never disappear from the log");
                previous = with_deleted;
            }
        });
    }
}
