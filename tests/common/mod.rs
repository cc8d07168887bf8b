//! Shared harness for the integration suites
//!
//! Every test gets a scratch directory and an in-memory object store. Each
//! archive or restore call opens a fresh [`Repository`] from the store, the
//! way separate CLI runs would.

#![allow(dead_code)]

use arius::*;
use chrono::{DateTime, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

pub const PASSPHRASE: &str = "correct horse battery staple";

/// Chunk sizes small enough to get many chunks out of test-sized files
pub fn small_chunker() -> ChunkerConfig {
    ChunkerConfig {
        min_size: 1024,
        avg_size: 4096,
        max_size: 16 * 1024,
    }
}

/// Deterministic pseudo-random content
pub fn random_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = vec![0u8; len];
    rng.fill_bytes(&mut data);
    data
}

/// A fixed timestamp, `offset` seconds after 2024-01-01
pub fn fixed_time(offset: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(offset)
}

pub struct TestHarness {
    pub root: TempDir,
    pub store: Arc<MemoryObjectStore>,
    pub chunker: ChunkerConfig,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_chunker(ChunkerConfig::default())
    }

    pub fn with_chunker(chunker: ChunkerConfig) -> Self {
        Self {
            root: TempDir::new().unwrap(),
            store: Arc::new(MemoryObjectStore::new()),
            chunker,
        }
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn path(&self, relative_name: &str) -> PathBuf {
        self.root().join(relative_name)
    }

    pub fn pointer(&self, relative_name: &str) -> PathBuf {
        filesystem::pointer_path_for(&self.path(relative_name))
    }

    /// Write a binary with a pinned modification time
    pub fn write(&self, relative_name: &str, content: &[u8]) -> PathBuf {
        let path = self.path(relative_name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        filesystem::set_modified(&path, fixed_time(0)).unwrap();
        path
    }

    pub async fn open(&self) -> Repository {
        RepositoryBuilder::new()
            .store(self.store.clone())
            .passphrase(PASSPHRASE)
            .kdf(KdfParams::insecure_fast())
            .chunker(self.chunker)
            .upload_parallelism(4)
            .open()
            .await
            .unwrap()
    }

    pub async fn archive_with(&self, configure: impl FnOnce(&mut ArchiveOptions)) -> ArchiveSummary {
        let mut options = ArchiveOptions::new(self.root());
        configure(&mut options);
        self.open().await.archive(options).await.unwrap()
    }

    pub async fn archive(&self) -> ArchiveSummary {
        self.archive_with(|_| {}).await
    }

    pub async fn restore_with(&self, configure: impl FnOnce(&mut RestoreOptions)) -> RestoreSummary {
        let mut options = RestoreOptions::new(self.root());
        configure(&mut options);
        self.open().await.restore(options).await.unwrap()
    }

    pub fn chunk_objects(&self) -> usize {
        self.store.object_count(store::CHUNKS_PREFIX)
    }
}
