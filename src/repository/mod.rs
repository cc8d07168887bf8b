//! Repository: the entry point tying storage, state and pipelines together
//!
//! A [`Repository`] is opened once per run. Opening derives the encryption key
//! from the passphrase and loads the newest state snapshot; the archive and
//! restore pipelines then work against it, and an archive run publishes a new
//! snapshot when it finishes.
//!
//! ## Examples
//!
//! ```rust,no_run
//! use arius::{ArchiveOptions, RepositoryBuilder};
//!
//! # async fn example() -> arius::Result<()> {
//! let repository = RepositoryBuilder::new()
//!     .local_store("/mnt/backup/arius")?
//!     .passphrase("correct horse battery staple")
//!     .upload_parallelism(16)
//!     .open()
//!     .await?;
//!
//! let summary = repository.archive(ArchiveOptions::new("/home/me/photos")).await?;
//! println!("{} binaries uploaded", summary.binaries_uploaded);
//! # Ok(())
//! # }
//! ```

mod binaries;
mod chunks;

pub use binaries::BinaryUpload;
pub use chunks::{ChunkRepository, StoredChunk, CHUNK_CONTENT_TYPE, CHUNK_LIST_CONTENT_TYPE};

use crate::chunker::ChunkerConfig;
use crate::crypto::{CryptoTransform, KdfParams};
use crate::error::{ArchiveError, Result};
use crate::hashing::Hasher;
use crate::single_flight::SingleFlight;
use crate::state::{StateDb, StateManager};
use crate::store::{LocalObjectStore, ObjectStore};
use crate::types::{BinaryHash, PointerFileEntry, RepositoryConfig};
use crate::utils::CpuPool;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

struct RepositoryInner {
    store: Arc<dyn ObjectStore>,
    hasher: Hasher,
    config: RepositoryConfig,
    cpu: CpuPool,
    chunks: Arc<ChunkRepository>,
    binaries: SingleFlight<BinaryHash, BinaryUpload>,
    state: StateManager,
}

/// An open repository; cheap to clone and share between tasks
#[derive(Clone)]
pub struct Repository {
    inner: Arc<RepositoryInner>,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("store", &self.inner.store)
            .field("config", &self.inner.config)
            .field("base_version", &self.inner.state.base_version())
            .finish()
    }
}

impl Repository {
    /// Start configuring a repository
    pub fn builder() -> RepositoryBuilder {
        RepositoryBuilder::new()
    }

    /// The object store backing this repository
    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.inner.store
    }

    /// Repository configuration
    pub fn config(&self) -> &RepositoryConfig {
        &self.inner.config
    }

    /// Salted content hasher
    pub fn hasher(&self) -> &Hasher {
        &self.inner.hasher
    }

    /// Pool for CPU-bound work
    pub fn cpu(&self) -> &CpuPool {
        &self.inner.cpu
    }

    /// Chunk storage
    pub fn chunks(&self) -> &ChunkRepository {
        &self.inner.chunks
    }

    /// State snapshot manager
    pub fn state(&self) -> &StateManager {
        &self.inner.state
    }

    /// Working copy of the repository state
    pub fn db(&self) -> &StateDb {
        self.inner.state.db()
    }

    /// All versions, ascending
    pub fn versions(&self) -> Result<Vec<DateTime<Utc>>> {
        self.db().versions()
    }

    /// Entries as of `point_in_time`, or the latest ones
    pub fn entries(&self, point_in_time: Option<DateTime<Utc>>, include_deleted: bool) -> Result<Vec<PointerFileEntry>> {
        match point_in_time {
            Some(at) => self.db().entries_as_of(at, include_deleted),
            None => self.db().latest_entries(include_deleted),
        }
    }
}

/// Builder for opening a [`Repository`]
///
/// # Default Values
///
/// - chunk sizes: 16 KiB / 64 KiB / 256 KiB
/// - hashing parallelism: number of CPU cores
/// - chunk queue capacity: 16
/// - state snapshots kept online: 1
pub struct RepositoryBuilder {
    store: Option<Arc<dyn ObjectStore>>,
    passphrase: Option<String>,
    config: RepositoryConfig,
}

impl std::fmt::Debug for RepositoryBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryBuilder")
            .field("store", &self.store)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .field("config", &self.config)
            .finish()
    }
}

impl Default for RepositoryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RepositoryBuilder {
    /// Create a builder with default settings
    pub fn new() -> Self {
        Self {
            store: None,
            passphrase: None,
            config: RepositoryConfig::default(),
        }
    }

    /// Use an existing object store
    pub fn store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use a directory as the object store
    pub fn local_store(self, root: impl Into<PathBuf>) -> Result<Self> {
        let store = LocalObjectStore::open(root)?;
        Ok(self.store(Arc::new(store)))
    }

    /// Passphrase for encryption and hash salting
    pub fn passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: RepositoryConfig) -> Self {
        self.config = config;
        self
    }

    /// Content-defined chunking bounds
    pub fn chunker(mut self, chunker: ChunkerConfig) -> Self {
        self.config.chunker = chunker;
        self
    }

    /// Width of the CPU pool for hashing and encryption
    pub fn hash_parallelism(mut self, workers: usize) -> Self {
        self.config.hash_parallelism = workers;
        self
    }

    /// Number of binaries archived concurrently
    pub fn binary_parallelism(mut self, workers: usize) -> Self {
        self.config.binary_parallelism = workers;
        self
    }

    /// Number of chunk upload workers per binary
    pub fn upload_parallelism(mut self, workers: usize) -> Self {
        self.config.upload_parallelism = workers;
        self
    }

    /// Bound of the queue between chunk emission and upload
    pub fn chunk_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.chunk_queue_capacity = capacity;
        self
    }

    /// Number of newest state snapshots left on a readable tier
    pub fn states_kept_online(mut self, count: usize) -> Self {
        self.config.states_kept_online = count;
        self
    }

    /// Key derivation cost
    pub fn kdf(mut self, kdf: KdfParams) -> Self {
        self.config.kdf = kdf;
        self
    }

    fn validate(&self) -> Result<()> {
        let config = &self.config;
        config.chunker.validate()?;
        let widths = [
            ("hash_parallelism", config.hash_parallelism),
            ("binary_parallelism", config.binary_parallelism),
            ("upload_parallelism", config.upload_parallelism),
            ("chunk_queue_capacity", config.chunk_queue_capacity),
            ("states_kept_online", config.states_kept_online),
        ];
        for (name, value) in widths {
            if value == 0 {
                return Err(ArchiveError::InvalidConfiguration(format!("{} must be at least 1", name)));
            }
        }
        Ok(())
    }

    /// Derive keys, load the newest state snapshot and open the repository
    ///
    /// # Errors
    ///
    /// - [`ArchiveError::InvalidConfiguration`] for a missing store or
    ///   passphrase, or invalid settings
    /// - [`ArchiveError::Crypto`] if the passphrase does not match the repository
    pub async fn open(self) -> Result<Repository> {
        self.validate()?;
        let store = self
            .store
            .ok_or_else(|| ArchiveError::InvalidConfiguration("no object store configured".to_string()))?;
        let passphrase = self
            .passphrase
            .ok_or_else(|| ArchiveError::InvalidConfiguration("no passphrase configured".to_string()))?;
        let config = self.config;

        let hasher = Hasher::new(&passphrase);
        let kdf = config.kdf;
        let crypto = tokio::task::spawn_blocking(move || CryptoTransform::with_params(&passphrase, kdf)).await??;
        let cpu = CpuPool::new(config.hash_parallelism)?;

        let state = StateManager::open(store.clone(), crypto.clone(), config.states_kept_online).await?;
        let chunks = Arc::new(ChunkRepository::new(store.clone(), crypto, hasher.clone(), cpu.clone()));

        info!(
            "Opened repository ({} versions)",
            state.db().versions()?.len()
        );
        Ok(Repository {
            inner: Arc::new(RepositoryInner {
                store,
                hasher,
                config,
                cpu,
                chunks,
                binaries: SingleFlight::new(),
                state,
            }),
        })
    }
}
