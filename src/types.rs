//! Core data types used throughout the Arius library
//!
//! This module contains fundamental data structures that are shared across
//! different components of the library.
//!
//! ## Overview
//!
//! The types in this module represent:
//! - **Content addresses**: [`Hash`], [`ChunkHash`], [`BinaryHash`]
//! - **Repository records**: [`BinaryProperties`], [`PointerFileEntry`]
//! - **Storage classes**: [`AccessTier`], [`HydrationStatus`]
//! - **Operation results**: [`UpsertResult`], [`DownloadOutcome`], [`ArchiveSummary`], [`RestoreSummary`]
//! - **Configuration**: [`RepositoryConfig`], [`ArchiveOptions`], [`RestoreOptions`]
//!
//! ## Examples
//!
//! ```rust
//! use arius::types::{BinaryHash, ChunkHash};
//!
//! let hex = "ab".repeat(32);
//! let binary: BinaryHash = hex.parse().unwrap();
//!
//! // A single-chunk binary is addressed by the same value as its only chunk
//! let chunk = ChunkHash::from(binary);
//! assert_eq!(chunk.to_string(), binary.to_string());
//! ```

use crate::chunker::ChunkerConfig;
use crate::crypto::KdfParams;
use crate::error::ArchiveError;
use crate::utils;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Length in bytes of every content fingerprint
pub const HASH_LEN: usize = 32;

/// Opaque fixed-size content fingerprint
///
/// Serialized as a lowercase hex string in every format so that chunk lists,
/// pointer files and object keys agree on a single textual form.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash([u8; HASH_LEN]);

impl Hash {
    /// Wrap raw digest bytes
    pub fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw digest bytes
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Parse from a slice, failing if the length is wrong
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; HASH_LEN] = bytes.try_into().ok()?;
        Some(Self(array))
    }

    /// Full lowercase hex rendering
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First eight hex characters, for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.short())
    }
}

impl FromStr for Hash {
    type Err = ArchiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let bytes = hex::decode(s)
            .map_err(|e| ArchiveError::internal(format!("invalid hash '{}': {}", s, e)))?;
        Self::from_slice(&bytes).ok_or_else(|| {
            ArchiveError::internal(format!(
                "invalid hash '{}': expected {} bytes, got {}",
                s,
                HASH_LEN,
                bytes.len()
            ))
        })
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

macro_rules! hash_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Hash);

        impl $name {
            /// Underlying fingerprint
            pub fn as_hash(&self) -> &Hash {
                &self.0
            }

            /// First eight hex characters, for log lines
            pub fn short(&self) -> String {
                self.0.short()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0.short())
            }
        }

        impl FromStr for $name {
            type Err = ArchiveError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.parse()?))
            }
        }

        impl From<Hash> for $name {
            fn from(hash: Hash) -> Self {
                Self(hash)
            }
        }
    };
}

hash_newtype!(
    /// Identifies the plaintext bytes of one chunk
    ChunkHash
);

hash_newtype!(
    /// Identifies the plaintext content of a whole file
    BinaryHash
);

impl From<BinaryHash> for ChunkHash {
    /// A single-chunk binary is stored as exactly one chunk with the same hash
    fn from(hash: BinaryHash) -> Self {
        ChunkHash(hash.0)
    }
}

/// Cost/latency storage class of a remote object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AccessTier {
    /// Frequent access, highest storage cost
    Hot,
    /// Infrequent access
    #[default]
    Cool,
    /// Rare access
    Cold,
    /// Offline; must be rehydrated before it can be read
    Archive,
}

impl AccessTier {
    /// Whether objects in this tier can be read without hydration
    pub fn is_online(&self) -> bool {
        !matches!(self, AccessTier::Archive)
    }
}

impl fmt::Display for AccessTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AccessTier::Hot => "hot",
            AccessTier::Cool => "cool",
            AccessTier::Cold => "cold",
            AccessTier::Archive => "archive",
        };
        f.write_str(name)
    }
}

impl FromStr for AccessTier {
    type Err = ArchiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hot" => Ok(AccessTier::Hot),
            "cool" => Ok(AccessTier::Cool),
            "cold" => Ok(AccessTier::Cold),
            "archive" => Ok(AccessTier::Archive),
            other => Err(ArchiveError::InvalidConfiguration(format!(
                "unknown access tier '{}'",
                other
            ))),
        }
    }
}

/// Progress of promoting an archive-tier chunk to a readable copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HydrationStatus {
    /// No staging copy has been requested
    NotStarted,
    /// A staging copy was requested and is not readable yet
    Pending,
    /// A readable staging copy exists (or the chunk never needed one)
    Done,
}

/// Per-binary metadata, created once per distinct [`BinaryHash`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryProperties {
    /// Hash of the plaintext content
    pub hash: BinaryHash,
    /// Plaintext length in bytes
    pub original_length: u64,
    /// Sum of stored (compressed + encrypted) chunk lengths
    pub archived_length: u64,
    /// Bytes newly written to realize this binary
    pub incremental_length: u64,
    /// Number of chunks; 1 means the binary is its own chunk
    pub chunk_count: u32,
}

/// One append-only, versioned record mapping a path to content or a tombstone
///
/// Timestamps are truncated to millisecond precision on construction so that
/// values read back from the state database compare equal to fresh ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointerFileEntry {
    /// Referenced binary; `None` for tombstones
    pub binary_hash: Option<BinaryHash>,
    /// Forward-slash separated path relative to the archive root
    pub relative_name: String,
    /// Version (run timestamp) this entry belongs to
    pub version_utc: DateTime<Utc>,
    /// Whether this entry marks the path as deleted
    pub is_deleted: bool,
    /// Creation time of the file, when known
    pub creation_time_utc: Option<DateTime<Utc>>,
    /// Last write time of the file, when known
    pub last_write_time_utc: Option<DateTime<Utc>>,
}

impl PointerFileEntry {
    /// Build a live entry for a path
    pub fn live(
        relative_name: impl Into<String>,
        binary_hash: BinaryHash,
        version_utc: DateTime<Utc>,
        creation_time_utc: Option<DateTime<Utc>>,
        last_write_time_utc: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            binary_hash: Some(binary_hash),
            relative_name: relative_name.into(),
            version_utc: utils::truncate_to_millis(version_utc),
            is_deleted: false,
            creation_time_utc: creation_time_utc.map(utils::truncate_to_millis),
            last_write_time_utc: last_write_time_utc.map(utils::truncate_to_millis),
        }
    }

    /// Build a tombstone for the path of `prior`
    pub fn tombstone(prior: &PointerFileEntry, version_utc: DateTime<Utc>) -> Self {
        Self {
            binary_hash: None,
            relative_name: prior.relative_name.clone(),
            version_utc: utils::truncate_to_millis(version_utc),
            is_deleted: true,
            creation_time_utc: None,
            last_write_time_utc: None,
        }
    }

    /// Semantic equality: everything except the version
    pub fn same_state_as(&self, other: &PointerFileEntry) -> bool {
        self.binary_hash == other.binary_hash
            && self.is_deleted == other.is_deleted
            && self.creation_time_utc == other.creation_time_utc
            && self.last_write_time_utc == other.last_write_time_utc
    }
}

/// Outcome of appending to the pointer-file-entry log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertResult {
    /// A live entry was appended
    Upserted,
    /// A tombstone was appended
    InsertedDeleted,
    /// The entry matched the authoritative one; nothing was appended
    NoChange,
}

/// Result of uploading one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkUpload {
    /// Stored length of the chunk object
    pub archived_length: u64,
    /// Bytes written by this call (0 when the chunk already existed)
    pub incremental_length: u64,
}

/// Result of trying to restore a binary
///
/// Pending hydration is reported, never raised: callers re-invoke later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// Every chunk was readable and the binary was written to the target
    Restored {
        /// Number of chunks concatenated
        chunks: usize,
        /// How many of them were read from a hydration staging copy
        from_staging: usize,
        /// Plaintext bytes written
        bytes: u64,
    },
    /// At least one chunk is archived without a readable staging copy
    NotYetHydrated {
        /// Hydration requests issued by this call
        requested: usize,
        /// Chunks whose hydration was already in progress
        pending: usize,
    },
}

impl DownloadOutcome {
    /// Whether the binary was written
    pub fn is_restored(&self) -> bool {
        matches!(self, DownloadOutcome::Restored { .. })
    }
}

/// Repository-wide tuning
#[derive(Debug, Clone)]
pub struct RepositoryConfig {
    /// Content-defined chunking bounds
    pub chunker: ChunkerConfig,
    /// Width of the CPU pool used for hashing and encryption
    pub hash_parallelism: usize,
    /// Number of binaries processed concurrently
    pub binary_parallelism: usize,
    /// Chunk upload workers per binary
    pub upload_parallelism: usize,
    /// Bound of the queue between chunk emission and upload workers
    pub chunk_queue_capacity: usize,
    /// Number of newest state snapshots kept on a readable tier
    pub states_kept_online: usize,
    /// Cost of deriving the repository key from the passphrase
    pub kdf: KdfParams,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        let cpus = num_cpus::get().max(1);
        Self {
            chunker: ChunkerConfig::default(),
            hash_parallelism: cpus,
            binary_parallelism: cpus.clamp(2, 8),
            upload_parallelism: (cpus * 2).clamp(4, 32),
            chunk_queue_capacity: 16,
            states_kept_online: 1,
            kdf: KdfParams::default(),
        }
    }
}

/// Options for an archive run
#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    /// Directory to archive
    pub root: PathBuf,
    /// Use content-defined chunking instead of one chunk per file
    pub dedup: bool,
    /// Tier for newly uploaded chunks
    pub tier: AccessTier,
    /// Delete binaries locally once archived, leaving pointers
    pub remove_local: bool,
    /// Trust an unchanged pointer instead of rehashing
    pub fast_hash: bool,
    /// Glob patterns (relative names) that are never archived
    pub exclude_patterns: Vec<String>,
}

impl ArchiveOptions {
    /// Options with defaults for everything but the root
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            dedup: false,
            tier: AccessTier::Cool,
            remove_local: false,
            fast_hash: false,
            exclude_patterns: vec![
                "**/.DS_Store".to_string(),
                "**/Thumbs.db".to_string(),
                "**/desktop.ini".to_string(),
                "**/@eaDir/**".to_string(),
            ],
        }
    }
}

/// Options for a restore run
#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Directory to restore into
    pub root: PathBuf,
    /// Reconcile local pointer files with the repository
    pub synchronize: bool,
    /// Download binaries for pointer files
    pub download: bool,
    /// Keep pointer files next to restored binaries
    pub keep_pointers: bool,
    /// Restore the state as of this instant instead of the latest version
    pub point_in_time: Option<DateTime<Utc>>,
}

impl RestoreOptions {
    /// Options with defaults for everything but the root
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            synchronize: true,
            download: false,
            keep_pointers: true,
            point_in_time: None,
        }
    }
}

/// One item of a batch that failed without aborting the run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    /// Path relative to the run's root
    pub relative_name: String,
    /// Rendered error
    pub message: String,
}

/// Statistics from an archive run
#[derive(Debug, Clone, Default)]
pub struct ArchiveSummary {
    /// Version shared by all entries appended in this run
    pub version: Option<DateTime<Utc>>,
    /// Files and pointers examined
    pub files_scanned: usize,
    /// Distinct binaries uploaded in this run
    pub binaries_uploaded: usize,
    /// Chunks written to the store in this run
    pub chunks_uploaded: usize,
    /// Plaintext bytes of the uploaded binaries
    pub bytes_original: u64,
    /// Bytes newly written to the store
    pub bytes_incremental: u64,
    /// Pointer files created or rewritten
    pub pointers_written: usize,
    /// Live entries appended
    pub entries_upserted: usize,
    /// Tombstones appended
    pub entries_deleted: usize,
    /// Local binaries removed after archiving
    pub binaries_removed: usize,
    /// Whether a new state snapshot was published
    pub state_committed: bool,
    /// Per-item failures
    pub failures: Vec<ItemFailure>,
}

impl ArchiveSummary {
    /// Whether any item failed
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Statistics from a restore run
#[derive(Debug, Clone, Default)]
pub struct RestoreSummary {
    /// Version the restore resolved to
    pub version: Option<DateTime<Utc>>,
    /// Pointer files created or corrected
    pub pointers_created: usize,
    /// Pointer files removed because the path is not live
    pub pointers_deleted: usize,
    /// Binaries written
    pub binaries_restored: usize,
    /// Binaries waiting for hydration
    pub binaries_pending: usize,
    /// Hydration requests issued
    pub hydrations_requested: usize,
    /// Plaintext bytes written
    pub bytes_restored: u64,
    /// Per-item failures
    pub failures: Vec<ItemFailure>,
}

impl RestoreSummary {
    /// Whether every requested binary is on disk
    pub fn is_complete(&self) -> bool {
        self.binaries_pending == 0 && self.failures.is_empty()
    }
}
