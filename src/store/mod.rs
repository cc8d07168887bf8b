//! Remote object store abstraction
//!
//! The repository talks to blob storage only through [`ObjectStore`]. Objects
//! are opaque byte blobs addressed by a string key, each with a length, an
//! [`AccessTier`], an optional content type and a rehydration status.
//!
//! ## Key layout
//!
//! | Prefix                 | Content                                  |
//! |------------------------|------------------------------------------|
//! | `chunks/`              | sealed chunk, keyed by chunk hash        |
//! | `chunks-rehydrated/`   | readable staging copy of archived chunks |
//! | `chunklists/`          | sealed chunk list, keyed by binary hash  |
//! | `states/`              | sealed state snapshot, keyed by version  |
//!
//! Two implementations ship with the crate: [`LocalObjectStore`] keeps objects
//! in a directory and [`MemoryObjectStore`] keeps them in process, with
//! controllable rehydration for tests.

mod local;
mod memory;

pub use local::LocalObjectStore;
pub use memory::MemoryObjectStore;

use crate::error::Result;
use crate::types::{AccessTier, BinaryHash, ChunkHash};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Prefix for chunk objects
pub const CHUNKS_PREFIX: &str = "chunks/";
/// Prefix for hydration staging copies
pub const REHYDRATED_PREFIX: &str = "chunks-rehydrated/";
/// Prefix for chunk lists
pub const CHUNKLISTS_PREFIX: &str = "chunklists/";
/// Prefix for state snapshots
pub const STATES_PREFIX: &str = "states/";

const STATE_KEY_FORMAT: &str = "%Y-%m-%dT%H-%M-%S%.3fZ";

/// Key of the primary copy of a chunk
pub fn chunk_key(hash: &ChunkHash) -> String {
    format!("{}{}", CHUNKS_PREFIX, hash)
}

/// Key of the hydration staging copy of a chunk
pub fn rehydrated_key(hash: &ChunkHash) -> String {
    format!("{}{}", REHYDRATED_PREFIX, hash)
}

/// Key of the chunk list of a binary
pub fn chunk_list_key(hash: &BinaryHash) -> String {
    format!("{}{}", CHUNKLISTS_PREFIX, hash)
}

/// Key of the state snapshot for a version
///
/// The rendering sorts lexicographically in version order.
pub fn state_key(version: DateTime<Utc>) -> String {
    format!("{}{}", STATES_PREFIX, version.format(STATE_KEY_FORMAT))
}

/// Version encoded in a state snapshot key, if it is one
pub fn parse_state_key(key: &str) -> Option<DateTime<Utc>> {
    let name = key.strip_prefix(STATES_PREFIX)?;
    NaiveDateTime::parse_from_str(name, STATE_KEY_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Rehydration status of an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveStatus {
    /// Never rehydrated
    #[default]
    None,
    /// Copy from the archive tier in progress
    Pending,
    /// Copy from the archive tier complete
    Done,
}

/// Metadata of a stored object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectProperties {
    /// Stored length in bytes
    pub length: u64,
    /// Current access tier
    pub tier: AccessTier,
    /// Content marker set on upload
    pub content_type: Option<String>,
    /// Rehydration status
    #[serde(default)]
    pub archive_status: ArchiveStatus,
}

impl ObjectProperties {
    /// Whether the content can be read right now
    pub fn is_readable(&self) -> bool {
        self.tier.is_online() && self.archive_status != ArchiveStatus::Pending
    }
}

/// Options for [`ObjectStore::put`]
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    /// Tier to store the object in
    pub tier: AccessTier,
    /// Content marker
    pub content_type: Option<String>,
    /// Replace an existing object instead of failing
    pub overwrite: bool,
}

impl PutOptions {
    /// Options for a new object in `tier`
    pub fn new(tier: AccessTier) -> Self {
        Self {
            tier,
            ..Self::default()
        }
    }

    /// Set the content marker
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Allow replacing an existing object
    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }
}

/// Key-addressed blob storage with access tiers
///
/// Implementations must be safe to share between tasks. Retry and backoff
/// of transport errors is the implementation's concern; the repository
/// treats every error it sees as final for that operation.
#[async_trait]
pub trait ObjectStore: Send + Sync + std::fmt::Debug {
    /// Store `data` under `key` and return the stored length
    ///
    /// Fails with [`ArchiveError::ObjectAlreadyExists`](crate::error::ArchiveError::ObjectAlreadyExists)
    /// if the key is taken and `options.overwrite` is false.
    async fn put(&self, key: &str, data: Vec<u8>, options: PutOptions) -> Result<u64>;

    /// Read an object; `None` if absent
    ///
    /// Fails with [`ArchiveError::ObjectArchived`](crate::error::ArchiveError::ObjectArchived)
    /// for objects that are not readable in their current tier.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Metadata of an object; `None` if absent
    async fn properties(&self, key: &str) -> Result<Option<ObjectProperties>>;

    /// Whether an object exists
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.properties(key).await?.is_some())
    }

    /// All keys starting with `prefix`, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Move an object to another tier
    async fn set_tier(&self, key: &str, tier: AccessTier) -> Result<()>;

    /// Copy `src` to `dst` in `tier`, rehydrating if `src` is archived
    async fn copy(&self, src: &str, dst: &str, tier: AccessTier) -> Result<()>;

    /// Remove an object; returns whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_state_keys_sort_and_parse() {
        let early = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let late = Utc.timestamp_millis_opt(1_700_000_100_004).unwrap();

        let (a, b) = (state_key(early), state_key(late));
        assert!(a < b);
        assert_eq!(parse_state_key(&a), Some(early));
        assert_eq!(parse_state_key(&b), Some(late));
        assert_eq!(parse_state_key("chunks/abc"), None);
    }

    #[test]
    fn test_readability() {
        let mut props = ObjectProperties {
            length: 10,
            tier: AccessTier::Cool,
            content_type: None,
            archive_status: ArchiveStatus::None,
        };
        assert!(props.is_readable());
        props.archive_status = ArchiveStatus::Pending;
        assert!(!props.is_readable());
        props.archive_status = ArchiveStatus::None;
        props.tier = AccessTier::Archive;
        assert!(!props.is_readable());
    }
}
