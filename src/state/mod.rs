//! State snapshot management
//!
//! The repository state (binary properties and the pointer-file-entry log)
//! lives in a SQLite database. Between runs it is stored remotely as sealed
//! snapshots under `states/<version>`; during a run it is a local working
//! copy in a temporary directory.
//!
//! ## Lifecycle
//!
//! 1. [`StateManager::open`] downloads the newest snapshot (or starts empty)
//! 2. Pipelines read and write through [`StateManager::db`]
//! 3. [`StateManager::commit`] vacuums, seals and uploads the working copy if
//!    anything changed, then demotes older snapshots to the archive tier

mod db;

pub use db::StateDb;

use crate::crypto::CryptoTransform;
use crate::error::{ArchiveError, Result};
use crate::store::{self, ObjectStore, PutOptions};
use crate::types::AccessTier;
use crate::utils;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, info, instrument};

/// Content marker of state snapshot objects
pub const STATE_CONTENT_TYPE: &str = "application/x-arius-state";

const STATE_FILE: &str = "state.db";

/// Owns the local working copy of the repository state for one run
#[derive(Debug)]
pub struct StateManager {
    store: Arc<dyn ObjectStore>,
    crypto: CryptoTransform,
    db: StateDb,
    base_version: Option<DateTime<Utc>>,
    states_kept_online: usize,
    // Dropped last so the database is closed before its directory goes away
    _workdir: TempDir,
}

impl StateManager {
    /// Load the newest remote snapshot into a fresh working copy
    ///
    /// # Errors
    ///
    /// - [`ArchiveError::Crypto`] if the snapshot was sealed with another passphrase
    /// - Store errors while listing or downloading
    #[instrument(skip_all)]
    pub async fn open(
        store: Arc<dyn ObjectStore>,
        crypto: CryptoTransform,
        states_kept_online: usize,
    ) -> Result<Self> {
        let workdir = tempfile::Builder::new().prefix("arius-state-").tempdir()?;
        let path = workdir.path().join(STATE_FILE);

        let base_version = Self::latest_remote(store.as_ref()).await?;
        match base_version {
            Some(version) => {
                let key = store::state_key(version);
                let sealed = store
                    .get(&key)
                    .await?
                    .ok_or_else(|| ArchiveError::ObjectNotFound(key.clone()))?;
                let crypto = crypto.clone();
                let plain = tokio::task::spawn_blocking(move || crypto.decrypt(&sealed)).await??;
                tokio::fs::write(&path, plain).await?;
                info!("Loaded state snapshot {}", version);
            }
            None => info!("No state snapshot found, starting with an empty repository state"),
        }

        let db = StateDb::open(&path)?;
        Ok(Self {
            store,
            crypto,
            db,
            base_version,
            states_kept_online: states_kept_online.max(1),
            _workdir: workdir,
        })
    }

    async fn latest_remote(store: &dyn ObjectStore) -> Result<Option<DateTime<Utc>>> {
        let keys = store.list(store::STATES_PREFIX).await?;
        Ok(keys.iter().filter_map(|key| store::parse_state_key(key)).max())
    }

    /// The working copy
    pub fn db(&self) -> &StateDb {
        &self.db
    }

    /// Version of the snapshot this working copy was loaded from
    pub fn base_version(&self) -> Option<DateTime<Utc>> {
        self.base_version
    }

    /// A version for a new run, strictly after every existing version
    pub fn next_version(&self) -> Result<DateTime<Utc>> {
        let now = utils::now_millis();
        let newest_entry = self.db.versions()?.last().copied();
        let floor = match (self.base_version, newest_entry) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        Ok(match floor {
            Some(floor) if now <= floor => floor + Duration::milliseconds(1),
            _ => now,
        })
    }

    /// Publish the working copy as the snapshot for `version`
    ///
    /// Returns `false` without touching the store if nothing changed.
    #[instrument(skip(self), fields(version = %version))]
    pub async fn commit(&self, version: DateTime<Utc>) -> Result<bool> {
        if !self.db.is_dirty() {
            info!("State unchanged, skipping snapshot upload");
            return Ok(false);
        }

        self.db.vacuum()?;
        let plain = tokio::fs::read(self.db.path()).await?;
        let plain_len = plain.len();
        let crypto = self.crypto.clone();
        let sealed = tokio::task::spawn_blocking(move || crypto.encrypt(&plain)).await??;

        let key = store::state_key(version);
        let length = self
            .store
            .put(
                &key,
                sealed,
                PutOptions::new(AccessTier::Cool)
                    .content_type(STATE_CONTENT_TYPE)
                    .overwrite(true),
            )
            .await?;
        self.db.mark_clean();
        info!(
            "Published state snapshot {} ({} -> {})",
            key,
            utils::format_bytes(plain_len as u64),
            utils::format_bytes(length)
        );

        self.demote_old_snapshots().await?;
        Ok(true)
    }

    async fn demote_old_snapshots(&self) -> Result<()> {
        let mut keys: Vec<_> = self
            .store
            .list(store::STATES_PREFIX)
            .await?
            .into_iter()
            .filter(|key| store::parse_state_key(key).is_some())
            .collect();
        keys.sort();

        let keep_from = keys.len().saturating_sub(self.states_kept_online);
        for key in &keys[..keep_from] {
            let Some(properties) = self.store.properties(key).await? else {
                continue;
            };
            if properties.tier != AccessTier::Archive {
                self.store.set_tier(key, AccessTier::Archive).await?;
                debug!("Demoted {} to the archive tier", key);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KdfParams;
    use crate::store::MemoryObjectStore;
    use crate::types::{BinaryHash, BinaryProperties, Hash, PointerFileEntry};
    use tracing_test::traced_test;

    fn crypto(passphrase: &str) -> CryptoTransform {
        CryptoTransform::with_params(passphrase, KdfParams::insecure_fast()).unwrap()
    }

    fn add_entry(db: &StateDb, name: &str, version: DateTime<Utc>) {
        let hash = BinaryHash(Hash::from_bytes([3; 32]));
        db.add_binary_properties(&BinaryProperties {
            hash,
            original_length: 1,
            archived_length: 1,
            incremental_length: 1,
            chunk_count: 1,
        })
        .unwrap();
        db.upsert_pointer_file_entry(&PointerFileEntry::live(name, hash, version, None, None))
            .unwrap();
    }

    #[tokio::test]
    #[traced_test]
    async fn test_clean_state_is_not_uploaded() {
        let store = Arc::new(MemoryObjectStore::new());
        let manager = StateManager::open(store.clone(), crypto("pw"), 1).await.unwrap();
        assert!(manager.base_version().is_none());

        let version = manager.next_version().unwrap();
        assert!(!manager.commit(version).await.unwrap());
        assert_eq!(store.put_count(), 0);
        assert!(logs_contain("State unchanged"));
    }

    #[tokio::test]
    async fn test_commit_then_reopen() {
        let store = Arc::new(MemoryObjectStore::new());
        let manager = StateManager::open(store.clone(), crypto("pw"), 1).await.unwrap();
        let version = manager.next_version().unwrap();
        add_entry(manager.db(), "a.txt", version);
        assert!(manager.commit(version).await.unwrap());
        // Second commit of the same run has nothing new
        assert!(!manager.commit(version).await.unwrap());
        drop(manager);

        let reopened = StateManager::open(store.clone(), crypto("pw"), 1).await.unwrap();
        assert_eq!(reopened.base_version(), Some(version));
        assert_eq!(reopened.db().versions().unwrap(), vec![version]);
        assert!(reopened.next_version().unwrap() > version);

        let err = StateManager::open(store, crypto("wrong"), 1).await.unwrap_err();
        assert!(matches!(err, ArchiveError::Crypto(_)));
    }

    #[tokio::test]
    async fn test_older_snapshots_are_demoted() {
        let store = Arc::new(MemoryObjectStore::new());
        let mut versions = Vec::new();
        for name in ["a", "b", "c"] {
            let manager = StateManager::open(store.clone(), crypto("pw"), 1).await.unwrap();
            let version = manager.next_version().unwrap();
            add_entry(manager.db(), name, version);
            manager.commit(version).await.unwrap();
            versions.push(version);
        }

        let tiers: Vec<_> = {
            let mut tiers = Vec::new();
            for version in &versions {
                let key = store::state_key(*version);
                tiers.push(store.properties(&key).await.unwrap().unwrap().tier);
            }
            tiers
        };
        assert_eq!(tiers, vec![AccessTier::Archive, AccessTier::Archive, AccessTier::Cool]);

        let latest = StateManager::open(store, crypto("pw"), 1).await.unwrap();
        assert_eq!(latest.db().latest_entries(false).unwrap().len(), 3);
    }
}
