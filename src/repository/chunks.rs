//! Content-addressed chunk and chunk-list storage
//!
//! Chunks are sealed (compressed, then encrypted) and written once under
//! `chunks/<hash>`. Uploads are single-flight per [`ChunkHash`]: concurrent
//! callers for the same hash share one upload, and once a hash is known to
//! be present no further network call is made for it in this process.
//!
//! Archive-tier chunks are read through a staging copy under
//! `chunks-rehydrated/<hash>`, requested with [`ChunkRepository::hydrate`].

use crate::crypto::CryptoTransform;
use crate::error::{ArchiveError, Result};
use crate::hashing::Hasher;
use crate::single_flight::SingleFlight;
use crate::store::{self, ObjectProperties, ObjectStore, PutOptions};
use crate::types::{AccessTier, BinaryHash, ChunkHash, ChunkUpload, HydrationStatus};
use crate::utils::CpuPool;
use std::sync::Arc;
use tracing::{debug, instrument, trace, warn};

/// Content marker of chunk objects
pub const CHUNK_CONTENT_TYPE: &str = "application/x-arius-chunk";
/// Content marker of chunk list objects
pub const CHUNK_LIST_CONTENT_TYPE: &str = "application/x-arius-chunklist";

/// Tier of hydration staging copies
const STAGING_TIER: AccessTier = AccessTier::Cold;

/// A readable copy of a chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredChunk {
    /// Chunk identity
    pub hash: ChunkHash,
    /// Key of the readable copy
    pub key: String,
    /// Properties of the readable copy
    pub properties: ObjectProperties,
    /// Whether the copy is a hydration staging copy
    pub staged: bool,
}

/// Chunk store on top of an [`ObjectStore`]
#[derive(Debug)]
pub struct ChunkRepository {
    store: Arc<dyn ObjectStore>,
    crypto: CryptoTransform,
    hasher: Hasher,
    cpu: CpuPool,
    uploads: SingleFlight<ChunkHash, ChunkUpload>,
}

impl ChunkRepository {
    /// Create a chunk repository
    pub fn new(store: Arc<dyn ObjectStore>, crypto: CryptoTransform, hasher: Hasher, cpu: CpuPool) -> Self {
        Self {
            store,
            crypto,
            hasher,
            cpu,
            uploads: SingleFlight::new(),
        }
    }

    /// Store a chunk unless it already exists
    ///
    /// Returns the stored length and the number of bytes this call wrote.
    /// Callers that joined an in-flight upload, or hit a chunk already known
    /// to this process, get an incremental length of zero.
    pub async fn upload(&self, hash: ChunkHash, data: Vec<u8>, tier: AccessTier) -> Result<ChunkUpload> {
        let flight = self
            .uploads
            .run(&hash, || self.upload_uncached(hash, data, tier))
            .await?;

        Ok(if flight.led {
            flight.value
        } else {
            ChunkUpload {
                archived_length: flight.value.archived_length,
                incremental_length: 0,
            }
        })
    }

    async fn upload_uncached(&self, hash: ChunkHash, data: Vec<u8>, tier: AccessTier) -> Result<ChunkUpload> {
        let key = store::chunk_key(&hash);

        for _ in 0..2 {
            match self.store.properties(&key).await? {
                Some(existing) if existing.length > 0 => {
                    trace!("Chunk {} already stored", hash.short());
                    return Ok(ChunkUpload {
                        archived_length: existing.length,
                        incremental_length: 0,
                    });
                }
                Some(_) => {
                    warn!("Chunk {} is empty remotely, replacing it", hash.short());
                    self.store.delete(&key).await?;
                }
                None => {}
            }

            let crypto = self.crypto.clone();
            let plain = data.clone();
            let sealed = self.cpu.run(move || crypto.encrypt(&plain)).await?;
            let options = PutOptions::new(tier).content_type(CHUNK_CONTENT_TYPE);

            match self.store.put(&key, sealed, options).await {
                Ok(length) => {
                    trace!("Uploaded chunk {} ({} bytes, {})", hash.short(), length, tier);
                    return Ok(ChunkUpload {
                        archived_length: length,
                        incremental_length: length,
                    });
                }
                // Written concurrently by someone else; re-check what is there
                Err(ArchiveError::ObjectAlreadyExists(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(ArchiveError::storage(format!("chunk {} kept conflicting on upload", hash)))
    }

    /// Whether the chunk exists remotely
    pub async fn exists(&self, hash: &ChunkHash) -> Result<bool> {
        if self.uploads.completed(hash).is_some() {
            return Ok(true);
        }
        self.store.exists(&store::chunk_key(hash)).await
    }

    /// Locate a chunk
    ///
    /// With `require_hydrated`, an archive-tier chunk is only returned through
    /// a readable staging copy. `None` means absent (or not readable yet).
    pub async fn get(&self, hash: &ChunkHash, require_hydrated: bool) -> Result<Option<StoredChunk>> {
        let key = store::chunk_key(hash);
        let Some(primary) = self.store.properties(&key).await? else {
            return Ok(None);
        };
        if !require_hydrated || primary.is_readable() {
            return Ok(Some(StoredChunk {
                hash: *hash,
                key,
                properties: primary,
                staged: false,
            }));
        }

        let staging_key = store::rehydrated_key(hash);
        Ok(match self.store.properties(&staging_key).await? {
            Some(staged) if staged.is_readable() => Some(StoredChunk {
                hash: *hash,
                key: staging_key,
                properties: staged,
                staged: true,
            }),
            _ => None,
        })
    }

    /// Progress of making a chunk readable
    ///
    /// Chunks on an online tier report [`HydrationStatus::Done`].
    ///
    /// # Errors
    ///
    /// - [`ArchiveError::ObjectNotFound`] if the chunk does not exist
    pub async fn hydration_status(&self, hash: &ChunkHash) -> Result<HydrationStatus> {
        let key = store::chunk_key(hash);
        let primary = self
            .store
            .properties(&key)
            .await?
            .ok_or(ArchiveError::ObjectNotFound(key))?;
        if primary.is_readable() {
            return Ok(HydrationStatus::Done);
        }

        Ok(match self.store.properties(&store::rehydrated_key(hash)).await? {
            Some(staged) if staged.is_readable() => HydrationStatus::Done,
            Some(_) => HydrationStatus::Pending,
            None => HydrationStatus::NotStarted,
        })
    }

    /// Request a readable staging copy of an archive-tier chunk
    ///
    /// Returns `true` if a request was issued and `false` if one is already
    /// pending.
    ///
    /// # Errors
    ///
    /// - [`ArchiveError::InvariantViolation`] if the chunk is already readable
    pub async fn hydrate(&self, hash: &ChunkHash) -> Result<bool> {
        match self.hydration_status(hash).await? {
            HydrationStatus::Done => Err(ArchiveError::invariant(format!(
                "chunk {} is already hydrated",
                hash
            ))),
            HydrationStatus::Pending => {
                trace!("Hydration of {} already pending", hash.short());
                Ok(false)
            }
            HydrationStatus::NotStarted => {
                self.store
                    .copy(&store::chunk_key(hash), &store::rehydrated_key(hash), STAGING_TIER)
                    .await?;
                debug!("Requested hydration of chunk {}", hash.short());
                Ok(true)
            }
        }
    }

    /// Download, decrypt and verify a readable chunk
    pub async fn download(&self, chunk: &StoredChunk) -> Result<Vec<u8>> {
        let sealed = self
            .store
            .get(&chunk.key)
            .await?
            .ok_or_else(|| ArchiveError::ObjectNotFound(chunk.key.clone()))?;

        let crypto = self.crypto.clone();
        let hasher = self.hasher.clone();
        let expected = chunk.hash;
        self.cpu
            .run(move || {
                let plain = crypto.decrypt(&sealed)?;
                let actual = hasher.hash_chunk(&plain);
                if actual != expected {
                    return Err(ArchiveError::HashMismatch {
                        expected: expected.to_string(),
                        actual: actual.to_string(),
                    });
                }
                Ok(plain)
            })
            .await
    }

    /// Remove every hydration staging copy; returns how many were removed
    #[instrument(skip(self))]
    pub async fn purge_hydration_staging(&self) -> Result<usize> {
        let keys = self.store.list(store::REHYDRATED_PREFIX).await?;
        let mut removed = 0;
        for key in keys {
            if self.store.delete(&key).await? {
                removed += 1;
            }
        }
        debug!("Purged {} hydration staging copies", removed);
        Ok(removed)
    }

    /// Persist the ordered chunk list of a multi-chunk binary
    ///
    /// An existing, well-formed list is left alone. An empty object or one
    /// without the chunk-list marker is a leftover of an interrupted write and
    /// is replaced.
    pub async fn put_chunk_list(&self, binary: &BinaryHash, chunks: &[ChunkHash]) -> Result<()> {
        let key = store::chunk_list_key(binary);
        let encoded = bincode::serde::encode_to_vec(chunks, bincode::config::standard())?;
        let crypto = self.crypto.clone();
        let sealed = self.cpu.run(move || crypto.encrypt(&encoded)).await?;

        for _ in 0..2 {
            if let Some(existing) = self.store.properties(&key).await? {
                let well_formed = existing.length > 0
                    && existing.content_type.as_deref() == Some(CHUNK_LIST_CONTENT_TYPE);
                if well_formed {
                    debug!("Chunk list for {} already stored", binary.short());
                    return Ok(());
                }
                warn!("Chunk list for {} is corrupt, replacing it", binary.short());
                self.store.delete(&key).await?;
            }

            let options = PutOptions::new(AccessTier::Cool).content_type(CHUNK_LIST_CONTENT_TYPE);
            match self.store.put(&key, sealed.clone(), options).await {
                Ok(_) => {
                    debug!("Stored chunk list for {} ({} chunks)", binary.short(), chunks.len());
                    return Ok(());
                }
                Err(ArchiveError::ObjectAlreadyExists(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(ArchiveError::storage(format!(
            "chunk list for {} kept conflicting on upload",
            binary
        )))
    }

    /// Load the ordered chunk list of a multi-chunk binary
    pub async fn get_chunk_list(&self, binary: &BinaryHash) -> Result<Vec<ChunkHash>> {
        let key = store::chunk_list_key(binary);
        let sealed = self
            .store
            .get(&key)
            .await?
            .ok_or_else(|| ArchiveError::InvalidChunkList(binary.to_string()))?;

        let crypto = self.crypto.clone();
        let plain = self
            .cpu
            .run(move || crypto.decrypt(&sealed))
            .await
            .map_err(|e| ArchiveError::InvalidChunkList(format!("{}: {}", binary, e)))?;
        let (chunks, _): (Vec<ChunkHash>, usize) =
            bincode::serde::decode_from_slice(&plain, bincode::config::standard())?;

        if chunks.is_empty() {
            return Err(ArchiveError::InvalidChunkList(binary.to_string()));
        }
        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KdfParams;
    use crate::store::MemoryObjectStore;

    fn repository(store: Arc<MemoryObjectStore>) -> ChunkRepository {
        ChunkRepository::new(
            store,
            CryptoTransform::with_params("pw", KdfParams::insecure_fast()).unwrap(),
            Hasher::new("pw"),
            CpuPool::new(2).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_upload_is_idempotent() {
        let store = Arc::new(MemoryObjectStore::new());
        let chunks = repository(store.clone());
        let data = b"chunk content".repeat(100);
        let hash = Hasher::new("pw").hash_chunk(&data);

        let first = chunks.upload(hash, data.clone(), AccessTier::Cool).await.unwrap();
        let second = chunks.upload(hash, data.clone(), AccessTier::Cool).await.unwrap();
        assert!(first.incremental_length > 0);
        assert_eq!(second.incremental_length, 0);
        assert_eq!(second.archived_length, first.archived_length);
        assert_eq!(store.object_count(store::CHUNKS_PREFIX), 1);

        // A fresh process sees the remote object and writes nothing
        let fresh = repository(store.clone());
        let third = fresh.upload(hash, data, AccessTier::Cool).await.unwrap();
        assert_eq!(third.incremental_length, 0);
        assert_eq!(store.put_count(), 1);
    }

    #[tokio::test]
    async fn test_upload_replaces_empty_remote_chunk() {
        let store = Arc::new(MemoryObjectStore::new());
        let chunks = repository(store.clone());
        let data = b"interrupted upload".repeat(50);
        let hash = Hasher::new("pw").hash_chunk(&data);
        let key = store::chunk_key(&hash);

        // Zero-length leftover of an interrupted write
        store.put(&key, Vec::new(), PutOptions::default()).await.unwrap();

        let upload = chunks.upload(hash, data.clone(), AccessTier::Cool).await.unwrap();
        assert!(upload.incremental_length > 0);
        assert_eq!(upload.incremental_length, upload.archived_length);
        assert_eq!(store.put_count(), 2);

        let stored = chunks.get(&hash, false).await.unwrap().unwrap();
        assert_eq!(stored.properties.length, upload.archived_length);
        assert_eq!(chunks.download(&stored).await.unwrap(), data);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_uploads_write_once() {
        let store = Arc::new(MemoryObjectStore::new());
        let chunks = Arc::new(repository(store.clone()));
        let data = vec![7u8; 50_000];
        let hash = Hasher::new("pw").hash_chunk(&data);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let chunks = chunks.clone();
            let data = data.clone();
            handles.push(tokio::spawn(async move {
                chunks.upload(hash, data, AccessTier::Cool).await.unwrap()
            }));
        }
        let mut incremental = 0;
        for handle in handles {
            incremental += handle.await.unwrap().incremental_length;
        }

        assert_eq!(store.put_count(), 1);
        let stored = store.properties(&store::chunk_key(&hash)).await.unwrap().unwrap();
        assert_eq!(incremental, stored.length);
    }

    #[tokio::test]
    async fn test_hydration_lifecycle() {
        let store = Arc::new(MemoryObjectStore::new());
        let chunks = repository(store.clone());
        let data = b"cold data".to_vec();
        let hash = Hasher::new("pw").hash_chunk(&data);
        chunks.upload(hash, data.clone(), AccessTier::Archive).await.unwrap();

        assert!(chunks.get(&hash, true).await.unwrap().is_none());
        assert!(chunks.get(&hash, false).await.unwrap().is_some());
        assert_eq!(chunks.hydration_status(&hash).await.unwrap(), HydrationStatus::NotStarted);

        assert!(chunks.hydrate(&hash).await.unwrap());
        assert!(!chunks.hydrate(&hash).await.unwrap());
        assert_eq!(store.copy_count(), 1);
        assert_eq!(chunks.hydration_status(&hash).await.unwrap(), HydrationStatus::Pending);

        store.complete_rehydrations();
        let staged = chunks.get(&hash, true).await.unwrap().unwrap();
        assert!(staged.staged);
        assert_eq!(chunks.download(&staged).await.unwrap(), data);

        let err = chunks.hydrate(&hash).await.unwrap_err();
        assert!(err.is_fatal());

        assert_eq!(chunks.purge_hydration_staging().await.unwrap(), 1);
        assert!(chunks.get(&hash, true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_chunk_list_repairs_corrupt_object() {
        let store = Arc::new(MemoryObjectStore::new());
        let chunks = repository(store.clone());
        let binary = BinaryHash(crate::types::Hash::from_bytes([1; 32]));
        let list: Vec<ChunkHash> = (2..5u8)
            .map(|b| ChunkHash(crate::types::Hash::from_bytes([b; 32])))
            .collect();

        // Leftover of an interrupted write
        store
            .put(&store::chunk_list_key(&binary), Vec::new(), PutOptions::default())
            .await
            .unwrap();

        chunks.put_chunk_list(&binary, &list).await.unwrap();
        assert_eq!(chunks.get_chunk_list(&binary).await.unwrap(), list);

        // Re-run keeps the existing list
        let puts = store.put_count();
        chunks.put_chunk_list(&binary, &list).await.unwrap();
        assert_eq!(store.put_count(), puts);
    }
}
