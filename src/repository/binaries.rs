//! Binary upload and download orchestration
//!
//! Uploading a binary runs three stages:
//!
//! ```text
//! file ──> chunk emission (one blocking thread, in order)
//!            │  bounded queue (backpressure)
//!            ▼
//!          upload workers (N tasks) ──> ChunkRepository::upload
//! ```
//!
//! The emitter hashes each chunk and the whole binary as the bytes stream
//! past, so the chunk list comes out in file order no matter how uploads
//! interleave. Downloads are the reverse: every chunk must be readable before
//! the first byte is written, then chunks are appended strictly in list order.

use super::Repository;
use crate::chunker::{self, Chunker};
use crate::error::{ArchiveError, Result};
use crate::types::{
    AccessTier, BinaryHash, BinaryProperties, ChunkHash, ChunkUpload, DownloadOutcome, HydrationStatus,
};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument};

/// Result of archiving one binary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryUpload {
    /// Properties recorded for the binary
    pub properties: BinaryProperties,
    /// Whether this call created the binary
    pub uploaded: bool,
    /// Chunks newly written by this call
    pub chunks_uploaded: usize,
}

#[derive(Debug, Default)]
struct ChunkTally {
    archived: u64,
    incremental: u64,
    uploaded: usize,
}

impl ChunkTally {
    fn add(&mut self, upload: ChunkUpload) {
        self.archived += upload.archived_length;
        self.incremental += upload.incremental_length;
        if upload.incremental_length > 0 {
            self.uploaded += 1;
        }
    }

    fn merge(&mut self, other: ChunkTally) {
        self.archived += other.archived;
        self.incremental += other.incremental;
        self.uploaded += other.uploaded;
    }
}

impl Repository {
    /// Archive the content of `path`, known to hash to `hash`
    ///
    /// Binaries already recorded in the state are not touched. Concurrent
    /// calls for the same hash share one upload; only the leader reports
    /// `uploaded`.
    ///
    /// # Errors
    ///
    /// - [`ArchiveError::HashMismatch`] if the file changed after it was hashed
    /// - Store and state errors
    #[instrument(skip(self, path, hash), fields(binary = %hash.short()))]
    pub async fn upload_binary(
        &self,
        path: &Path,
        hash: BinaryHash,
        tier: AccessTier,
        dedup: bool,
    ) -> Result<BinaryUpload> {
        let path = path.to_path_buf();
        let flight = self
            .inner
            .binaries
            .run(&hash, || self.upload_binary_uncached(path, hash, tier, dedup))
            .await?;

        Ok(if flight.led {
            flight.value
        } else {
            BinaryUpload {
                uploaded: false,
                chunks_uploaded: 0,
                ..flight.value
            }
        })
    }

    async fn upload_binary_uncached(
        &self,
        path: PathBuf,
        hash: BinaryHash,
        tier: AccessTier,
        dedup: bool,
    ) -> Result<BinaryUpload> {
        if let Some(properties) = self.db().binary_properties(&hash)? {
            debug!("Binary already archived");
            return Ok(BinaryUpload {
                properties,
                uploaded: false,
                chunks_uploaded: 0,
            });
        }

        let config = &self.inner.config;
        let chunker = Chunker::new(config.chunker, dedup);
        let hasher = self.inner.hasher.clone();
        let (tx, rx) = mpsc::channel::<(ChunkHash, Vec<u8>)>(config.chunk_queue_capacity.max(1));

        let emitter = tokio::task::spawn_blocking(move || -> Result<(Vec<ChunkHash>, BinaryHash, u64)> {
            let reader = BufReader::new(File::open(&path)?);
            let mut whole = hasher.streaming();
            let mut hashes = Vec::new();
            let mut length = 0u64;

            chunker.chunk_reader(reader, |data| {
                let chunk_hash = hasher.hash_chunk(&data);
                whole.update(&data);
                hashes.push(chunk_hash);
                length += data.len() as u64;
                tx.blocking_send((chunk_hash, data))
                    .map_err(|_| ArchiveError::Abandoned(format!("chunk stream of {:?}", path)))
            })?;
            Ok((hashes, whole.finish(), length))
        });

        let rx = Arc::new(Mutex::new(rx));
        let mut workers = JoinSet::new();
        for _ in 0..config.upload_parallelism.max(1) {
            let rx = rx.clone();
            let chunks = self.inner.chunks.clone();
            workers.spawn(async move {
                let mut tally = ChunkTally::default();
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some((chunk_hash, data)) = next else {
                        break;
                    };
                    match chunks.upload(chunk_hash, data, tier).await {
                        Ok(upload) => tally.add(upload),
                        Err(e) => {
                            // Stops the emitter at its next send
                            rx.lock().await.close();
                            return Err(e);
                        }
                    }
                }
                Ok(tally)
            });
        }
        drop(rx);

        let mut tally = ChunkTally::default();
        let mut failure = None;
        while let Some(joined) = workers.join_next().await {
            match joined? {
                Ok(worker) => tally.merge(worker),
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        let emitted = emitter.await?;
        if let Some(e) = failure {
            return Err(e);
        }
        let (hashes, actual, original_length) = emitted?;

        if actual != hash {
            return Err(ArchiveError::HashMismatch {
                expected: hash.to_string(),
                actual: actual.to_string(),
            });
        }

        if hashes.len() > 1 {
            self.inner.chunks.put_chunk_list(&hash, &hashes).await?;
        }

        let properties = BinaryProperties {
            hash,
            original_length,
            archived_length: tally.archived,
            incremental_length: tally.incremental,
            chunk_count: hashes.len() as u32,
        };
        self.db().add_binary_properties(&properties)?;

        info!(
            "Archived binary {} ({} chunks, {} new)",
            hash.short(),
            properties.chunk_count,
            tally.uploaded
        );
        Ok(BinaryUpload {
            properties,
            uploaded: true,
            chunks_uploaded: tally.uploaded,
        })
    }

    /// Chunk hashes of a binary, in order
    pub async fn chunk_hashes(&self, properties: &BinaryProperties) -> Result<Vec<ChunkHash>> {
        if properties.chunk_count == 1 {
            Ok(vec![ChunkHash::from(properties.hash)])
        } else {
            self.inner.chunks.get_chunk_list(&properties.hash).await
        }
    }

    /// Restore a binary to `target` if all of its chunks are readable
    ///
    /// When some chunks are still archived, hydration is requested for the
    /// ones without a pending request (if `request_hydration`) and
    /// [`DownloadOutcome::NotYetHydrated`] is returned. Nothing is written in
    /// that case.
    ///
    /// # Errors
    ///
    /// - [`ArchiveError::MissingBinary`] if the repository does not know `hash`
    /// - [`ArchiveError::HashMismatch`] if a chunk does not match its hash
    #[instrument(skip(self, target), fields(binary = %hash.short()))]
    pub async fn try_download(
        &self,
        hash: &BinaryHash,
        target: &Path,
        request_hydration: bool,
    ) -> Result<DownloadOutcome> {
        let properties = self
            .db()
            .binary_properties(hash)?
            .ok_or_else(|| ArchiveError::MissingBinary {
                path: target.to_path_buf(),
                hash: hash.to_string(),
            })?;
        let chunk_hashes = self.chunk_hashes(&properties).await?;

        let chunks = &self.inner.chunks;
        let mut readable = Vec::with_capacity(chunk_hashes.len());
        let mut unreadable = BTreeSet::new();
        for chunk_hash in &chunk_hashes {
            match chunks.get(chunk_hash, true).await? {
                Some(chunk) => readable.push(chunk),
                None => {
                    unreadable.insert(*chunk_hash);
                }
            }
        }

        if !unreadable.is_empty() {
            let (mut requested, mut pending) = (0, 0);
            for chunk_hash in &unreadable {
                match chunks.hydration_status(chunk_hash).await? {
                    HydrationStatus::NotStarted if request_hydration => {
                        if chunks.hydrate(chunk_hash).await? {
                            requested += 1;
                        } else {
                            pending += 1;
                        }
                    }
                    _ => pending += 1,
                }
            }
            info!(
                "Binary {} waiting for hydration ({} requested, {} pending)",
                hash.short(),
                requested,
                pending
            );
            return Ok(DownloadOutcome::NotYetHydrated { requested, pending });
        }

        let parent = target
            .parent()
            .ok_or_else(|| ArchiveError::internal(format!("{:?} has no parent directory", target)))?;
        fs::create_dir_all(parent)?;
        let mut file = crate::utils::temp_file_in(parent)?;

        let mut bytes = 0u64;
        let mut from_staging = 0;
        for chunk in &readable {
            let data = chunks.download(chunk).await?;
            bytes += chunker::merge([data.as_slice()], &mut file)?;
            from_staging += chunk.staged as usize;
        }

        if bytes != properties.original_length {
            return Err(ArchiveError::invariant(format!(
                "binary {} restored to {} bytes, expected {}",
                hash, bytes, properties.original_length
            )));
        }
        file.persist(target).map_err(|e| ArchiveError::Io(e.error))?;

        debug!("Restored {:?} ({} bytes)", target, bytes);
        Ok(DownloadOutcome::Restored {
            chunks: readable.len(),
            from_staging,
            bytes,
        })
    }
}
