//! Archive pipeline
//!
//! One run walks the root, then for every relative name:
//!
//! 1. **Pointer only**: validate that the referenced binary is known and
//!    record the path at this version.
//! 2. **Binary present**: hash it (or trust an unchanged pointer in fast-hash
//!    mode), upload it if the repository does not have it, write or correct
//!    the pointer file, record the path, optionally remove the binary.
//!
//! Names are processed concurrently, bounded by `binary_parallelism`. After
//! that, every path that is live in the state but was not seen on disk gets
//! a tombstone, and the state snapshot is published if anything changed.
//!
//! A failure on one name is recorded in the [`ArchiveSummary`] and does not
//! stop the run. Invariant violations and state database errors do.

use crate::error::{ArchiveError, Result};
use crate::filesystem::{self, FilePair, FileTimes};
use crate::repository::{BinaryUpload, Repository};
use crate::types::{
    ArchiveOptions, ArchiveSummary, BinaryHash, ItemFailure, PointerFileEntry, UpsertResult,
};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, trace, warn};

/// What happened to one relative name
#[derive(Debug, Default)]
struct PairOutcome {
    upload: Option<BinaryUpload>,
    pointer_written: bool,
    upsert: Option<UpsertResult>,
    binary_removed: bool,
}

impl ArchiveSummary {
    fn absorb(&mut self, outcome: PairOutcome) {
        if let Some(upload) = outcome.upload.filter(|u| u.uploaded) {
            self.binaries_uploaded += 1;
            self.chunks_uploaded += upload.chunks_uploaded;
            self.bytes_original += upload.properties.original_length;
            self.bytes_incremental += upload.properties.incremental_length;
        }
        self.pointers_written += outcome.pointer_written as usize;
        if outcome.upsert == Some(UpsertResult::Upserted) {
            self.entries_upserted += 1;
        }
        self.binaries_removed += outcome.binary_removed as usize;
    }
}

impl Repository {
    /// Archive a directory tree
    ///
    /// # Errors
    ///
    /// - [`ArchiveError::InvalidConfiguration`] if the root is not a directory
    /// - [`ArchiveError::InvalidPattern`] for a malformed exclude pattern
    /// - Fatal errors from the state database or store; the state is not
    ///   published in that case
    #[instrument(skip(self, options), fields(root = ?options.root))]
    pub async fn archive(&self, options: ArchiveOptions) -> Result<ArchiveSummary> {
        if !options.root.is_dir() {
            return Err(ArchiveError::InvalidConfiguration(format!(
                "archive root {:?} is not a directory",
                options.root
            )));
        }
        let excludes = filesystem::build_excludes(&options.exclude_patterns)?;
        let version = self.state().next_version()?;
        info!("Archiving {:?} as version {}", options.root, version);

        let root = options.root.clone();
        let scan = tokio::task::spawn_blocking(move || filesystem::scan(&root, &excludes)).await??;
        let pairs = scan.pairs;
        let seen: HashSet<String> = pairs.iter().map(|p| p.relative_name.clone()).collect();
        // Paths under an unreadable entry are unknown, not deleted
        let unreadable: Vec<String> = scan.failures.iter().map(|f| f.relative_name.clone()).collect();

        let mut summary = ArchiveSummary {
            version: Some(version),
            files_scanned: pairs.len(),
            failures: scan.failures,
            ..ArchiveSummary::default()
        };

        let options = Arc::new(options);
        let permits = Arc::new(Semaphore::new(self.config().binary_parallelism));
        let mut tasks = JoinSet::new();
        for pair in pairs {
            let permit = permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| ArchiveError::internal(e.to_string()))?;
            let repository = self.clone();
            let options = options.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let name = pair.relative_name.clone();
                (name, repository.archive_pair(pair, &options, version).await)
            });

            // Surface finished items (and fatal errors) while scheduling
            while let Some(joined) = tasks.try_join_next() {
                Self::collect(joined?, &mut summary, &mut tasks)?;
            }
        }
        while let Some(joined) = tasks.join_next().await {
            Self::collect(joined?, &mut summary, &mut tasks)?;
        }

        summary.entries_deleted = self.tombstone_missing(&seen, &unreadable, version)?;
        summary.state_committed = self.state().commit(version).await?;

        info!(
            "Archive finished: {} scanned, {} binaries uploaded, {} entries, {} tombstones, {} failures",
            summary.files_scanned,
            summary.binaries_uploaded,
            summary.entries_upserted,
            summary.entries_deleted,
            summary.failures.len()
        );
        Ok(summary)
    }

    fn collect(
        (name, result): (String, Result<PairOutcome>),
        summary: &mut ArchiveSummary,
        tasks: &mut JoinSet<(String, Result<PairOutcome>)>,
    ) -> Result<()> {
        match result {
            Ok(outcome) => summary.absorb(outcome),
            Err(e) if e.is_fatal() => {
                tasks.abort_all();
                return Err(e);
            }
            Err(e) => {
                warn!("Failed to archive '{}': {}", name, e);
                summary.failures.push(ItemFailure {
                    relative_name: name,
                    message: e.to_string(),
                });
            }
        }
        Ok(())
    }

    fn tombstone_missing(
        &self,
        seen: &HashSet<String>,
        unreadable: &[String],
        version: DateTime<Utc>,
    ) -> Result<usize> {
        let mut deleted = 0;
        for entry in self.db().latest_entries(false)? {
            if seen.contains(&entry.relative_name) || is_within_any(&entry.relative_name, unreadable) {
                continue;
            }
            if self.db().tombstone(&entry, version)? == UpsertResult::InsertedDeleted {
                debug!("'{}' no longer exists locally", entry.relative_name);
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn archive_pair(
        &self,
        pair: FilePair,
        options: &ArchiveOptions,
        version: DateTime<Utc>,
    ) -> Result<PairOutcome> {
        match (&pair.binary, &pair.pointer) {
            (Some(binary), pointer) => {
                self.archive_binary(&pair, binary, pointer.as_deref(), options, version)
                    .await
            }
            (None, Some(pointer)) => self.archive_pointer_only(&pair.relative_name, pointer, version).await,
            (None, None) => Err(ArchiveError::internal(format!(
                "'{}' has neither binary nor pointer",
                pair.relative_name
            ))),
        }
    }

    async fn archive_pointer_only(
        &self,
        relative_name: &str,
        pointer: &Path,
        version: DateTime<Utc>,
    ) -> Result<PairOutcome> {
        let hash = filesystem::read_pointer(pointer)?;
        if !self.db().binary_exists(&hash)? {
            return Err(ArchiveError::MissingBinary {
                path: pointer.to_path_buf(),
                hash: hash.to_string(),
            });
        }

        let times = filesystem::file_times(pointer)?;
        // Pointer files are recreated freely, so their own creation time is
        // not the binary's; keep the recorded one while the content matches
        let created = match self.db().entry_at(relative_name, version)? {
            Some(prior) if !prior.is_deleted && prior.binary_hash == Some(hash) => prior.creation_time_utc,
            _ => times.created,
        };

        let entry = PointerFileEntry::live(relative_name, hash, version, created, times.modified);
        let upsert = self.record_entry(entry).await?;
        trace!("Pointer-only '{}': {:?}", relative_name, upsert);
        Ok(PairOutcome {
            upsert: Some(upsert),
            ..PairOutcome::default()
        })
    }

    async fn archive_binary(
        &self,
        pair: &FilePair,
        binary: &Path,
        pointer: Option<&Path>,
        options: &ArchiveOptions,
        version: DateTime<Utc>,
    ) -> Result<PairOutcome> {
        let times = filesystem::file_times(binary)?;
        let hash = self.hash_binary(binary, pointer, &times, options.fast_hash).await?;

        let upload = self
            .upload_binary(binary, hash, options.tier, options.dedup)
            .await?;

        let pointer_path = pair.pointer_path(&options.root);
        let pointer_written = filesystem::write_pointer(&pointer_path, &hash, times.modified)?;

        let entry = PointerFileEntry::live(
            pair.relative_name.as_str(),
            hash,
            version,
            times.created,
            times.modified,
        );
        let upsert = self.record_entry(entry).await?;

        let binary_removed = if options.remove_local {
            fs::remove_file(binary)?;
            debug!("Removed local binary '{}'", pair.relative_name);
            true
        } else {
            false
        };

        Ok(PairOutcome {
            upload: Some(upload),
            pointer_written,
            upsert: Some(upsert),
            binary_removed,
        })
    }

    /// Upsert an entry on the blocking pool
    ///
    /// The connection lock is held for the whole statement, which must not
    /// stall the runtime's worker threads while many names are in flight.
    async fn record_entry(&self, entry: PointerFileEntry) -> Result<UpsertResult> {
        let repository = self.clone();
        tokio::task::spawn_blocking(move || repository.db().upsert_pointer_file_entry(&entry)).await?
    }

    /// Hash a binary, or trust its pointer in fast-hash mode
    ///
    /// The pointer is trusted only if its modification time equals the
    /// binary's and the recorded length matches the file.
    async fn hash_binary(
        &self,
        binary: &Path,
        pointer: Option<&Path>,
        times: &FileTimes,
        fast_hash: bool,
    ) -> Result<BinaryHash> {
        if fast_hash {
            if let Some(hash) = self.trusted_pointer(pointer, times)? {
                trace!("Fast hash for {:?}", binary);
                return Ok(hash);
            }
        }

        let hasher = self.hasher().clone();
        let path = binary.to_path_buf();
        self.cpu().run(move || hasher.hash_file(&path)).await
    }

    fn trusted_pointer(&self, pointer: Option<&Path>, times: &FileTimes) -> Result<Option<BinaryHash>> {
        let Some(pointer) = pointer else {
            return Ok(None);
        };
        let Ok(hash) = filesystem::read_pointer(pointer) else {
            return Ok(None);
        };
        if filesystem::file_times(pointer)?.modified != times.modified {
            return Ok(None);
        }
        Ok(self
            .db()
            .binary_properties(&hash)?
            .filter(|properties| properties.original_length == times.length)
            .map(|_| hash))
    }
}

/// Whether `name` equals one of `prefixes` or lies below it
fn is_within_any(name: &str, prefixes: &[String]) -> bool {
    prefixes.iter().any(|prefix| {
        prefix.is_empty()
            || name == prefix
            || name.strip_prefix(prefix.as_str()).is_some_and(|rest| rest.starts_with('/'))
    })
}
