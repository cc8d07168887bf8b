//! Restore pipeline
//!
//! A restore resolves a version (the newest, or the newest at or before a
//! point in time) and then, depending on [`RestoreOptions`]:
//!
//! - **synchronize**: makes the pointer files under the root match the live
//!   entries of that version, creating or correcting pointers of paths whose
//!   binary is not present and removing pointers of paths that are not live;
//! - **download**: restores the binary of every pointer that has none.
//!
//! Binaries whose chunks sit in the archive tier are not written. Hydration
//! is requested for them and they are reported as pending; running the same
//! restore again once hydration finished completes the job. Staging copies
//! are purged after a restore that left nothing pending.
//!
//! A failure on one path is recorded in the [`RestoreSummary`] and the
//! remaining paths are still restored.

use crate::error::{ArchiveError, Result};
use crate::filesystem;
use crate::repository::Repository;
use crate::types::{BinaryHash, DownloadOutcome, ItemFailure, PointerFileEntry, RestoreOptions, RestoreSummary};
use crate::utils;
use chrono::{DateTime, Utc};
use globset::GlobSet;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, trace, warn};

/// Pointers on disk that need their binary, grouped by hash
type DownloadPlan = BTreeMap<BinaryHash, Vec<(String, PathBuf)>>;

impl Repository {
    /// Restore a directory tree
    ///
    /// # Errors
    ///
    /// - [`ArchiveError::RepositoryEmpty`] if nothing was ever archived
    /// - [`ArchiveError::NoVersionAt`] if no version exists at or before the
    ///   requested point in time
    /// - Fatal store and state errors
    #[instrument(skip(self, options), fields(root = ?options.root))]
    pub async fn restore(&self, options: RestoreOptions) -> Result<RestoreSummary> {
        let version = self.resolve_restore_version(options.point_in_time)?;
        info!("Restoring {:?} at version {}", options.root, version);
        fs::create_dir_all(&options.root)?;

        let entries = self.db().entries_as_of(version, false)?;
        let mut summary = RestoreSummary {
            version: Some(version),
            ..RestoreSummary::default()
        };

        if options.synchronize {
            self.synchronize(&options.root, &entries, &mut summary)?;
        }
        if options.download {
            self.download_binaries(&options, &entries, &mut summary).await?;

            if summary.binaries_pending == 0 {
                let purged = self.chunks().purge_hydration_staging().await?;
                if purged > 0 {
                    info!("Removed {} hydration staging copies", purged);
                }
            }
        }

        info!(
            "Restore finished: {} pointers created, {} removed, {} binaries restored, {} pending",
            summary.pointers_created, summary.pointers_deleted, summary.binaries_restored, summary.binaries_pending
        );
        Ok(summary)
    }

    fn resolve_restore_version(&self, point_in_time: Option<DateTime<Utc>>) -> Result<DateTime<Utc>> {
        let versions = self.versions()?;
        let Some(latest) = versions.last().copied() else {
            return Err(ArchiveError::RepositoryEmpty);
        };
        match point_in_time {
            None => Ok(latest),
            Some(at) => self.db().resolve_version(at)?.ok_or(ArchiveError::NoVersionAt(at)),
        }
    }

    /// Make pointer files under `root` match `entries`
    fn synchronize(&self, root: &Path, entries: &[PointerFileEntry], summary: &mut RestoreSummary) -> Result<()> {
        let mut live = HashSet::with_capacity(entries.len());
        for entry in entries {
            live.insert(entry.relative_name.as_str());
            let Some(hash) = entry.binary_hash else {
                continue;
            };
            let binary = utils::resolve_relative(root, &entry.relative_name);
            // Local binaries are recorded by the next archive run
            if binary.is_file() {
                trace!("Binary of '{}' present, pointer left alone", entry.relative_name);
                continue;
            }
            let pointer = filesystem::pointer_path_for(&binary);
            match filesystem::write_pointer(&pointer, &hash, entry.last_write_time_utc) {
                Ok(true) => summary.pointers_created += 1,
                Ok(false) => {}
                Err(e) => summary.record_failure(&entry.relative_name, "write pointer for", &e),
            }
        }

        let scan = filesystem::scan(root, &GlobSet::empty())?;
        summary.failures.extend(scan.failures);
        for pair in scan.pairs {
            let Some(pointer) = pair.pointer else {
                continue;
            };
            if live.contains(pair.relative_name.as_str()) {
                continue;
            }
            if let Err(e) = fs::remove_file(&pointer) {
                summary.record_failure(&pair.relative_name, "remove pointer of", &ArchiveError::from(e));
                continue;
            }
            utils::prune_empty_parents(&pointer, root);
            debug!("Removed pointer of '{}'", pair.relative_name);
            summary.pointers_deleted += 1;
        }
        Ok(())
    }

    fn plan_downloads(&self, root: &Path, summary: &mut RestoreSummary) -> Result<DownloadPlan> {
        let mut plan = DownloadPlan::new();
        let scan = filesystem::scan(root, &GlobSet::empty())?;
        // Already reported if synchronize scanned first
        for failure in scan.failures {
            if !summary.failures.contains(&failure) {
                summary.failures.push(failure);
            }
        }
        for pair in scan.pairs {
            let (None, Some(pointer)) = (&pair.binary, &pair.pointer) else {
                continue;
            };
            match filesystem::read_pointer(pointer) {
                Ok(hash) => plan
                    .entry(hash)
                    .or_default()
                    .push((pair.relative_name.clone(), pointer.clone())),
                Err(e) => summary.record_failure(&pair.relative_name, "read pointer of", &e),
            }
        }
        Ok(plan)
    }

    /// Restore binaries for pointers without one
    ///
    /// Each distinct binary is downloaded once; further paths with the same
    /// content are local copies. Binaries are processed one at a time so
    /// that chunks shared between them are hydrated once.
    async fn download_binaries(
        &self,
        options: &RestoreOptions,
        entries: &[PointerFileEntry],
        summary: &mut RestoreSummary,
    ) -> Result<()> {
        let root = &options.root;
        let last_writes: HashMap<&str, Option<DateTime<Utc>>> = entries
            .iter()
            .map(|e| (e.relative_name.as_str(), e.last_write_time_utc))
            .collect();
        let plan = self.plan_downloads(root, summary)?;

        for (hash, targets) in plan {
            let Some(((first_name, first_pointer), copies)) = targets.split_first() else {
                continue;
            };
            let first_target = utils::resolve_relative(root, first_name);

            let outcome = match self.try_download(&hash, &first_target, true).await {
                Ok(outcome) => outcome,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    for (name, _) in &targets {
                        summary.record_failure(name, "restore", &e);
                    }
                    continue;
                }
            };

            match outcome {
                DownloadOutcome::NotYetHydrated { requested, .. } => {
                    summary.hydrations_requested += requested;
                    summary.binaries_pending += targets.len();
                }
                DownloadOutcome::Restored { bytes, .. } => {
                    // Copies read the downloaded file, so they go ahead even
                    // if finishing the first path failed
                    let finished =
                        self.finish_restored(options, first_name, first_pointer, &first_target, &last_writes);
                    summary.record_restored(first_name, bytes, finished);

                    for (name, pointer) in copies {
                        let target = utils::resolve_relative(root, name);
                        let finished = fs::copy(&first_target, &target)
                            .map_err(ArchiveError::from)
                            .and_then(|_| self.finish_restored(options, name, pointer, &target, &last_writes));
                        summary.record_restored(name, bytes, finished);
                    }
                }
            }
        }
        Ok(())
    }

    fn finish_restored(
        &self,
        options: &RestoreOptions,
        relative_name: &str,
        pointer: &Path,
        target: &Path,
        last_writes: &HashMap<&str, Option<DateTime<Utc>>>,
    ) -> Result<()> {
        let last_write = match last_writes.get(relative_name).copied().flatten() {
            Some(last_write) => Some(last_write),
            None => filesystem::file_times(pointer)?.modified,
        };
        if let Some(last_write) = last_write {
            filesystem::set_modified(target, last_write)?;
        }
        if !options.keep_pointers {
            fs::remove_file(pointer)?;
        }
        debug!("Restored '{}'", relative_name);
        Ok(())
    }
}

impl RestoreSummary {
    fn record_failure(&mut self, relative_name: &str, action: &str, error: &ArchiveError) {
        warn!("Failed to {} '{}': {}", action, relative_name, error);
        self.failures.push(ItemFailure {
            relative_name: relative_name.to_string(),
            message: error.to_string(),
        });
    }

    fn record_restored(&mut self, relative_name: &str, bytes: u64, finished: Result<()>) {
        match finished {
            Ok(()) => {
                self.binaries_restored += 1;
                self.bytes_restored += bytes;
            }
            Err(e) => self.record_failure(relative_name, "restore", &e),
        }
    }
}
