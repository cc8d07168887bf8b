//! Local filesystem surface: binaries, pointer files and directory scans
//!
//! A *binary* is an ordinary file. Its *pointer file* sits next to it with the
//! extension `.pointer.arius` and contains the hex [`BinaryHash`]. Both share
//! one relative name, the binary's path relative to the archive root:
//!
//! | On disk                       | Meaning                                |
//! |-------------------------------|----------------------------------------|
//! | binary only                   | not archived yet                       |
//! | binary + pointer              | archived (or pointer stale, rehashed)  |
//! | pointer only                  | archived, binary removed locally       |
//!
//! Pointer files carry the binary's last-write time as their own modification
//! time, which is what the fast-hash mode compares against.

use crate::error::{ArchiveError, Result};
use crate::types::{BinaryHash, ItemFailure};
use crate::utils;
use chrono::{DateTime, Utc};
use filetime::FileTime;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

/// Suffix appended to a binary's file name to form its pointer file name
pub const POINTER_EXTENSION: &str = ".pointer.arius";

/// Whether `path` names a pointer file
pub fn is_pointer_path(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with(POINTER_EXTENSION) && name.len() > POINTER_EXTENSION.len())
}

/// Pointer file path for a binary
pub fn pointer_path_for(binary: &Path) -> PathBuf {
    let mut name = binary.file_name().unwrap_or_default().to_os_string();
    name.push(POINTER_EXTENSION);
    binary.with_file_name(name)
}

/// Binary path for a pointer file
pub fn binary_path_for(pointer: &Path) -> Option<PathBuf> {
    let name = pointer.file_name()?.to_str()?;
    let stem = name.strip_suffix(POINTER_EXTENSION)?;
    if stem.is_empty() {
        return None;
    }
    Some(pointer.with_file_name(stem))
}

/// Read the hash stored in a pointer file
///
/// # Errors
///
/// - [`ArchiveError::InvalidPointer`] if the content is not a hex hash
pub fn read_pointer(path: &Path) -> Result<BinaryHash> {
    let content = fs::read_to_string(path).map_err(|e| ArchiveError::InvalidPointer {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    content.trim().parse().map_err(|e: ArchiveError| ArchiveError::InvalidPointer {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Create or correct a pointer file
///
/// The content is only rewritten if it differs; the modification time is
/// set to `last_write` either way. Returns whether the content was written.
pub fn write_pointer(path: &Path, hash: &BinaryHash, last_write: Option<DateTime<Utc>>) -> Result<bool> {
    let current = read_pointer(path).ok();
    let written = if current.as_ref() != Some(hash) {
        utils::atomic_write(path, hash.to_string().as_bytes())?;
        trace!("Wrote pointer {:?}", path);
        true
    } else {
        false
    };

    if let Some(last_write) = last_write {
        set_modified(path, last_write)?;
    }
    Ok(written)
}

/// Set a file's modification time
pub fn set_modified(path: &Path, time: DateTime<Utc>) -> Result<()> {
    let mtime = FileTime::from_unix_time(time.timestamp(), time.timestamp_subsec_nanos());
    filetime::set_file_mtime(path, mtime)?;
    Ok(())
}

/// Timestamps of a file as recorded in pointer-file entries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileTimes {
    /// Creation time, when the filesystem records one
    pub created: Option<DateTime<Utc>>,
    /// Last write time
    pub modified: Option<DateTime<Utc>>,
    /// Length in bytes
    pub length: u64,
}

/// Read the timestamps and length of a file
pub fn file_times(path: &Path) -> Result<FileTimes> {
    let metadata = fs::metadata(path)?;
    let (created, modified) = utils::file_times(&metadata);
    Ok(FileTimes {
        created,
        modified,
        length: metadata.len(),
    })
}

/// A relative name with whatever exists for it on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePair {
    /// Forward-slash name of the binary relative to the root
    pub relative_name: String,
    /// Path of the binary, if present
    pub binary: Option<PathBuf>,
    /// Path of the pointer file, if present
    pub pointer: Option<PathBuf>,
}

impl FilePair {
    /// Pointer file path, whether or not it exists yet
    pub fn pointer_path(&self, root: &Path) -> PathBuf {
        self.pointer
            .clone()
            .unwrap_or_else(|| pointer_path_for(&utils::resolve_relative(root, &self.relative_name)))
    }
}

/// Compile exclude patterns
///
/// # Errors
///
/// - [`ArchiveError::InvalidPattern`] for a malformed glob
pub fn build_excludes(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// Result of walking an archive root
#[derive(Debug, Default)]
pub struct Scan {
    /// Paired names, sorted by relative name
    pub pairs: Vec<FilePair>,
    /// Entries that could not be read or named
    pub failures: Vec<ItemFailure>,
}

/// Walk `root` and pair every binary with its pointer file
///
/// Results are sorted by relative name. Symlinks are not followed, excluded
/// names and in-progress writes are skipped. Unreadable entries and names
/// that are not valid UTF-8 are reported in [`Scan::failures`].
///
/// # Errors
///
/// - I/O error if `root` itself cannot be read
pub fn scan(root: &Path, excludes: &GlobSet) -> Result<Scan> {
    let mut pairs: BTreeMap<String, FilePair> = BTreeMap::new();
    let mut failures = Vec::new();
    let mut excluded = 0usize;

    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() == 0 => return Err(e.into()),
            Err(e) => {
                let name = e.path().map(|p| lossy_relative_name(p, root)).unwrap_or_default();
                warn!("Cannot read '{}': {}", name, e);
                failures.push(ItemFailure {
                    relative_name: name,
                    message: e.to_string(),
                });
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if utils::is_temp_path(path) {
            trace!("Skipping in-progress write {:?}", path);
            continue;
        }

        let is_pointer = is_pointer_path(path);
        let binary_path = if is_pointer {
            binary_path_for(path).ok_or_else(|| ArchiveError::InvalidPointer {
                path: path.to_path_buf(),
                reason: "pointer file name has no binary name".to_string(),
            })
        } else {
            Ok(path.to_path_buf())
        };
        let relative_name = match binary_path.and_then(|binary| utils::relative_name(&binary, root)) {
            Ok(name) => name,
            Err(e) => {
                let name = lossy_relative_name(path, root);
                warn!("Skipping '{}': {}", name, e);
                failures.push(ItemFailure {
                    relative_name: name,
                    message: e.to_string(),
                });
                continue;
            }
        };

        if excludes.is_match(&relative_name) {
            excluded += 1;
            continue;
        }

        let pair = pairs.entry(relative_name.clone()).or_insert_with(|| FilePair {
            relative_name,
            binary: None,
            pointer: None,
        });
        if is_pointer {
            pair.pointer = Some(path.to_path_buf());
        } else {
            pair.binary = Some(path.to_path_buf());
        }
    }

    debug!(
        "Scanned {:?}: {} names, {} excluded, {} unreadable",
        root,
        pairs.len(),
        excluded,
        failures.len()
    );
    Ok(Scan {
        pairs: pairs.into_values().collect(),
        failures,
    })
}

/// Forward-slash name for reporting, with invalid UTF-8 replaced
fn lossy_relative_name(path: &Path, root: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn test_pointer_paths() {
        let binary = Path::new("/data/photos/a.jpg");
        let pointer = pointer_path_for(binary);
        assert_eq!(pointer, Path::new("/data/photos/a.jpg.pointer.arius"));
        assert!(is_pointer_path(&pointer));
        assert!(!is_pointer_path(binary));
        assert!(!is_pointer_path(Path::new(".pointer.arius")));
        assert_eq!(binary_path_for(&pointer).unwrap(), binary);
    }

    #[test]
    fn test_pointer_write_and_read() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a.txt.pointer.arius");
        let hash: BinaryHash = "ab".repeat(32).parse().unwrap();
        let when = Utc.with_ymd_and_hms(2023, 5, 1, 8, 30, 0).unwrap();

        assert!(write_pointer(&path, &hash, Some(when)).unwrap());
        assert!(!write_pointer(&path, &hash, Some(when)).unwrap());
        assert_eq!(read_pointer(&path).unwrap(), hash);
        assert_eq!(file_times(&path).unwrap().modified, Some(when));

        fs::write(&path, "not a hash").unwrap();
        let err = read_pointer(&path).unwrap_err();
        assert!(matches!(err, ArchiveError::InvalidPointer { .. }));
        assert!(err.is_validation());
    }

    #[test]
    fn test_scan_pairs_and_excludes() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("both.bin"), b"x").unwrap();
        fs::write(root.join("both.bin.pointer.arius"), b"x").unwrap();
        fs::write(root.join("sub").join("only-pointer.bin.pointer.arius"), b"x").unwrap();
        fs::write(root.join("sub").join("only-binary.bin"), b"x").unwrap();
        fs::write(root.join(".DS_Store"), b"x").unwrap();
        fs::write(root.join("sub").join("Thumbs.db"), b"x").unwrap();

        let excludes = build_excludes(&["**/.DS_Store".to_string(), "**/Thumbs.db".to_string()]).unwrap();
        let pairs = scan(root, &excludes).unwrap().pairs;
        let names: Vec<_> = pairs.iter().map(|p| p.relative_name.as_str()).collect();
        assert_eq!(names, vec!["both.bin", "sub/only-binary.bin", "sub/only-pointer.bin"]);

        assert!(pairs[0].binary.is_some() && pairs[0].pointer.is_some());
        assert!(pairs[1].pointer.is_none());
        assert!(pairs[2].binary.is_none());
        assert_eq!(
            pairs[1].pointer_path(root),
            root.join("sub").join("only-binary.bin.pointer.arius")
        );
    }

    #[test]
    fn test_invalid_exclude_pattern() {
        let err = build_excludes(&["a[".to_string()]).unwrap_err();
        assert!(matches!(err, ArchiveError::InvalidPattern(_)));
    }

    #[test]
    fn test_scan_skips_in_progress_writes() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::write(root.join("a.bin"), b"x").unwrap();
        let leftover = utils::temp_file_in(root).unwrap().into_temp_path().keep().unwrap();
        assert!(leftover.exists());

        let scan = scan(root, &GlobSet::empty()).unwrap();
        let names: Vec<_> = scan.pairs.iter().map(|p| p.relative_name.as_str()).collect();
        assert_eq!(names, vec!["a.bin"]);
        assert!(scan.failures.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_scan_reports_non_utf8_names() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::write(root.join("good.bin"), b"x").unwrap();
        fs::write(root.join(OsStr::from_bytes(b"bad\xFF.bin")), b"x").unwrap();

        let scan = scan(root, &GlobSet::empty()).unwrap();
        assert_eq!(scan.pairs.len(), 1);
        assert_eq!(scan.pairs[0].relative_name, "good.bin");
        assert_eq!(scan.failures.len(), 1);
        assert!(scan.failures[0].relative_name.starts_with("bad"));
    }

    #[test]
    fn test_scan_missing_root_fails() {
        let temp_dir = TempDir::new().unwrap();
        assert!(scan(&temp_dir.path().join("missing"), &GlobSet::empty()).is_err());
    }
}
