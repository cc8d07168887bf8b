//! Utility functions for Arius
//!
//! This module provides helpers shared by the pipelines:
//!
//! - **Time**: millisecond truncation and conversion for version timestamps
//! - **Paths**: forward-slash relative names independent of the host OS
//! - **File metadata**: creation/last-write times as UTC timestamps
//! - **CPU pool**: a bounded rayon pool that async code can await on
//! - **Formatting**: human readable byte sizes
//!
//! ## Example
//!
//! ```rust,ignore
//! use crate::utils::{relative_name, format_bytes};
//! use std::path::Path;
//!
//! let name = relative_name(Path::new("/data/photos/a.jpg"), Path::new("/data"))?;
//! assert_eq!(name, "photos/a.jpg");
//! assert_eq!(format_bytes(1536), "1.50 KB");
//! ```

use crate::error::{ArchiveError, Result};
use chrono::{DateTime, TimeZone, Utc};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::oneshot;

/// Truncate a timestamp to millisecond precision
///
/// Versions and file timestamps are persisted as integer milliseconds, so
/// every in-memory value is truncated the same way before comparison.
pub fn truncate_to_millis(dt: DateTime<Utc>) -> DateTime<Utc> {
    from_millis(to_millis(dt))
}

/// Milliseconds since the Unix epoch
pub fn to_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

/// Timestamp from milliseconds since the Unix epoch
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_default()
}

/// Current time, truncated to milliseconds
pub fn now_millis() -> DateTime<Utc> {
    truncate_to_millis(Utc::now())
}

/// Convert a system time into a UTC timestamp with millisecond precision
pub fn system_time_to_utc(time: SystemTime) -> DateTime<Utc> {
    truncate_to_millis(DateTime::<Utc>::from(time))
}

/// Creation and last-write time of a file
///
/// Creation time is `None` on filesystems that do not record it.
pub fn file_times(metadata: &fs::Metadata) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
    let created = metadata.created().ok().map(system_time_to_utc);
    let modified = metadata.modified().ok().map(system_time_to_utc);
    (created, modified)
}

/// Make `path` relative to `base` and render it with forward slashes
///
/// # Errors
///
/// - [`ArchiveError::Internal`] if `path` is not under `base` or is not valid UTF-8
pub fn relative_name(path: &Path, base: &Path) -> Result<String> {
    let relative = path.strip_prefix(base).map_err(|_| {
        ArchiveError::internal(format!("{:?} is not under {:?}", path, base))
    })?;

    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                let part = part.to_str().ok_or_else(|| {
                    ArchiveError::internal(format!("path {:?} is not valid UTF-8", path))
                })?;
                parts.push(part);
            }
            Component::CurDir => {}
            other => {
                return Err(ArchiveError::internal(format!(
                    "unexpected path component {:?} in {:?}",
                    other, path
                )))
            }
        }
    }
    Ok(parts.join("/"))
}

/// Resolve a forward-slash relative name under `root`
pub fn resolve_relative(root: &Path, relative_name: &str) -> PathBuf {
    relative_name
        .split('/')
        .filter(|part| !part.is_empty())
        .fold(root.to_path_buf(), |path, part| path.join(part))
}

/// Bounded pool for CPU-bound work (hashing, encryption)
///
/// Async tasks hand closures to the pool and await the result without
/// blocking a runtime worker thread.
#[derive(Clone)]
pub struct CpuPool {
    pool: Arc<ThreadPool>,
}

impl std::fmt::Debug for CpuPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuPool")
            .field("threads", &self.pool.current_num_threads())
            .finish()
    }
}

impl CpuPool {
    /// Create a pool with `threads` workers
    pub fn new(threads: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("arius-cpu-{}", i))
            .build()
            .map_err(|e| ArchiveError::internal(format!("failed to build CPU pool: {}", e)))?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Run `f` on the pool and await its result
    pub async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.pool.spawn(move || {
            // Receiver may be gone if the caller was cancelled
            let _ = tx.send(f());
        });
        rx.await
            .map_err(|_| ArchiveError::TaskFailed("CPU pool task dropped its result".to_string()))?
    }
}

/// Format bytes as human-readable string
///
/// Uses binary units (1024-based). Values below 1 KB are whole numbers,
/// larger values have two decimals.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// File name prefix of in-progress writes under an archive root
///
/// Scans skip names with this prefix, so a write interrupted by a crash is
/// never archived as a binary.
pub const TEMP_PREFIX: &str = ".arius-tmp-";

/// Whether `path` names an in-progress write
pub fn is_temp_path(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with(TEMP_PREFIX))
}

/// Create a named temporary file in `dir` carrying [`TEMP_PREFIX`]
pub fn temp_file_in(dir: &Path) -> Result<tempfile::NamedTempFile> {
    Ok(tempfile::Builder::new().prefix(TEMP_PREFIX).tempfile_in(dir)?)
}

/// Atomic file write (write to temp file then rename)
///
/// The target is either the complete new content or untouched; a partially
/// written file is never visible under `path`.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let mut file = temp_file_in(parent)?;
    file.write_all(content)?;
    file.persist(path).map_err(|e| ArchiveError::Io(e.error))?;
    Ok(())
}

/// Remove empty parent directories of `path` up to (not including) `stop`
pub fn prune_empty_parents(path: &Path, stop: &Path) {
    let mut current = path.parent();
    while let Some(dir) = current {
        if dir == stop || !dir.starts_with(stop) {
            break;
        }
        // remove_dir fails on non-empty directories, which ends the walk
        if fs::remove_dir(dir).is_err() {
            break;
        }
        current = dir.parent();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1_048_576), "1.00 MB");
        assert_eq!(format_bytes(1_073_741_824), "1.00 GB");
    }

    #[test]
    fn test_atomic_write() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("nested").join("test.bin");

        atomic_write(&file_path, b"Test content").unwrap();

        assert_eq!(fs::read(&file_path).unwrap(), b"Test content");
        atomic_write(&file_path, b"Replaced").unwrap();
        assert_eq!(fs::read(&file_path).unwrap(), b"Replaced");

        let leftovers: Vec<_> = fs::read_dir(temp_dir.path().join("nested"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("test.bin")]);
    }

    #[test]
    fn test_temp_files_are_marked() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_file_in(temp_dir.path()).unwrap();
        assert!(is_temp_path(file.path()));
        assert!(!is_temp_path(Path::new("/data/a.bin.pointer.arius")));
        assert!(!is_temp_path(Path::new("/data/notes.tmp")));
    }

    #[test]
    fn test_relative_name_uses_forward_slashes() {
        let base = Path::new("/data");
        let file = base.join("photos").join("2024").join("a.jpg");
        assert_eq!(relative_name(&file, base).unwrap(), "photos/2024/a.jpg");
        assert!(relative_name(Path::new("/elsewhere/a"), base).is_err());

        let resolved = resolve_relative(base, "photos/2024/a.jpg");
        assert_eq!(resolved, file);
    }

    #[test]
    fn test_millis_truncation() {
        let dt = Utc.timestamp_nanos(1_700_000_000_123_456_789);
        let truncated = truncate_to_millis(dt);
        assert_eq!(to_millis(truncated), 1_700_000_000_123);
        assert_eq!(truncate_to_millis(truncated), truncated);
    }

    #[test]
    fn test_prune_empty_parents() {
        let temp_dir = TempDir::new().unwrap();
        let deep = temp_dir.path().join("a").join("b");
        fs::create_dir_all(&deep).unwrap();
        fs::write(temp_dir.path().join("a").join("keep.txt"), b"x").unwrap();

        prune_empty_parents(&deep.join("gone.txt"), temp_dir.path());
        assert!(!deep.exists());
        assert!(temp_dir.path().join("a").exists());
    }

    #[tokio::test]
    async fn test_cpu_pool_runs_closures() {
        let pool = CpuPool::new(2).unwrap();
        let value = pool.run(|| Ok(21 * 2)).await.unwrap();
        assert_eq!(value, 42);

        let err = pool
            .run::<(), _>(|| Err(ArchiveError::internal("boom")))
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Internal(_)));
    }
}
