//! SQLite working copy of the repository state
//!
//! Holds every [`BinaryProperties`] row and the append-only pointer-file-entry
//! log. Timestamps are stored as integer milliseconds since the Unix epoch and
//! hashes as lowercase hex.
//!
//! The connection sits behind a mutex. Every read-compare-append sequence runs
//! with the lock held for its whole duration, so two workers upserting the
//! same path can never both see a stale "current" entry.

use crate::error::{ArchiveError, Result};
use crate::types::{BinaryHash, BinaryProperties, PointerFileEntry, UpsertResult};
use crate::utils;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, trace};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS binary_properties (
    hash                TEXT PRIMARY KEY NOT NULL,
    original_length     INTEGER NOT NULL,
    archived_length     INTEGER NOT NULL,
    incremental_length  INTEGER NOT NULL,
    chunk_count         INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS pointer_file_entries (
    relative_name       TEXT NOT NULL,
    version_utc         INTEGER NOT NULL,
    binary_hash         TEXT REFERENCES binary_properties(hash),
    is_deleted          INTEGER NOT NULL,
    creation_time_utc   INTEGER,
    last_write_time_utc INTEGER,
    PRIMARY KEY (relative_name, version_utc)
);

CREATE INDEX IF NOT EXISTS idx_pointer_file_entries_version
    ON pointer_file_entries(version_utc);
";

const ENTRY_COLUMNS: &str =
    "e.binary_hash, e.relative_name, e.version_utc, e.is_deleted, e.creation_time_utc, e.last_write_time_utc";

fn hash_column<T: std::str::FromStr<Err = ArchiveError>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|s| {
        s.parse::<T>()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<PointerFileEntry> {
    let creation: Option<i64> = row.get(4)?;
    let last_write: Option<i64> = row.get(5)?;
    Ok(PointerFileEntry {
        binary_hash: hash_column(row, 0)?,
        relative_name: row.get(1)?,
        version_utc: utils::from_millis(row.get(2)?),
        is_deleted: row.get(3)?,
        creation_time_utc: creation.map(utils::from_millis),
        last_write_time_utc: last_write.map(utils::from_millis),
    })
}

fn properties_from_row(row: &Row<'_>) -> rusqlite::Result<BinaryProperties> {
    let hash: Option<BinaryHash> = hash_column(row, 0)?;
    let hash = hash.ok_or(rusqlite::Error::InvalidColumnType(0, "hash".to_string(), Type::Null))?;
    Ok(BinaryProperties {
        hash,
        original_length: row.get::<_, i64>(1)? as u64,
        archived_length: row.get::<_, i64>(2)? as u64,
        incremental_length: row.get::<_, i64>(3)? as u64,
        chunk_count: row.get::<_, i64>(4)? as u32,
    })
}

/// Embedded relational store for binary properties and pointer-file entries
pub struct StateDb {
    conn: Mutex<Connection>,
    path: PathBuf,
    dirty: AtomicBool,
}

impl std::fmt::Debug for StateDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateDb")
            .field("path", &self.path)
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

impl StateDb {
    /// Open (creating if needed) the database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        debug!("Opened state database at {:?}", path);
        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
            dirty: AtomicBool::new(false),
        })
    }

    /// Location of the database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether anything was written since open
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub(crate) fn mark_clean(&self) {
        self.dirty.store(false, Ordering::SeqCst);
    }

    /// Record the properties of a newly archived binary
    ///
    /// Returns `false` if an identical row already exists.
    ///
    /// # Errors
    ///
    /// - [`ArchiveError::InvariantViolation`] if a different row exists for the
    ///   same hash; binary properties are immutable once written
    pub fn add_binary_properties(&self, properties: &BinaryProperties) -> Result<bool> {
        let conn = self.conn.lock();
        let existing = conn
            .query_row(
                "SELECT hash, original_length, archived_length, incremental_length, chunk_count
                 FROM binary_properties WHERE hash = ?1",
                params![properties.hash.to_string()],
                properties_from_row,
            )
            .optional()?;

        match existing {
            Some(existing) if existing == *properties => Ok(false),
            Some(existing) => Err(ArchiveError::invariant(format!(
                "binary properties for {} are immutable (stored {:?}, new {:?})",
                properties.hash, existing, properties
            ))),
            None => {
                conn.execute(
                    "INSERT INTO binary_properties
                     (hash, original_length, archived_length, incremental_length, chunk_count)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        properties.hash.to_string(),
                        properties.original_length as i64,
                        properties.archived_length as i64,
                        properties.incremental_length as i64,
                        properties.chunk_count as i64,
                    ],
                )?;
                self.mark_dirty();
                trace!("Added binary properties for {}", properties.hash.short());
                Ok(true)
            }
        }
    }

    /// Properties of a binary, if it was ever archived
    pub fn binary_properties(&self, hash: &BinaryHash) -> Result<Option<BinaryProperties>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT hash, original_length, archived_length, incremental_length, chunk_count
                 FROM binary_properties WHERE hash = ?1",
                params![hash.to_string()],
                properties_from_row,
            )
            .optional()?)
    }

    /// Whether a binary was ever archived
    pub fn binary_exists(&self, hash: &BinaryHash) -> Result<bool> {
        Ok(self.binary_properties(hash)?.is_some())
    }

    /// Number of distinct binaries
    pub fn binary_count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM binary_properties", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Number of pointer-file entries, tombstones included
    pub fn entry_count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM pointer_file_entries", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn authoritative(conn: &Connection, relative_name: &str, at_ms: i64) -> Result<Option<PointerFileEntry>> {
        let sql = format!(
            "SELECT {} FROM pointer_file_entries e
             WHERE e.relative_name = ?1 AND e.version_utc <= ?2
             ORDER BY e.version_utc DESC LIMIT 1",
            ENTRY_COLUMNS
        );
        Ok(conn
            .query_row(&sql, params![relative_name, at_ms], entry_from_row)
            .optional()?)
    }

    /// Entry that is authoritative for `relative_name` at `at`
    pub fn entry_at(&self, relative_name: &str, at: DateTime<Utc>) -> Result<Option<PointerFileEntry>> {
        let conn = self.conn.lock();
        Self::authoritative(&conn, relative_name, utils::to_millis(at))
    }

    /// Append `entry` unless it matches the authoritative entry for its path
    ///
    /// The authoritative entry is the latest one with a version not after
    /// `entry.version_utc`. A tombstone for a path without live history is a
    /// no-op. Re-upserting within the same version replaces that version's row.
    pub fn upsert_pointer_file_entry(&self, entry: &PointerFileEntry) -> Result<UpsertResult> {
        if !entry.is_deleted && entry.binary_hash.is_none() {
            return Err(ArchiveError::invariant(format!(
                "live entry for '{}' has no binary hash",
                entry.relative_name
            )));
        }

        let conn = self.conn.lock();
        let version_ms = utils::to_millis(entry.version_utc);
        let current = Self::authoritative(&conn, &entry.relative_name, version_ms)?;

        let unchanged = match &current {
            Some(current) => current.same_state_as(entry),
            None => entry.is_deleted,
        };
        if unchanged {
            return Ok(UpsertResult::NoChange);
        }

        conn.execute(
            "INSERT OR REPLACE INTO pointer_file_entries
             (relative_name, version_utc, binary_hash, is_deleted, creation_time_utc, last_write_time_utc)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.relative_name,
                version_ms,
                entry.binary_hash.map(|h| h.to_string()),
                entry.is_deleted,
                entry.creation_time_utc.map(utils::to_millis),
                entry.last_write_time_utc.map(utils::to_millis),
            ],
        )?;
        self.mark_dirty();

        if entry.is_deleted {
            trace!("Tombstoned '{}'", entry.relative_name);
            Ok(UpsertResult::InsertedDeleted)
        } else {
            trace!("Upserted '{}'", entry.relative_name);
            Ok(UpsertResult::Upserted)
        }
    }

    /// Append a tombstone for the path of `prior` as of `version`
    pub fn tombstone(&self, prior: &PointerFileEntry, version: DateTime<Utc>) -> Result<UpsertResult> {
        self.upsert_pointer_file_entry(&PointerFileEntry::tombstone(prior, version))
    }

    /// Latest version not after `point_in_time`
    pub fn resolve_version(&self, point_in_time: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock();
        let version: Option<i64> = conn.query_row(
            "SELECT MAX(version_utc) FROM pointer_file_entries WHERE version_utc <= ?1",
            params![utils::to_millis(point_in_time)],
            |row| row.get(0),
        )?;
        Ok(version.map(utils::from_millis))
    }

    fn entries_up_to(&self, at_ms: i64, include_deleted: bool) -> Result<Vec<PointerFileEntry>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM pointer_file_entries e
             JOIN (SELECT relative_name, MAX(version_utc) AS version_utc
                   FROM pointer_file_entries
                   WHERE version_utc <= ?1
                   GROUP BY relative_name) latest
               ON e.relative_name = latest.relative_name AND e.version_utc = latest.version_utc
             WHERE ?2 OR e.is_deleted = 0
             ORDER BY e.relative_name",
            ENTRY_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let entries = stmt
            .query_map(params![at_ms, include_deleted], entry_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// Per path, the entry authoritative at `point_in_time`
    ///
    /// Empty when no version exists at or before `point_in_time`; use
    /// [`versions`](Self::versions) to tell that apart from an empty repository.
    pub fn entries_as_of(&self, point_in_time: DateTime<Utc>, include_deleted: bool) -> Result<Vec<PointerFileEntry>> {
        match self.resolve_version(point_in_time)? {
            Some(version) => self.entries_up_to(utils::to_millis(version), include_deleted),
            None => Ok(Vec::new()),
        }
    }

    /// Per path, the latest entry
    pub fn latest_entries(&self, include_deleted: bool) -> Result<Vec<PointerFileEntry>> {
        self.entries_up_to(i64::MAX, include_deleted)
    }

    /// All distinct versions, ascending
    pub fn versions(&self) -> Result<Vec<DateTime<Utc>>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT DISTINCT version_utc FROM pointer_file_entries ORDER BY version_utc")?;
        let versions = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .map(|ms| ms.map(utils::from_millis))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(versions)
    }

    /// Compact the database file
    pub fn vacuum(&self) -> Result<()> {
        self.conn.lock().execute_batch("VACUUM")?;
        Ok(())
    }

    /// Flush and close the connection
    pub fn close(self) -> Result<()> {
        self.conn
            .into_inner()
            .close()
            .map_err(|(_, e)| ArchiveError::Sqlite(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Hash;
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    fn open() -> (TempDir, StateDb) {
        let temp_dir = TempDir::new().unwrap();
        let db = StateDb::open(&temp_dir.path().join("state.db")).unwrap();
        (temp_dir, db)
    }

    fn binary(db: &StateDb, byte: u8) -> BinaryHash {
        let hash = BinaryHash(Hash::from_bytes([byte; 32]));
        db.add_binary_properties(&BinaryProperties {
            hash,
            original_length: 10,
            archived_length: 8,
            incremental_length: 8,
            chunk_count: 1,
        })
        .unwrap();
        hash
    }

    fn t(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_binary_properties_are_immutable() {
        let (_dir, db) = open();
        let hash = binary(&db, 1);
        assert!(db.is_dirty());

        let mut props = db.binary_properties(&hash).unwrap().unwrap();
        assert!(!db.add_binary_properties(&props).unwrap());

        props.original_length += 1;
        let err = db.add_binary_properties(&props).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(db.binary_count().unwrap(), 1);
    }

    #[test]
    fn test_upsert_suppresses_no_op_history() {
        let (_dir, db) = open();
        let hash = binary(&db, 1);

        let entry = PointerFileEntry::live("a.txt", hash, t(1), Some(t(1)), Some(t(1)));
        assert_eq!(db.upsert_pointer_file_entry(&entry).unwrap(), UpsertResult::Upserted);

        let again = PointerFileEntry::live("a.txt", hash, t(2), Some(t(1)), Some(t(1)));
        assert_eq!(db.upsert_pointer_file_entry(&again).unwrap(), UpsertResult::NoChange);

        let touched = PointerFileEntry::live("a.txt", hash, t(3), Some(t(1)), Some(t(3)));
        assert_eq!(db.upsert_pointer_file_entry(&touched).unwrap(), UpsertResult::Upserted);
        assert_eq!(db.entry_count().unwrap(), 2);
    }

    #[test]
    fn test_tombstones() {
        let (_dir, db) = open();
        let hash = binary(&db, 1);
        let entry = PointerFileEntry::live("dir/a.txt", hash, t(1), None, Some(t(1)));
        db.upsert_pointer_file_entry(&entry).unwrap();

        assert_eq!(db.tombstone(&entry, t(2)).unwrap(), UpsertResult::InsertedDeleted);
        // Already deleted
        assert_eq!(db.tombstone(&entry, t(3)).unwrap(), UpsertResult::NoChange);

        // No history at all
        let ghost = PointerFileEntry::live("ghost", hash, t(1), None, None);
        assert_eq!(db.tombstone(&ghost, t(2)).unwrap(), UpsertResult::NoChange);

        assert!(db.entries_as_of(t(2), false).unwrap().is_empty());
        let all = db.entries_as_of(t(2), true).unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].is_deleted);
        assert!(all[0].binary_hash.is_none());
        assert!(all[0].last_write_time_utc.is_none());

        // History is still there
        assert_eq!(db.entries_as_of(t(1), false).unwrap(), vec![entry]);
    }

    #[test]
    fn test_entries_as_of_takes_latest_per_path() {
        let (_dir, db) = open();
        let (h1, h2) = (binary(&db, 1), binary(&db, 2));

        db.upsert_pointer_file_entry(&PointerFileEntry::live("a", h1, t(1), None, None)).unwrap();
        db.upsert_pointer_file_entry(&PointerFileEntry::live("b", h1, t(2), None, None)).unwrap();
        db.upsert_pointer_file_entry(&PointerFileEntry::live("a", h2, t(3), None, None)).unwrap();

        assert_eq!(db.versions().unwrap(), vec![t(1), t(2), t(3)]);
        assert!(db.entries_as_of(t(1) - Duration::seconds(1), true).unwrap().is_empty());

        let at_2 = db.entries_as_of(t(2) + Duration::hours(1), false).unwrap();
        assert_eq!(at_2.len(), 2);
        assert_eq!(at_2[0].binary_hash, Some(h1));
        assert_eq!(at_2[0].version_utc, t(1));

        let latest = db.latest_entries(false).unwrap();
        assert_eq!(latest[0].binary_hash, Some(h2));
        assert_eq!(db.resolve_version(t(2) + Duration::hours(1)).unwrap(), Some(t(2)));
    }

    #[test]
    fn test_live_entry_requires_known_binary() {
        let (_dir, db) = open();
        let unknown = BinaryHash(Hash::from_bytes([9; 32]));
        let entry = PointerFileEntry::live("a", unknown, t(1), None, None);
        assert!(matches!(
            db.upsert_pointer_file_entry(&entry),
            Err(ArchiveError::Sqlite(_))
        ));
    }

    #[test]
    fn test_reopen_preserves_rows() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("state.db");
        let db = StateDb::open(&path).unwrap();
        let hash = binary(&db, 4);
        db.upsert_pointer_file_entry(&PointerFileEntry::live("x", hash, t(5), Some(t(4)), Some(t(5))))
            .unwrap();
        db.vacuum().unwrap();
        db.close().unwrap();

        let db = StateDb::open(&path).unwrap();
        assert!(!db.is_dirty());
        let entries = db.latest_entries(false).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].creation_time_utc, Some(t(4)));
    }
}
