//! Directory-backed object store
//!
//! ```text
//! store_root/
//! ├── chunks/<hash>              # object bytes, one file per key
//! ├── chunklists/<hash>
//! ├── states/<version>
//! └── .meta/                     # sidecar properties, mirroring the keys
//!     └── chunks/<hash>.json
//! ```
//!
//! Writes go through a temp file and a rename, so a reader never observes a
//! half-written object. Copying an archive-tier object completes immediately;
//! there is no real cold tier behind a directory.

use super::{ArchiveStatus, ObjectProperties, ObjectStore, PutOptions};
use crate::error::{ArchiveError, Result};
use crate::types::AccessTier;
use crate::utils;
use async_trait::async_trait;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};
use walkdir::WalkDir;

const META_DIR: &str = ".meta";

/// Object store rooted at a local directory
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: Arc<PathBuf>,
}

impl LocalObjectStore {
    /// Open (creating if needed) a store rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(META_DIR))?;
        debug!("Opened local object store at {:?}", root);
        Ok(Self {
            root: Arc::new(root),
        })
    }

    /// Root directory of the store
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Run blocking filesystem work off the async runtime
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Path) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || f(&root)).await?
    }
}

fn validate_key(key: &str) -> Result<()> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.split('/').any(|part| part.is_empty() || part == "." || part == "..")
        || key.starts_with(META_DIR);
    if bad {
        return Err(ArchiveError::storage(format!("invalid object key '{}'", key)));
    }
    Ok(())
}

fn object_path(root: &Path, key: &str) -> PathBuf {
    utils::resolve_relative(root, key)
}

fn meta_path(root: &Path, key: &str) -> PathBuf {
    utils::resolve_relative(&root.join(META_DIR), &format!("{}.json", key))
}

fn read_properties(root: &Path, key: &str) -> Result<Option<ObjectProperties>> {
    let metadata = match fs::metadata(object_path(root, key)) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    match fs::read(meta_path(root, key)) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        // Object written without a sidecar (e.g. interrupted put)
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Some(ObjectProperties {
            length: metadata.len(),
            tier: AccessTier::default(),
            content_type: None,
            archive_status: ArchiveStatus::None,
        })),
        Err(e) => Err(e.into()),
    }
}

fn write_properties(root: &Path, key: &str, properties: &ObjectProperties) -> Result<()> {
    utils::atomic_write(&meta_path(root, key), &serde_json::to_vec(properties)?)
}

fn remove_if_present(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, key: &str, data: Vec<u8>, options: PutOptions) -> Result<u64> {
        validate_key(key)?;
        let key = key.to_string();
        self.blocking(move |root| {
            let path = object_path(root, &key);
            if !options.overwrite && path.exists() {
                return Err(ArchiveError::ObjectAlreadyExists(key));
            }
            let length = data.len() as u64;
            utils::atomic_write(&path, &data)?;
            write_properties(
                root,
                &key,
                &ObjectProperties {
                    length,
                    tier: options.tier,
                    content_type: options.content_type,
                    archive_status: ArchiveStatus::None,
                },
            )?;
            trace!("Stored {} ({} bytes, {})", key, length, options.tier);
            Ok(length)
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;
        let key = key.to_string();
        self.blocking(move |root| {
            let Some(properties) = read_properties(root, &key)? else {
                return Ok(None);
            };
            if !properties.is_readable() {
                return Err(ArchiveError::ObjectArchived(key));
            }
            match fs::read(object_path(root, &key)) {
                Ok(data) => Ok(Some(data)),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn properties(&self, key: &str) -> Result<Option<ObjectProperties>> {
        validate_key(key)?;
        let key = key.to_string();
        self.blocking(move |root| read_properties(root, &key)).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = prefix.to_string();
        self.blocking(move |root| {
            let mut keys = Vec::new();
            let walker = WalkDir::new(root)
                .min_depth(1)
                .into_iter()
                .filter_entry(|entry| entry.depth() != 1 || entry.file_name() != META_DIR);
            for entry in walker {
                let entry = entry?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let key = utils::relative_name(entry.path(), root)?;
                if key.ends_with(".tmp") {
                    continue;
                }
                if key.starts_with(&prefix) {
                    keys.push(key);
                }
            }
            keys.sort();
            Ok(keys)
        })
        .await
    }

    async fn set_tier(&self, key: &str, tier: AccessTier) -> Result<()> {
        validate_key(key)?;
        let key = key.to_string();
        self.blocking(move |root| {
            let mut properties =
                read_properties(root, &key)?.ok_or_else(|| ArchiveError::ObjectNotFound(key.clone()))?;
            properties.tier = tier;
            write_properties(root, &key, &properties)
        })
        .await
    }

    async fn copy(&self, src: &str, dst: &str, tier: AccessTier) -> Result<()> {
        validate_key(src)?;
        validate_key(dst)?;
        let (src, dst) = (src.to_string(), dst.to_string());
        self.blocking(move |root| {
            let source =
                read_properties(root, &src)?.ok_or_else(|| ArchiveError::ObjectNotFound(src.clone()))?;
            let data = fs::read(object_path(root, &src))?;
            utils::atomic_write(&object_path(root, &dst), &data)?;

            let archive_status = if source.tier.is_online() {
                ArchiveStatus::None
            } else {
                ArchiveStatus::Done
            };
            write_properties(
                root,
                &dst,
                &ObjectProperties {
                    length: data.len() as u64,
                    tier,
                    content_type: source.content_type,
                    archive_status,
                },
            )?;
            debug!("Copied {} -> {} ({})", src, dst, tier);
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        let key = key.to_string();
        self.blocking(move |root| {
            let object = object_path(root, &key);
            let existed = remove_if_present(&object)?;
            let meta = meta_path(root, &key);
            remove_if_present(&meta)?;
            utils::prune_empty_parents(&object, root);
            utils::prune_empty_parents(&meta, &root.join(META_DIR));
            Ok(existed)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_get_and_conflict() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalObjectStore::open(temp_dir.path()).unwrap();

        let length = store
            .put("chunks/abc", b"sealed".to_vec(), PutOptions::new(AccessTier::Cool))
            .await
            .unwrap();
        assert_eq!(length, 6);
        assert_eq!(store.get("chunks/abc").await.unwrap().unwrap(), b"sealed");

        let err = store
            .put("chunks/abc", b"other".to_vec(), PutOptions::new(AccessTier::Cool))
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::ObjectAlreadyExists(_)));

        store
            .put(
                "chunks/abc",
                b"other".to_vec(),
                PutOptions::new(AccessTier::Hot).overwrite(true),
            )
            .await
            .unwrap();
        let props = store.properties("chunks/abc").await.unwrap().unwrap();
        assert_eq!(props.length, 5);
        assert_eq!(props.tier, AccessTier::Hot);
        assert!(store.get("chunks/missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_archived_objects_need_copy() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalObjectStore::open(temp_dir.path()).unwrap();

        store
            .put("chunks/cold", b"data".to_vec(), PutOptions::new(AccessTier::Archive))
            .await
            .unwrap();
        assert!(matches!(
            store.get("chunks/cold").await,
            Err(ArchiveError::ObjectArchived(_))
        ));

        store
            .copy("chunks/cold", "chunks-rehydrated/cold", AccessTier::Cold)
            .await
            .unwrap();
        let props = store.properties("chunks-rehydrated/cold").await.unwrap().unwrap();
        assert_eq!(props.archive_status, ArchiveStatus::Done);
        assert_eq!(
            store.get("chunks-rehydrated/cold").await.unwrap().unwrap(),
            b"data"
        );
    }

    #[tokio::test]
    async fn test_list_excludes_metadata_and_delete_prunes() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalObjectStore::open(temp_dir.path()).unwrap();
        for key in ["states/b", "states/a", "chunks/x"] {
            store
                .put(key, vec![1], PutOptions::new(AccessTier::Cool))
                .await
                .unwrap();
        }

        assert_eq!(store.list("states/").await.unwrap(), vec!["states/a", "states/b"]);
        assert_eq!(store.list("").await.unwrap().len(), 3);

        assert!(store.delete("chunks/x").await.unwrap());
        assert!(!store.delete("chunks/x").await.unwrap());
        assert!(!temp_dir.path().join("chunks").exists());
        assert!(store.put("../escape", vec![], PutOptions::default()).await.is_err());
    }
}
