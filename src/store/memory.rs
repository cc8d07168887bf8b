//! In-process object store
//!
//! Behaves like a tiered cloud store: archive-tier objects cannot be read,
//! and copies out of the archive tier stay pending until
//! [`MemoryObjectStore::complete_rehydrations`] is called. Counters for puts
//! and copies let callers assert how much traffic an operation caused.

use super::{ArchiveStatus, ObjectProperties, ObjectStore, PutOptions};
use crate::error::{ArchiveError, Result};
use crate::types::AccessTier;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Arc<Vec<u8>>,
    properties: ObjectProperties,
}

/// Object store that lives in memory
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: RwLock<BTreeMap<String, StoredObject>>,
    puts: AtomicUsize,
    copies: AtomicUsize,
}

impl MemoryObjectStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `put` calls so far
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    /// Number of successful `copy` calls so far
    pub fn copy_count(&self) -> usize {
        self.copies.load(Ordering::SeqCst)
    }

    /// Number of objects whose key starts with `prefix`
    pub fn object_count(&self, prefix: &str) -> usize {
        self.objects
            .read()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .count()
    }

    /// Finish every pending rehydration; returns how many completed
    pub fn complete_rehydrations(&self) -> usize {
        let mut objects = self.objects.write();
        let mut completed = 0;
        for object in objects.values_mut() {
            if object.properties.archive_status == ArchiveStatus::Pending {
                object.properties.archive_status = ArchiveStatus::Done;
                completed += 1;
            }
        }
        completed
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, data: Vec<u8>, options: PutOptions) -> Result<u64> {
        let mut objects = self.objects.write();
        if !options.overwrite && objects.contains_key(key) {
            return Err(ArchiveError::ObjectAlreadyExists(key.to_string()));
        }
        let length = data.len() as u64;
        objects.insert(
            key.to_string(),
            StoredObject {
                data: Arc::new(data),
                properties: ObjectProperties {
                    length,
                    tier: options.tier,
                    content_type: options.content_type,
                    archive_status: ArchiveStatus::None,
                },
            },
        );
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(length)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let objects = self.objects.read();
        match objects.get(key) {
            None => Ok(None),
            Some(object) if !object.properties.is_readable() => {
                Err(ArchiveError::ObjectArchived(key.to_string()))
            }
            Some(object) => Ok(Some(object.data.as_ref().clone())),
        }
    }

    async fn properties(&self, key: &str) -> Result<Option<ObjectProperties>> {
        Ok(self.objects.read().get(key).map(|o| o.properties.clone()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .objects
            .read()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn set_tier(&self, key: &str, tier: AccessTier) -> Result<()> {
        let mut objects = self.objects.write();
        let object = objects
            .get_mut(key)
            .ok_or_else(|| ArchiveError::ObjectNotFound(key.to_string()))?;
        object.properties.tier = tier;
        Ok(())
    }

    async fn copy(&self, src: &str, dst: &str, tier: AccessTier) -> Result<()> {
        let mut objects = self.objects.write();
        let source = objects
            .get(src)
            .cloned()
            .ok_or_else(|| ArchiveError::ObjectNotFound(src.to_string()))?;

        let archive_status = if source.properties.tier.is_online() {
            ArchiveStatus::None
        } else {
            ArchiveStatus::Pending
        };
        objects.insert(
            dst.to_string(),
            StoredObject {
                data: source.data,
                properties: ObjectProperties {
                    length: source.properties.length,
                    tier,
                    content_type: source.properties.content_type,
                    archive_status,
                },
            },
        );
        self.copies.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.objects.write().remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rehydration_stays_pending_until_completed() {
        let store = MemoryObjectStore::new();
        store
            .put("chunks/a", b"x".to_vec(), PutOptions::new(AccessTier::Archive))
            .await
            .unwrap();

        store
            .copy("chunks/a", "chunks-rehydrated/a", AccessTier::Cold)
            .await
            .unwrap();
        let staged = store.properties("chunks-rehydrated/a").await.unwrap().unwrap();
        assert_eq!(staged.archive_status, ArchiveStatus::Pending);
        assert!(store.get("chunks-rehydrated/a").await.is_err());

        assert_eq!(store.complete_rehydrations(), 1);
        assert_eq!(store.get("chunks-rehydrated/a").await.unwrap().unwrap(), b"x");
        assert_eq!(store.copy_count(), 1);
        assert_eq!(store.put_count(), 1);
    }

    #[tokio::test]
    async fn test_prefix_listing() {
        let store = MemoryObjectStore::new();
        for key in ["chunks/1", "chunks-rehydrated/1", "chunklists/2"] {
            store.put(key, vec![], PutOptions::default()).await.unwrap();
        }
        assert_eq!(store.list("chunks/").await.unwrap(), vec!["chunks/1"]);
        assert_eq!(store.object_count("chunk"), 3);
    }
}
