//! In-process `mem://` storage.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Result};

use super::{Metadata, Storage};

#[derive(Debug, Clone)]
struct Object {
    data: Vec<u8>,
    metadata: Metadata,
}

/// Objects keyed by full URI. Cheap to clone; clones share contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<RwLock<BTreeMap<String, Object>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// All stored URIs, sorted.
    pub fn keys(&self) -> Vec<String> {
        match self.inner.read() {
            Ok(store) => store.keys().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    fn read_lock(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, BTreeMap<String, Object>>> {
        self.inner
            .read()
            .map_err(|_| anyhow!("memory storage lock poisoned"))
    }

    fn write_lock(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, BTreeMap<String, Object>>> {
        self.inner
            .write()
            .map_err(|_| anyhow!("memory storage lock poisoned"))
    }
}

#[async_trait::async_trait]
impl Storage for MemoryStorage {
    async fn read(&self, uri: &str) -> Result<Vec<u8>> {
        self.read_lock()?
            .get(uri)
            .map(|o| o.data.clone())
            .ok_or_else(|| anyhow!("<{}> does not exist", uri))
    }

    async fn write(&self, uri: &str, data: Vec<u8>, metadata: Metadata) -> Result<()> {
        let len = data.len();
        self.write_lock()?
            .insert(uri.to_string(), Object { data, metadata });
        tracing::debug!("MemoryStorage: stored '{}' ({} bytes)", uri, len);
        Ok(())
    }

    async fn exists(&self, uri: &str) -> Result<bool> {
        Ok(self.read_lock()?.contains_key(uri))
    }

    async fn metadata(&self, uri: &str) -> Result<Metadata> {
        self.read_lock()?
            .get(uri)
            .map(|o| o.metadata.clone())
            .ok_or_else(|| anyhow!("<{}> does not exist", uri))
    }

    async fn delete(&self, uris: &[String]) -> Result<()> {
        let mut store = self.write_lock()?;
        for uri in uris {
            store.remove(uri);
        }
        Ok(())
    }

    async fn list(&self, uri: &str) -> Result<Vec<String>> {
        let prefix = format!("{}/", uri.trim_end_matches('/'));
        let store = self.read_lock()?;
        let children: BTreeSet<String> = store
            .keys()
            .filter_map(|key| key.strip_prefix(&prefix))
            .filter_map(|rest| rest.split('/').next())
            .filter(|name| !name.is_empty())
            .map(|name| format!("{}{}", prefix, name))
            .collect();
        Ok(children.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_and_retrieve() {
        let store = MemoryStorage::new();
        let mut meta = Metadata::new();
        meta.insert("method".to_string(), "pdf_to_text".to_string());

        store
            .write("mem://docs/a.txt", b"Hello, world!".to_vec(), meta)
            .await
            .unwrap();

        assert_eq!(store.read("mem://docs/a.txt").await.unwrap(), b"Hello, world!");
        assert_eq!(
            store.metadata("mem://docs/a.txt").await.unwrap()["method"],
            "pdf_to_text"
        );
        assert!(store.read("mem://docs/missing.txt").await.is_err());
    }

    #[tokio::test]
    async fn test_list_children() {
        let store = MemoryStorage::new();
        for key in ["mem://t/a.txt", "mem://t/b.txt", "mem://t/ids/1", "mem://other/c"] {
            store.write(key, Vec::new(), Metadata::new()).await.unwrap();
        }
        let children = store.list("mem://t").await.unwrap();
        assert_eq!(children, vec!["mem://t/a.txt", "mem://t/b.txt", "mem://t/ids"]);
    }

    #[tokio::test]
    async fn test_delete_and_shared_clones() {
        let store = MemoryStorage::new();
        let clone = store.clone();
        store.write("mem://x", vec![1], Metadata::new()).await.unwrap();
        assert!(clone.exists("mem://x").await.unwrap());
        clone.delete(&["mem://x".to_string()]).await.unwrap();
        assert!(!store.exists("mem://x").await.unwrap());
        assert!(store.keys().is_empty());
    }
}
