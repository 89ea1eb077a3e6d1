//! Key-addressed blob stores behind the storage layer.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::path::{Component, PathBuf};
use std::sync::Mutex;
use tracing::debug;

use crate::error::StorageError;
use crate::persistence;

/// A durable key/value store of byte blobs. Writing an existing key replaces it.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, body: Bytes, content_type: &str) -> Result<(), StorageError>;

    /// Returns `Ok(None)` if nothing is stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StorageError>;

    /// All keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Human-readable location for log lines, e.g. `file:///var/lib/stratus`.
    fn location(&self) -> String;
}

fn validate_key(key: &str) -> Result<(), StorageError> {
    let invalid = |reason: &str| StorageError::InvalidKey {
        key: key.to_string(),
        reason: reason.to_string(),
    };
    if key.is_empty() {
        return Err(invalid("key is empty"));
    }
    if key.starts_with('/') {
        return Err(invalid("key must be relative"));
    }
    if key.split('/').any(|part| part.is_empty() || part == "." || part == "..") {
        return Err(invalid("key contains an empty, '.' or '..' segment"));
    }
    Ok(())
}

/// Filesystem-backed store; keys map to paths under `root`.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        let path = self.root.join(key);
        if path
            .strip_prefix(&self.root)
            .map(|rel| rel.components().all(|c| matches!(c, Component::Normal(_))))
            .unwrap_or(false)
        {
            Ok(path)
        } else {
            Err(StorageError::InvalidKey {
                key: key.to_string(),
                reason: "key escapes the store root".to_string(),
            })
        }
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, key: &str, body: Bytes, content_type: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        persistence::atomic_write_async(&path, &body)
            .await
            .map_err(|e| StorageError::WriteFailed {
                key: key.to_string(),
                message: e.to_string(),
            })?;
        debug!(key, bytes = body.len(), content_type, "Object written");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::ReadFailed {
                key: key.to_string(),
                message: e.to_string(),
            }),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        let mut keys = Vec::new();
        if !root.exists() {
            return Ok(keys);
        }
        for entry in walkdir::WalkDir::new(&root) {
            let entry = entry.map_err(|e| StorageError::ReadFailed {
                key: prefix.clone(),
                message: e.to_string(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(&root) else {
                continue;
            };
            let key = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if key.ends_with(".tmp") {
                continue;
            }
            if key.starts_with(&prefix) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn location(&self) -> String {
        format!("file://{}", self.root.display())
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    body: Bytes,
    content_type: String,
}

/// In-process store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    writes: Mutex<usize>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total successful `put` calls, including overwrites.
    pub fn write_count(&self) -> usize {
        *self.writes.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .map(|o| o.content_type.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, body: Bytes, content_type: &str) -> Result<(), StorageError> {
        validate_key(key)?;
        self.objects.lock().unwrap_or_else(|e| e.into_inner()).insert(
            key.to_string(),
            StoredObject {
                body,
                content_type: content_type.to_string(),
            },
        );
        *self.writes.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StorageError> {
        validate_key(key)?;
        Ok(self
            .objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .map(|o| o.body.clone()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn location(&self) -> String {
        "memory://".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_local_store_put_get_list() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path());
        store
            .put(
                "raw/year=2024/month=01/day=15/accra.json",
                Bytes::from_static(b"{}"),
                "application/json",
            )
            .await
            .unwrap();
        store
            .put(
                "processed/year=2024/month=01/day=15/accra.csv",
                Bytes::from_static(b"a,b\n"),
                "text/csv",
            )
            .await
            .unwrap();

        let body = store
            .get("raw/year=2024/month=01/day=15/accra.json")
            .await
            .unwrap();
        assert_eq!(body.as_deref(), Some(&b"{}"[..]));
        assert_eq!(
            store.list("raw/").await.unwrap(),
            vec!["raw/year=2024/month=01/day=15/accra.json".to_string()]
        );
        assert_eq!(store.list("").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_local_store_missing_key_is_none() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path());
        assert!(store.get("raw/nothing.json").await.unwrap().is_none());
        assert!(store.list("raw/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_local_store_overwrite_replaces() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path());
        store
            .put("k/v.csv", Bytes::from_static(b"long original"), "text/csv")
            .await
            .unwrap();
        store
            .put("k/v.csv", Bytes::from_static(b"new"), "text/csv")
            .await
            .unwrap();
        assert_eq!(
            store.get("k/v.csv").await.unwrap().as_deref(),
            Some(&b"new"[..])
        );
        assert_eq!(store.list("k/").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_store_rejects_escaping_keys() {
        let dir = TempDir::new().unwrap();
        let local = LocalObjectStore::new(dir.path());
        let memory = MemoryObjectStore::new();
        for key in ["../outside.json", "/etc/passwd", "raw//x.json", ""] {
            assert!(matches!(
                local.put(key, Bytes::new(), "text/plain").await,
                Err(StorageError::InvalidKey { .. })
            ));
            assert!(matches!(
                memory.put(key, Bytes::new(), "text/plain").await,
                Err(StorageError::InvalidKey { .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_memory_store_counts_writes() {
        let store = MemoryObjectStore::new();
        store
            .put("a/b.json", Bytes::from_static(b"1"), "application/json")
            .await
            .unwrap();
        store
            .put("a/b.json", Bytes::from_static(b"1"), "application/json")
            .await
            .unwrap();
        assert_eq!(store.write_count(), 2);
        assert_eq!(store.keys(), vec!["a/b.json".to_string()]);
        assert_eq!(
            store.content_type("a/b.json").as_deref(),
            Some("application/json")
        );
    }
}
