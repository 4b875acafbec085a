//! Build log storage abstraction.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;

use crate::{Error, Result};

/// Compose the stored log for a finished build from its two container logs.
pub fn compose_build_log(pre_process: &str, main: &str) -> String {
    format!(
        "----- pre-process -----\n{}\n----- main -----\n{}",
        pre_process, main
    )
}

/// Object storage for build logs, keyed by log file name.
#[async_trait]
pub trait LogStore: Send + Sync {
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Remove a log. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// In-memory log store, used by tests and single-process development.
#[derive(Debug, Clone, Default)]
pub struct MemoryLogStore {
    objects: Arc<RwLock<HashMap<String, Bytes>>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .read()
            .map(|o| o.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let mut objects = self
            .objects
            .write()
            .map_err(|_| Error::Internal("lock poisoned".into()))?;
        objects.insert(key.to_string(), data);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let objects = self
            .objects
            .read()
            .map_err(|_| Error::Internal("lock poisoned".into()))?;
        objects
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("log not found: {}", key)))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut objects = self
            .objects
            .write()
            .map_err(|_| Error::Internal("lock poisoned".into()))?;
        objects.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compose_build_log() {
        let log = compose_build_log("cloned", "INFO: Build completed");
        assert_eq!(
            log,
            "----- pre-process -----\ncloned\n----- main -----\nINFO: Build completed"
        );
    }

    #[tokio::test]
    async fn test_memory_log_store() {
        let store = MemoryLogStore::new();
        store.put("ops-1", Bytes::from("log")).await.unwrap();
        assert_eq!(store.get("ops-1").await.unwrap(), Bytes::from("log"));

        store.delete("ops-1").await.unwrap();
        assert!(store.get("ops-1").await.unwrap_err().is_not_found());
        store.delete("ops-1").await.unwrap();
    }
}
