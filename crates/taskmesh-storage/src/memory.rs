use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

use crate::traits::KvStore;
use taskmesh_types::Result;

/// In-memory store (default).
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    values: Arc<DashMap<Vec<u8>, Vec<u8>>>,
    logs: Arc<DashMap<Vec<u8>, Vec<Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.values.get(key).map(|v| v.value().clone()))
    }

    async fn put(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.values.insert(key.to_vec(), value);
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> Result<()> {
        self.values.remove(key);
        self.logs.remove(key);
        Ok(())
    }

    async fn append(&self, key: &[u8], value: Vec<u8>) -> Result<u64> {
        // The shard lock held by `entry` makes push-and-index atomic.
        let mut log = self.logs.entry(key.to_vec()).or_default();
        log.push(value);
        Ok((log.len() - 1) as u64)
    }

    async fn read_log(&self, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .logs
            .get(key)
            .map(|log| log.value().clone())
            .unwrap_or_default())
    }

    async fn keys_with_prefix(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut keys: Vec<Vec<u8>> = self
            .values
            .iter()
            .map(|e| e.key().clone())
            .chain(self.logs.iter().map(|e| e.key().clone()))
            .filter(|k| k.starts_with(prefix))
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}
