use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::traits::KvStore;
use taskmesh_types::{MeshError, Result};

#[derive(Debug, Default)]
struct Snapshot {
    values: BTreeMap<Vec<u8>, Vec<u8>>,
    logs: BTreeMap<Vec<u8>, Vec<Vec<u8>>>,
}

/// On-disk form; JSON object keys must be strings, so maps become pair lists.
#[derive(Serialize, Deserialize, Default)]
struct PersistedSnapshot {
    values: Vec<(Vec<u8>, Vec<u8>)>,
    logs: Vec<(Vec<u8>, Vec<Vec<u8>>)>,
}

/// File-backed store: one JSON snapshot, rewritten atomically (.tmp -> rename)
/// on every mutation and reloaded on open.
pub struct FileStore {
    path: PathBuf,
    state: Mutex<Snapshot>,
}

impl FileStore {
    /// Open the store at `path`, loading the snapshot if one exists.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let snapshot = if tokio::fs::try_exists(&path).await.map_err(storage_err)? {
            let content = tokio::fs::read(&path).await.map_err(storage_err)?;
            let persisted: PersistedSnapshot = serde_json::from_slice(&content)?;
            Snapshot {
                values: persisted.values.into_iter().collect(),
                logs: persisted.logs.into_iter().collect(),
            }
        } else {
            Snapshot::default()
        };
        tracing::debug!(path = %path.display(), "opened file store");
        Ok(Self {
            path,
            state: Mutex::new(snapshot),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(storage_err)?;
        }
        let persisted = PersistedSnapshot {
            values: snapshot
                .values
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            logs: snapshot
                .logs
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        let content = serde_json::to_vec(&persisted)?;
        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, content)
            .await
            .map_err(storage_err)?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(storage_err)?;
        Ok(())
    }
}

fn storage_err(err: std::io::Error) -> MeshError {
    MeshError::Storage(err.to_string())
}

#[async_trait]
impl KvStore for FileStore {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let state = self.state.lock().await;
        Ok(state.values.get(key).cloned())
    }

    async fn put(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        let mut state = self.state.lock().await;
        let previous = state.values.insert(key.to_vec(), value);
        if let Err(e) = self.save(&state).await {
            // Keep memory and disk in agreement.
            match previous {
                Some(v) => state.values.insert(key.to_vec(), v),
                None => state.values.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> Result<()> {
        let mut state = self.state.lock().await;
        let value = state.values.remove(key);
        let log = state.logs.remove(key);
        if value.is_none() && log.is_none() {
            return Ok(());
        }
        if let Err(e) = self.save(&state).await {
            if let Some(v) = value {
                state.values.insert(key.to_vec(), v);
            }
            if let Some(l) = log {
                state.logs.insert(key.to_vec(), l);
            }
            return Err(e);
        }
        Ok(())
    }

    async fn append(&self, key: &[u8], value: Vec<u8>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let log = state.logs.entry(key.to_vec()).or_default();
        log.push(value);
        let index = (log.len() - 1) as u64;
        if let Err(e) = self.save(&state).await {
            if let Some(log) = state.logs.get_mut(key) {
                log.pop();
                if log.is_empty() {
                    state.logs.remove(key);
                }
            }
            return Err(e);
        }
        Ok(index)
    }

    async fn read_log(&self, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        let state = self.state.lock().await;
        Ok(state.logs.get(key).cloned().unwrap_or_default())
    }

    async fn keys_with_prefix(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
        let state = self.state.lock().await;
        let mut keys: Vec<Vec<u8>> = state
            .values
            .keys()
            .chain(state.logs.keys())
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}
