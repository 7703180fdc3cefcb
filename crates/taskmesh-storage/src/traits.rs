use std::fmt::Display;

use async_trait::async_trait;

use taskmesh_types::Result;

/// Key-value storage collaborator shared by every component of an entity.
///
/// Plain values live under `put`/`get`/`delete`; append-only logs live under
/// `append`/`read_log`. Both share one key space for `keys_with_prefix`.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    async fn put(&self, key: &[u8], value: Vec<u8>) -> Result<()>;

    /// Remove a plain value or a whole log. Missing keys are not an error.
    async fn delete(&self, key: &[u8]) -> Result<()>;

    /// Atomically append to the log at `key`, returning the new entry's index.
    async fn append(&self, key: &[u8], value: Vec<u8>) -> Result<u64>;

    /// All entries of the log at `key`, in append order. Empty if absent.
    async fn read_log(&self, key: &[u8]) -> Result<Vec<Vec<u8>>>;

    /// Sorted, de-duplicated keys starting with `prefix`.
    async fn keys_with_prefix(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>>;
}

/// Build a namespaced key such as `task/<uuid>`.
pub fn namespaced_key(namespace: &str, id: impl Display) -> Vec<u8> {
    format!("{namespace}/{id}").into_bytes()
}

/// Strip `namespace/` from a key produced by [`namespaced_key`].
pub fn key_suffix<'a>(namespace: &str, key: &'a [u8]) -> Option<&'a str> {
    let key = std::str::from_utf8(key).ok()?;
    key.strip_prefix(namespace)?.strip_prefix('/')
}
