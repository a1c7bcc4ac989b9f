use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Shared key-value store capability. The backing store is expected to offer
/// single-key read/write atomicity, but no cross-call transactions.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value` under `key` only if the key is currently absent.
    /// Returns `true` if this call stored the value, `false` if another
    /// writer got there first.
    async fn set_if_absent(&self, key: &str, value: &[u8]) -> Result<bool>;
}

/// Initialize a key exactly once across any number of concurrently starting
/// instances, and return the value that ended up stored.
///
/// The re-read after the write is mandatory: if another instance won the
/// race, its value is the one every caller must converge on. Losing the
/// write is success, not failure. If the final re-read itself fails, the
/// caller's `initial` is returned as a best-effort result and the read error
/// is only logged.
pub async fn ensure_once(store: &dyn KvStore, key: &str, initial: &[u8]) -> Result<Vec<u8>> {
    if let Some(existing) = store.get(key).await? {
        return Ok(existing);
    }

    let write_result = store.set_if_absent(key, initial).await;
    match &write_result {
        Ok(true) => {}
        Ok(false) => tracing::debug!(key, "key was already initialized by another instance"),
        Err(err) => tracing::warn!(%err, key, "initial write failed, re-reading current value"),
    }

    // Load again in case we lost the race to another instance.
    match store.get(key).await {
        Ok(Some(value)) => Ok(value),
        Ok(None) => write_result.map(|_| initial.to_vec()),
        Err(err) => {
            tracing::warn!(%err, key, "re-read after initialization failed, using local value");
            Ok(initial.to_vec())
        }
    }
}

/// In-process store. Used in tests and as a degraded single-instance default.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unconditionally overwrite a key, bypassing `set_if_absent`. Exists so
    /// tests and operator tooling can rotate values under a live store.
    pub fn insert(&self, key: &str, value: &[u8]) {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_vec());
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn set_if_absent(&self, key: &str, value: &[u8]) -> Result<bool> {
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), value.to_vec());
        Ok(true)
    }
}
