//! Shared key/value storage for sticking records.

use std::collections::HashMap;
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::LbResult;

/// A key/value store with expiry, shared by every process that routes queries.
#[async_trait]
pub trait StickingStore: Send + Sync + Debug {
    /// Returns the value for `key`, or `None` if missing or expired.
    async fn get(&self, key: &str) -> LbResult<Option<String>>;

    /// Stores `value` under `key` for `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> LbResult<()>;

    /// Deletes `key`.
    async fn delete(&self, key: &str) -> LbResult<()>;

    /// Deletes `key` only if it still holds `expected`. Returns true if deleted.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> LbResult<bool>;
}

/// In-process [`StickingStore`], for single-process deployments and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|(_, expires_at)| *expires_at > now)
            .count()
    }

    /// Returns true if the store holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StickingStore for MemoryStore {
    async fn get(&self, key: &str) -> LbResult<Option<String>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((value, expires_at)) if *expires_at > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> LbResult<()> {
        self.entries
            .lock()
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> LbResult<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> LbResult<bool> {
        let mut entries = self.entries.lock();
        if entries.get(key).is_some_and(|(value, _)| value == expected) {
            entries.remove(key);
            return Ok(true);
        }
        Ok(false)
    }
}
