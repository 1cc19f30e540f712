use crate::record::{ApiKeyRecord, UsageGuard, UsageUpdate};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

/// Abstract storage interface for API key rows.
///
/// The store is the single source of truth for usage counters; the limiter keeps nothing in
/// memory between calls. Implementations over a SQL table map `conditional_update` to
/// `UPDATE ... SET usage = $new WHERE key = $key AND usage = $expected_usage
/// AND rate_limit_reset_at IS NOT DISTINCT FROM $expected_reset_at RETURNING *`.
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Error type for storage operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Fetch the row for `key`, or `None` if no such key exists.
    async fn read_by_key(&self, key: &str) -> Result<Option<ApiKeyRecord>, Self::Error>;

    /// Compare-and-swap on the `usage` and `rate_limit_reset_at` columns.
    ///
    /// Applies `update` only if the stored row still matches `expected`.
    /// Returns the updated row, or `Ok(None)` if nothing matched (lost race or deleted key).
    async fn conditional_update(
        &self,
        key: &str,
        expected: UsageGuard,
        update: UsageUpdate,
    ) -> Result<Option<ApiKeyRecord>, Self::Error>;

    /// Unconditional write. Returns `Ok(None)` if the key does not exist.
    ///
    /// The limiter never calls this. It is the write path for key management, such as an
    /// operator zeroing a key's usage or moving its window boundary.
    async fn update(
        &self,
        key: &str,
        update: UsageUpdate,
    ) -> Result<Option<ApiKeyRecord>, Self::Error>;
}

#[async_trait]
impl<S> KeyStore for Arc<S>
where
    S: KeyStore + ?Sized,
{
    type Error = S::Error;

    async fn read_by_key(&self, key: &str) -> Result<Option<ApiKeyRecord>, Self::Error> {
        (**self).read_by_key(key).await
    }

    async fn conditional_update(
        &self,
        key: &str,
        expected: UsageGuard,
        update: UsageUpdate,
    ) -> Result<Option<ApiKeyRecord>, Self::Error> {
        (**self).conditional_update(key, expected, update).await
    }

    async fn update(
        &self,
        key: &str,
        update: UsageUpdate,
    ) -> Result<Option<ApiKeyRecord>, Self::Error> {
        (**self).update(key, update).await
    }
}

/// Failure of the in-memory store (only possible after a panic poisoned its lock).
#[derive(Debug, Error)]
#[error("in-memory key store poisoned")]
pub struct StoreError;

/// Simple in-memory key store. Clones share the same table.
///
/// Every operation runs under one mutex, so `conditional_update` is a true compare-and-swap.
/// The async [`KeyStore`] operations report a poisoned lock as [`StoreError`]; the synchronous
/// helpers below recover the table and carry on.
#[derive(Default, Clone, Debug)]
pub struct InMemoryKeyStore {
    rows: Arc<Mutex<HashMap<String, ApiKeyRecord>>>,
}

impl InMemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn rows(&self) -> MutexGuard<'_, HashMap<String, ApiKeyRecord>> {
        self.rows.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert or replace a row. Stands in for the key-management surface in tests and demos.
    pub fn insert(&self, record: ApiKeyRecord) {
        self.rows().insert(record.key.clone(), record);
    }

    /// Remove a row, returning it if present.
    pub fn remove(&self, key: &str) -> Option<ApiKeyRecord> {
        self.rows().remove(key)
    }

    /// Snapshot of a row without going through the async interface.
    pub fn get(&self, key: &str) -> Option<ApiKeyRecord> {
        self.rows().get(key).cloned()
    }

    /// Sum of `usage` across all keys.
    pub fn total_usage(&self) -> u64 {
        self.rows().values().map(|r| r.usage).sum()
    }
}

#[async_trait]
impl KeyStore for InMemoryKeyStore {
    type Error = StoreError;

    async fn read_by_key(&self, key: &str) -> Result<Option<ApiKeyRecord>, Self::Error> {
        let rows = self.rows.lock().map_err(|_| StoreError)?;
        Ok(rows.get(key).cloned())
    }

    async fn conditional_update(
        &self,
        key: &str,
        expected: UsageGuard,
        update: UsageUpdate,
    ) -> Result<Option<ApiKeyRecord>, Self::Error> {
        let mut rows = self.rows.lock().map_err(|_| StoreError)?;
        match rows.get_mut(key) {
            Some(row) if expected.matches(row) => {
                row.apply(&update);
                Ok(Some(row.clone()))
            }
            // Race detected, or the key vanished
            _ => Ok(None),
        }
    }

    async fn update(
        &self,
        key: &str,
        update: UsageUpdate,
    ) -> Result<Option<ApiKeyRecord>, Self::Error> {
        let mut rows = self.rows.lock().map_err(|_| StoreError)?;
        Ok(rows.get_mut(key).map(|row| {
            row.apply(&update);
            row.clone()
        }))
    }
}
