#![allow(dead_code)]

use async_trait::async_trait;
use keyquota::{ApiKeyRecord, InMemoryKeyStore, KeyStore, UsageGuard, UsageUpdate};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Route `tracing` output through the test harness. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn unavailable(op: &str) -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionRefused, format!("store unavailable during {op}"))
}

/// Which primitives a [`FailingStore`] refuses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailOn {
    Reads,
    Writes,
}

/// Wraps an in-memory store and fails the chosen primitives.
#[derive(Clone, Debug)]
pub struct FailingStore {
    inner: InMemoryKeyStore,
    fail_on: FailOn,
}

impl FailingStore {
    pub fn new(inner: InMemoryKeyStore, fail_on: FailOn) -> Self {
        Self { inner, fail_on }
    }
}

#[async_trait]
impl KeyStore for FailingStore {
    type Error = io::Error;

    async fn read_by_key(&self, key: &str) -> Result<Option<ApiKeyRecord>, Self::Error> {
        if self.fail_on == FailOn::Reads {
            return Err(unavailable("read"));
        }
        self.inner.read_by_key(key).await.map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    async fn conditional_update(
        &self,
        _key: &str,
        _expected: UsageGuard,
        _update: UsageUpdate,
    ) -> Result<Option<ApiKeyRecord>, Self::Error> {
        Err(unavailable("conditional update"))
    }

    async fn update(
        &self,
        _key: &str,
        _update: UsageUpdate,
    ) -> Result<Option<ApiKeyRecord>, Self::Error> {
        Err(unavailable("update"))
    }
}

/// Loses the first `conflicts` compare-and-swaps as if another writer got there first.
#[derive(Clone, Debug)]
pub struct ConflictingStore {
    inner: InMemoryKeyStore,
    conflicts_left: Arc<AtomicUsize>,
    cas_calls: Arc<AtomicUsize>,
}

impl ConflictingStore {
    pub fn new(inner: InMemoryKeyStore, conflicts: usize) -> Self {
        Self {
            inner,
            conflicts_left: Arc::new(AtomicUsize::new(conflicts)),
            cas_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn cas_calls(&self) -> usize {
        self.cas_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeyStore for ConflictingStore {
    type Error = <InMemoryKeyStore as KeyStore>::Error;

    async fn read_by_key(&self, key: &str) -> Result<Option<ApiKeyRecord>, Self::Error> {
        self.inner.read_by_key(key).await
    }

    async fn conditional_update(
        &self,
        key: &str,
        expected: UsageGuard,
        update: UsageUpdate,
    ) -> Result<Option<ApiKeyRecord>, Self::Error> {
        self.cas_calls.fetch_add(1, Ordering::SeqCst);
        let lost = self
            .conflicts_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if lost {
            return Ok(None);
        }
        self.inner.conditional_update(key, expected, update).await
    }

    async fn update(
        &self,
        key: &str,
        update: UsageUpdate,
    ) -> Result<Option<ApiKeyRecord>, Self::Error> {
        self.inner.update(key, update).await
    }
}

/// Counts every write that reaches the wrapped store.
#[derive(Clone, Debug)]
pub struct CountingStore {
    inner: InMemoryKeyStore,
    writes: Arc<AtomicUsize>,
}

impl CountingStore {
    pub fn new(inner: InMemoryKeyStore) -> Self {
        Self { inner, writes: Arc::new(AtomicUsize::new(0)) }
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeyStore for CountingStore {
    type Error = <InMemoryKeyStore as KeyStore>::Error;

    async fn read_by_key(&self, key: &str) -> Result<Option<ApiKeyRecord>, Self::Error> {
        self.inner.read_by_key(key).await
    }

    async fn conditional_update(
        &self,
        key: &str,
        expected: UsageGuard,
        update: UsageUpdate,
    ) -> Result<Option<ApiKeyRecord>, Self::Error> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.conditional_update(key, expected, update).await
    }

    async fn update(
        &self,
        key: &str,
        update: UsageUpdate,
    ) -> Result<Option<ApiKeyRecord>, Self::Error> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.update(key, update).await
    }
}

/// Answers the first read with a snapshot taken earlier, like a caller that read the row and
/// then stalled while others kept writing. Later reads and all writes go to the live table.
#[derive(Clone, Debug)]
pub struct StaleFirstReadStore {
    inner: InMemoryKeyStore,
    snapshot: Arc<Mutex<Option<ApiKeyRecord>>>,
}

impl StaleFirstReadStore {
    pub fn new(inner: InMemoryKeyStore, snapshot: ApiKeyRecord) -> Self {
        Self { inner, snapshot: Arc::new(Mutex::new(Some(snapshot))) }
    }
}

#[async_trait]
impl KeyStore for StaleFirstReadStore {
    type Error = <InMemoryKeyStore as KeyStore>::Error;

    async fn read_by_key(&self, key: &str) -> Result<Option<ApiKeyRecord>, Self::Error> {
        let stale = self.snapshot.lock().unwrap().take();
        match stale {
            Some(row) => Ok(Some(row)),
            None => self.inner.read_by_key(key).await,
        }
    }

    async fn conditional_update(
        &self,
        key: &str,
        expected: UsageGuard,
        update: UsageUpdate,
    ) -> Result<Option<ApiKeyRecord>, Self::Error> {
        self.inner.conditional_update(key, expected, update).await
    }

    async fn update(
        &self,
        key: &str,
        update: UsageUpdate,
    ) -> Result<Option<ApiKeyRecord>, Self::Error> {
        self.inner.update(key, update).await
    }
}
