//! Local persistence cache: durable on-device copy of each document's merged
//! state, so a session can start (and edit) without the remote log.
//!
//! The cache stores whole snapshots, never deltas. A failed load or save is
//! reported as [`PersistenceError`]; the sync controller then keeps the
//! session running in memory.

use crate::storage::{DocumentStore, StoreError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Persistence errors.
#[derive(Debug, Clone, PartialEq)]
pub enum PersistenceError {
    Store(StoreError),
    /// Backend refused or is unreachable.
    Unavailable(String),
    /// Blocking task panicked or was cancelled.
    TaskFailed(String),
}

impl std::fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store(e) => write!(f, "Store error: {e}"),
            Self::Unavailable(e) => write!(f, "Persistence unavailable: {e}"),
            Self::TaskFailed(e) => write!(f, "Persistence task failed: {e}"),
        }
    }
}

impl std::error::Error for PersistenceError {}

impl From<StoreError> for PersistenceError {
    fn from(e: StoreError) -> Self {
        PersistenceError::Store(e)
    }
}

impl From<tokio::task::JoinError> for PersistenceError {
    fn from(e: tokio::task::JoinError) -> Self {
        PersistenceError::TaskFailed(e.to_string())
    }
}

/// Durable snapshot store keyed by document id.
#[async_trait]
pub trait PersistenceCache: Send + Sync {
    /// Last saved snapshot, `None` if the document was never saved.
    async fn load(&self, doc_id: Uuid) -> Result<Option<Vec<u8>>, PersistenceError>;

    /// Replace the stored snapshot.
    async fn save(&self, doc_id: Uuid, snapshot: &[u8]) -> Result<(), PersistenceError>;
}

// ───────────────────────────────────────────────────────────────────
// RocksDB
// ───────────────────────────────────────────────────────────────────

/// [`PersistenceCache`] over a RocksDB [`DocumentStore`].
#[derive(Clone)]
pub struct RocksCache {
    store: Arc<DocumentStore>,
}

impl RocksCache {
    pub fn new(store: Arc<DocumentStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }
}

#[async_trait]
impl PersistenceCache for RocksCache {
    async fn load(&self, doc_id: Uuid) -> Result<Option<Vec<u8>>, PersistenceError> {
        let store = self.store.clone();
        let snapshot = tokio::task::spawn_blocking(move || store.load_snapshot(doc_id)).await??;
        Ok(snapshot)
    }

    async fn save(&self, doc_id: Uuid, snapshot: &[u8]) -> Result<(), PersistenceError> {
        let store = self.store.clone();
        let bytes = snapshot.to_vec();
        let meta = tokio::task::spawn_blocking(move || store.save_snapshot(doc_id, &bytes)).await??;
        log::trace!(
            "Saved {doc_id}: {} bytes ({} compressed)",
            meta.snapshot_size,
            meta.compressed_size
        );
        Ok(())
    }
}

// ───────────────────────────────────────────────────────────────────
// In-memory
// ───────────────────────────────────────────────────────────────────

/// In-memory [`PersistenceCache`] with fault injection.
///
/// Outlives sessions, so tests can destroy a session and reopen the same
/// document from it as if from disk.
#[derive(Default)]
pub struct MemoryCache {
    snapshots: Mutex<HashMap<Uuid, Vec<u8>>>,
    fail_loads: AtomicBool,
    fail_saves: AtomicBool,
    save_delay: Mutex<Option<Duration>>,
    saves: AtomicU64,
    in_flight: AtomicU64,
    max_in_flight: AtomicU64,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every save sleeps this long first (exercises write coalescing).
    pub fn with_save_delay(delay: Duration) -> Self {
        let cache = Self::default();
        *cache.save_delay.lock() = Some(delay);
        cache
    }

    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Successful saves so far.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }

    /// Highest number of saves ever running at once.
    pub fn max_concurrent_saves(&self) -> u64 {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self, doc_id: Uuid) -> Option<Vec<u8>> {
        self.snapshots.lock().get(&doc_id).cloned()
    }

    pub fn insert(&self, doc_id: Uuid, snapshot: Vec<u8>) {
        self.snapshots.lock().insert(doc_id, snapshot);
    }
}

#[async_trait]
impl PersistenceCache for MemoryCache {
    async fn load(&self, doc_id: Uuid) -> Result<Option<Vec<u8>>, PersistenceError> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("injected load failure".into()));
        }
        Ok(self.snapshot(doc_id))
    }

    async fn save(&self, doc_id: Uuid, snapshot: &[u8]) -> Result<(), PersistenceError> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        let delay = *self.save_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let result = if self.fail_saves.load(Ordering::SeqCst) {
            Err(PersistenceError::Unavailable("injected save failure".into()))
        } else {
            self.snapshots.lock().insert(doc_id, snapshot.to_vec());
            self.saves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreConfig;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_memory_cache_roundtrip() {
        let cache = MemoryCache::new();
        let doc = Uuid::new_v4();
        assert_eq!(cache.load(doc).await.unwrap(), None);

        cache.save(doc, b"state").await.unwrap();
        assert_eq!(cache.load(doc).await.unwrap(), Some(b"state".to_vec()));
        assert_eq!(cache.save_count(), 1);
    }

    #[tokio::test]
    async fn test_memory_cache_fault_injection() {
        let cache = MemoryCache::new();
        let doc = Uuid::new_v4();

        cache.set_fail_saves(true);
        assert!(cache.save(doc, b"lost").await.is_err());
        assert_eq!(cache.snapshot(doc), None);

        cache.set_fail_loads(true);
        assert!(matches!(
            cache.load(doc).await,
            Err(PersistenceError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_rocks_cache_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap());
        let cache = RocksCache::new(store.clone());
        let doc = Uuid::new_v4();

        assert_eq!(cache.load(doc).await.unwrap(), None);
        cache.save(doc, b"rocks state").await.unwrap();
        assert_eq!(cache.load(doc).await.unwrap(), Some(b"rocks state".to_vec()));
        assert_eq!(store.load_metadata(doc).unwrap().saves, 1);
    }
}
