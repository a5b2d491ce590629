//! Integration tests for the local persistence cache behind a session.
//!
//! Sessions are destroyed and reopened against the same cache to check that
//! the merged state survives without any help from the update log.

use quire_collab::awareness::MemoryPresenceHub;
use quire_collab::channel::MemoryLog;
use quire_collab::controller::{open_session, SessionDeps, SessionHandle, SyncConfig, SyncState};
use quire_collab::persistence::{MemoryCache, PersistenceCache, RocksCache};
use quire_collab::storage::{DocumentStore, StoreConfig};
use quire_core::{DocumentModel, Participant};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::time::{sleep, timeout, Duration};
use uuid::Uuid;

async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    let waited = timeout(Duration::from_secs(5), async {
        while !cond() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

fn deps(log: &Arc<MemoryLog>, cache: Arc<dyn PersistenceCache>) -> SessionDeps {
    SessionDeps {
        channel: log.clone(),
        cache,
        presence: Arc::new(MemoryPresenceHub::default()),
    }
}

fn offline_log() -> Arc<MemoryLog> {
    let log = Arc::new(MemoryLog::default());
    log.set_available(false);
    log
}

async fn open(doc: Uuid, deps: SessionDeps) -> SessionHandle {
    open_session(doc, Participant::new("alice", "Alice"), deps, SyncConfig::for_testing()).await
}

#[tokio::test]
async fn test_offline_durability_from_cache_only() {
    let cache = Arc::new(MemoryCache::new());
    let doc = Uuid::new_v4();

    let (text, runs, sv) = {
        let session = open(doc, deps(&offline_log(), cache.clone())).await;
        session.insert(0, "draft written offline").unwrap();
        session.format(0, 5, "bold").unwrap();
        let model = session.model();
        let snapshot = {
            let m = model.lock();
            (m.text(), m.formatted_runs(), m.state_vector())
        };
        session.destroy().await;
        snapshot
    };

    // Reopen with the log still unreachable: everything comes from the cache
    let reopened = open(doc, deps(&offline_log(), cache.clone())).await;
    assert_eq!(reopened.text(), text);
    assert_eq!(reopened.formatted_runs(), runs);
    assert_eq!(reopened.model().lock().state_vector(), sv);
    assert!(reopened.persistence_enabled());
    reopened.destroy().await;
}

#[tokio::test]
async fn test_restored_offline_edits_reach_the_log() {
    let cache = Arc::new(MemoryCache::new());
    let doc = Uuid::new_v4();

    {
        let session = open(doc, deps(&offline_log(), cache.clone())).await;
        session.insert(0, "never appended").unwrap();
        session.destroy().await;
    }

    // Next session starts online; the restored state goes out as a checkpoint
    let log = Arc::new(MemoryLog::default());
    let session = open(doc, deps(&log, cache.clone())).await;
    wait_until("checkpoint of restored state", || session.stats().checkpoints_appended == 1).await;

    let mut fresh = DocumentModel::new();
    for entry in log.entries(doc) {
        fresh.apply_delta(&entry.payload, quire_core::Origin::Remote).unwrap();
    }
    assert_eq!(fresh.text(), "never appended");
    session.destroy().await;
}

#[tokio::test]
async fn test_writes_are_coalesced() {
    let cache = Arc::new(MemoryCache::with_save_delay(Duration::from_millis(20)));
    let doc = Uuid::new_v4();
    let session = open(doc, deps(&offline_log(), cache.clone())).await;

    for i in 0..50u32 {
        session.insert(i, "k").unwrap();
        sleep(Duration::from_millis(1)).await;
    }
    let final_state = session.model().lock().encode_full_state();
    session.destroy().await;

    assert_eq!(cache.max_concurrent_saves(), 1);
    assert!(cache.save_count() < 50, "saves were not coalesced: {}", cache.save_count());

    let mut restored = DocumentModel::new();
    restored.apply_snapshot(&cache.snapshot(doc).unwrap()).unwrap();
    let mut expected = DocumentModel::new();
    expected.apply_snapshot(&final_state).unwrap();
    assert_eq!(restored.text(), expected.text());
    assert_eq!(restored.state_vector(), expected.state_vector());
}

#[tokio::test]
async fn test_remote_changes_are_persisted_too() {
    let cache = Arc::new(MemoryCache::new());
    let log = Arc::new(MemoryLog::default());
    let doc = Uuid::new_v4();

    let writer = open(doc, deps(&log, Arc::new(MemoryCache::new()))).await;
    let reader = open(doc, deps(&log, cache.clone())).await;
    let mut state = reader.watch_state();
    timeout(Duration::from_secs(5), state.wait_for(|s| *s == SyncState::Live))
        .await
        .unwrap()
        .unwrap();

    writer.insert(0, "from elsewhere").unwrap();
    wait_until("reader to persist the remote edit", || {
        cache
            .snapshot(doc)
            .map(|bytes| {
                let mut m = DocumentModel::new();
                m.apply_snapshot(&bytes).is_ok() && m.text() == "from elsewhere"
            })
            .unwrap_or(false)
    })
    .await;

    writer.destroy().await;
    reader.destroy().await;
}

#[tokio::test]
async fn test_load_failure_falls_back_to_memory() {
    let cache = Arc::new(MemoryCache::new());
    cache.set_fail_loads(true);
    let doc = Uuid::new_v4();

    let session = open(doc, deps(&offline_log(), cache.clone())).await;
    assert!(!session.persistence_enabled());
    session.insert(0, "memory only").unwrap();
    assert_eq!(session.text(), "memory only");
    session.destroy().await;

    assert_eq!(cache.save_count(), 0);
    assert!(cache.snapshot(doc).is_none());
}

#[tokio::test]
async fn test_save_failure_keeps_session_editable() {
    let cache = Arc::new(MemoryCache::new());
    cache.set_fail_saves(true);
    let doc = Uuid::new_v4();

    let session = open(doc, deps(&offline_log(), cache.clone())).await;
    session.insert(0, "still editing").unwrap();
    wait_until("failed save to be counted", || session.stats().persistence_failures >= 1).await;

    session.insert(13, "!").unwrap();
    assert_eq!(session.text(), "still editing!");
    session.destroy().await;
}

#[tokio::test]
async fn test_rocks_cache_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let doc = Uuid::new_v4();

    {
        let store = Arc::new(DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap());
        let session = open(doc, deps(&offline_log(), Arc::new(RocksCache::new(store)))).await;
        session.insert(0, "on disk").unwrap();
        session.format(3, 4, "underline").unwrap();
        session.destroy().await;
    }

    let store = Arc::new(DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap());
    assert!(store.document_exists(doc).unwrap());
    let session = open(doc, deps(&offline_log(), Arc::new(RocksCache::new(store)))).await;
    assert_eq!(session.text(), "on disk");
    let runs = session.formatted_runs();
    assert_eq!(runs.last().map(|r| r.text.as_str()), Some("disk"));
    assert_eq!(runs.last().map(|r| r.attributes.clone()), Some(vec!["underline".to_string()]));
    session.destroy().await;
}
