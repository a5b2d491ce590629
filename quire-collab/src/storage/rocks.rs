//! RocksDB-backed storage for session snapshots and the relay log.
//!
//! ```text
//!   documents   doc_id            → LZ4(snapshot)
//!   metadata    doc_id            → bincode(DocumentMetadata)
//!   log         doc_id ‖ seq(BE)  → LZ4(bincode(RemoteDelta))
//! ```
//!
//! Log keys sort by document and then by sequence number, so replay and
//! pruning are plain forward range scans. All column families share one
//! block cache.

use crate::protocol::RemoteDelta;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use uuid::Uuid;

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";
const CF_LOG: &str = "log";

const LOG_KEY_LEN: usize = 24;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
    /// Shared block cache, in bytes.
    pub block_cache_size: usize,
    /// Memtable size per column family, in bytes.
    pub write_buffer_size: usize,
    /// fsync every relay log write. Snapshots are never fsynced: a lost
    /// snapshot is rebuilt from the log on the next session.
    pub durable_log: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("quire_data"),
            block_cache_size: 64 << 20,
            write_buffer_size: 16 << 20,
            durable_log: true,
        }
    }
}

impl StoreConfig {
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 << 20,
            write_buffer_size: 1 << 20,
            durable_log: false,
        }
    }
}

/// Bookkeeping stored next to each snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub doc_id: Uuid,
    /// Number of snapshot writes so far
    pub saves: u64,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(doc_id: Uuid) -> Self {
        let now = unix_secs();
        Self {
            doc_id,
            saves: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    NotFound(Uuid),
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Document not found: {id}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// RocksDB-backed store for document snapshots and relay log entries.
///
/// Blocking; async callers go through `spawn_blocking` (see
/// [`crate::persistence::RocksCache`]).
pub struct DocumentStore {
    db: DBWithThreadMode<SingleThreaded>,
    path: PathBuf,
    durable_log: bool,
}

impl DocumentStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cache = Cache::new_lru_cache(config.block_cache_size);
        let families = vec![
            ColumnFamilyDescriptor::new(CF_DOCUMENTS, snapshot_options(&cache, &config)),
            ColumnFamilyDescriptor::new(CF_METADATA, metadata_options(&cache, &config)),
            ColumnFamilyDescriptor::new(CF_LOG, log_options(&cache, &config)),
        ];
        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(&db_opts, &config.path, families)?;
        log::info!("Opened document store at {}", config.path.display());

        Ok(Self {
            db,
            path: config.path,
            durable_log: config.durable_log,
        })
    }

    fn log_write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.durable_log);
        opts
    }

    // ─── Snapshots ────────────────────────────────────────────────────

    /// Replace the snapshot of a document (LZ4 compressed).
    pub fn save_snapshot(&self, doc_id: Uuid, snapshot: &[u8]) -> Result<DocumentMetadata, StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(snapshot);

        let mut meta = match self.load_metadata(doc_id) {
            Ok(meta) => meta,
            Err(StoreError::NotFound(_)) => DocumentMetadata::new(doc_id),
            Err(e) => return Err(e),
        };
        meta.saves += 1;
        meta.snapshot_size = snapshot.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = unix_secs();

        // Snapshot and metadata land together
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_docs, doc_id.as_bytes(), &compressed);
        batch.put_cf(&cf_meta, doc_id.as_bytes(), meta.encode()?);
        self.db.write(batch)?;

        Ok(meta)
    }

    /// Load a snapshot, `Ok(None)` if the document was never saved.
    pub fn load_snapshot(&self, doc_id: Uuid) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(&cf, doc_id.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| StoreError::CompressionError(e.to_string())),
            None => Ok(None),
        }
    }

    pub fn document_exists(&self, doc_id: Uuid) -> Result<bool, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        Ok(self.db.get_cf(&cf, doc_id.as_bytes())?.is_some())
    }

    pub fn load_metadata(&self, doc_id: Uuid) -> Result<DocumentMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, doc_id.as_bytes())? {
            Some(bytes) => DocumentMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(doc_id)),
        }
    }

    /// All documents with a stored snapshot.
    pub fn list_documents(&self) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut doc_ids = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            if let Some(id) = uuid_prefix(&key) {
                doc_ids.push(id);
            }
        }
        Ok(doc_ids)
    }

    /// Delete a document's snapshot, metadata and log entries.
    pub fn delete_document(&self, doc_id: Uuid) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_docs, doc_id.as_bytes());
        batch.delete_cf(&cf_meta, doc_id.as_bytes());
        self.delete_log_range(&mut batch, doc_id, u64::MAX)?;

        self.db.write_opt(batch, &self.log_write_opts())?;
        Ok(())
    }

    // ─── Relay log ────────────────────────────────────────────────────

    /// Persist one log entry.
    ///
    /// Key: `<doc_id:16><seq:8 BE>`; value: LZ4(bincode(entry)).
    pub fn append_log_entry(&self, doc_id: Uuid, entry: &RemoteDelta) -> Result<(), StoreError> {
        let cf = self.cf(CF_LOG)?;
        let encoded = bincode::serde::encode_to_vec(entry, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&encoded);
        self.db
            .put_cf_opt(&cf, log_key(doc_id, entry.seq), compressed, &self.log_write_opts())?;
        Ok(())
    }

    /// Log entries of a document with `seq >= since_seq`, ascending.
    pub fn load_log(&self, doc_id: Uuid, since_seq: u64) -> Result<Vec<RemoteDelta>, StoreError> {
        let cf = self.cf(CF_LOG)?;
        let start = log_key(doc_id, since_seq);

        let mut entries = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward)) {
            let (key, value) = item?;
            if key.len() != LOG_KEY_LEN || &key[..16] != doc_id.as_bytes() {
                break;
            }
            let decompressed = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::CompressionError(e.to_string()))?;
            let (entry, _): (RemoteDelta, usize) =
                bincode::serde::decode_from_slice(&decompressed, bincode::config::standard())
                    .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Drop log entries with `seq < below_seq`. Returns how many were removed.
    pub fn prune_log(&self, doc_id: Uuid, below_seq: u64) -> Result<u64, StoreError> {
        let mut batch = WriteBatch::default();
        let removed = self.delete_log_range(&mut batch, doc_id, below_seq)?;
        if removed > 0 {
            self.db.write_opt(batch, &self.log_write_opts())?;
        }
        Ok(removed)
    }

    /// Documents that have at least one log entry.
    pub fn log_documents(&self) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(CF_LOG)?;
        let mut doc_ids: Vec<Uuid> = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            if let Some(id) = uuid_prefix(&key) {
                if doc_ids.last() != Some(&id) {
                    doc_ids.push(id);
                }
            }
        }
        Ok(doc_ids)
    }

    fn delete_log_range(
        &self,
        batch: &mut WriteBatch,
        doc_id: Uuid,
        below_seq: u64,
    ) -> Result<u64, StoreError> {
        let cf = self.cf(CF_LOG)?;
        let start = log_key(doc_id, 0);
        let end = log_key(doc_id, below_seq);

        let mut count = 0u64;
        for item in self.db.iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward)) {
            let (key, _) = item?;
            if key.len() != LOG_KEY_LEN || &key[..16] != doc_id.as_bytes() {
                break;
            }
            if key.as_ref() >= end.as_slice() {
                break;
            }
            batch.delete_cf(&cf, &key);
            count += 1;
        }
        Ok(count)
    }

    /// Flush memtables of every column family to SST files.
    pub fn flush(&self) -> Result<(), StoreError> {
        for name in [CF_DOCUMENTS, CF_METADATA, CF_LOG] {
            self.db.flush_cf(self.cf(name)?)?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

}

// ─── Column family tuning ─────────────────────────────────────────────

fn table_options(cache: &Cache, point_lookups: bool) -> BlockBasedOptions {
    let mut table = BlockBasedOptions::default();
    table.set_block_cache(cache);
    if point_lookups {
        table.set_bloom_filter(10.0, false);
    }
    table
}

/// Values are already LZ4 framed; reads are by doc_id only.
fn snapshot_options(cache: &Cache, config: &StoreConfig) -> Options {
    let mut opts = Options::default();
    opts.set_block_based_table_factory(&table_options(cache, true));
    opts.set_compression_type(DBCompressionType::None);
    opts.set_write_buffer_size(config.write_buffer_size);
    opts
}

fn metadata_options(cache: &Cache, config: &StoreConfig) -> Options {
    let mut opts = Options::default();
    opts.set_block_based_table_factory(&table_options(cache, true));
    opts.set_compression_type(DBCompressionType::Lz4);
    opts.set_write_buffer_size(config.write_buffer_size / 4);
    opts
}

/// Many small appends, read back with range scans.
fn log_options(cache: &Cache, config: &StoreConfig) -> Options {
    let mut opts = Options::default();
    opts.set_block_based_table_factory(&table_options(cache, false));
    opts.set_compression_type(DBCompressionType::None);
    opts.set_write_buffer_size(config.write_buffer_size);
    opts.set_max_write_buffer_number(4);
    opts
}

fn log_key(doc_id: Uuid, seq: u64) -> [u8; LOG_KEY_LEN] {
    let mut key = [0u8; LOG_KEY_LEN];
    key[..16].copy_from_slice(doc_id.as_bytes());
    key[16..].copy_from_slice(&seq.to_be_bytes());
    key
}

fn uuid_prefix(key: &[u8]) -> Option<Uuid> {
    let bytes: [u8; 16] = key.get(..16)?.try_into().ok()?;
    Some(Uuid::from_bytes(bytes))
}

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DeltaKind;
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, DocumentStore) {
        let dir = TempDir::new().unwrap();
        let store = DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        (dir, store)
    }

    fn entry(seq: u64, payload: &[u8]) -> RemoteDelta {
        RemoteDelta {
            seq,
            timestamp_ms: 1_700_000_000_000 + seq,
            participant_id: Uuid::nil(),
            kind: DeltaKind::Update,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn test_snapshot_save_load() {
        let (_dir, store) = open_temp();
        let doc_id = Uuid::new_v4();
        let data = b"Merged document state with enough bytes to be worth compressing.".to_vec();

        let meta = store.save_snapshot(doc_id, &data).unwrap();
        assert_eq!(meta.doc_id, doc_id);
        assert_eq!(meta.saves, 1);
        assert_eq!(meta.snapshot_size, data.len() as u64);

        assert_eq!(store.load_snapshot(doc_id).unwrap(), Some(data));
        assert_eq!(store.load_snapshot(Uuid::new_v4()).unwrap(), None);
    }

    #[test]
    fn test_snapshot_overwrite_updates_metadata() {
        let (_dir, store) = open_temp();
        let doc_id = Uuid::new_v4();
        store.save_snapshot(doc_id, b"first").unwrap();
        store.save_snapshot(doc_id, b"second, longer").unwrap();

        let meta = store.load_metadata(doc_id).unwrap();
        assert_eq!(meta.saves, 2);
        assert_eq!(meta.snapshot_size, 14);
        assert!(meta.updated_at >= meta.created_at);
        assert_eq!(store.load_snapshot(doc_id).unwrap().unwrap(), b"second, longer");
    }

    #[test]
    fn test_snapshot_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let doc_id = Uuid::new_v4();
        {
            let store = DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap();
            store.save_snapshot(doc_id, b"durable").unwrap();
            store.flush().unwrap();
        }
        let store = DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        assert_eq!(store.load_snapshot(doc_id).unwrap().unwrap(), b"durable");
        assert!(store.document_exists(doc_id).unwrap());
    }

    #[test]
    fn test_durable_log_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig {
            durable_log: true,
            ..StoreConfig::for_testing(dir.path())
        };
        let doc_id = Uuid::new_v4();
        {
            let store = DocumentStore::open(config.clone()).unwrap();
            for seq in 1..=3 {
                store.append_log_entry(doc_id, &entry(seq, b"fsynced")).unwrap();
            }
        }
        let store = DocumentStore::open(config).unwrap();
        let entries = store.load_log(doc_id, 0).unwrap();
        assert_eq!(entries.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(store.path(), dir.path());
    }

    #[test]
    fn test_list_and_delete_documents() {
        let (_dir, store) = open_temp();
        let ids: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            store.save_snapshot(*id, b"x").unwrap();
            store.append_log_entry(*id, &entry(1, b"d")).unwrap();
        }

        let listed = store.list_documents().unwrap();
        assert_eq!(listed.len(), 4);
        assert!(ids.iter().all(|id| listed.contains(id)));

        store.delete_document(ids[0]).unwrap();
        assert!(!store.document_exists(ids[0]).unwrap());
        assert_eq!(store.load_snapshot(ids[0]).unwrap(), None);
        assert!(store.load_log(ids[0], 0).unwrap().is_empty());
        assert_eq!(store.list_documents().unwrap().len(), 3);
    }

    #[test]
    fn test_log_append_load_in_order() {
        let (_dir, store) = open_temp();
        let doc_id = Uuid::new_v4();
        let other = Uuid::new_v4();
        for seq in 1..=10 {
            store.append_log_entry(doc_id, &entry(seq, format!("d{seq}").as_bytes())).unwrap();
        }
        store.append_log_entry(other, &entry(1, b"other")).unwrap();

        let all = store.load_log(doc_id, 0).unwrap();
        assert_eq!(all.len(), 10);
        assert_eq!(all[0].seq, 1);
        assert_eq!(all[9].payload, b"d10");

        let since = store.load_log(doc_id, 6).unwrap();
        assert_eq!(since.len(), 5);
        assert_eq!(since[0].seq, 6);

        let mut docs = store.log_documents().unwrap();
        docs.sort();
        let mut expected = vec![doc_id, other];
        expected.sort();
        assert_eq!(docs, expected);
    }

    #[test]
    fn test_log_prune() {
        let (_dir, store) = open_temp();
        let doc_id = Uuid::new_v4();
        for seq in 1..=20 {
            store.append_log_entry(doc_id, &entry(seq, &[seq as u8; 32])).unwrap();
        }

        assert_eq!(store.prune_log(doc_id, 11).unwrap(), 10);
        let remaining = store.load_log(doc_id, 0).unwrap();
        assert_eq!(remaining.len(), 10);
        assert_eq!(remaining[0].seq, 11);
        assert_eq!(store.prune_log(doc_id, 11).unwrap(), 0);
    }

    #[test]
    fn test_compression_ratio() {
        let (_dir, store) = open_temp();
        let doc_id = Uuid::new_v4();

        let mut data = Vec::with_capacity(10_000);
        for i in 0..1000u16 {
            data.extend_from_slice(&[0u8; 6]);
            data.extend_from_slice(&i.to_le_bytes());
            data.extend_from_slice(b"tx");
        }

        let meta = store.save_snapshot(doc_id, &data).unwrap();
        let ratio = meta.snapshot_size as f64 / meta.compressed_size as f64;
        assert!(ratio > 2.0, "Compression ratio {ratio:.1}x too low (expected >2x)");
    }
}
