//! Durable local cache of replica state.
//!
//! Column families:
//! - `snapshots` — Full replica state per document (LZ4 compressed)
//! - `updates`   — Incremental updates since the snapshot (LZ4 compressed,
//!                 keyed by `<doc_id:16><seq:8 BE>`)
//! - `meta`      — Per-document bookkeeping (bincode)
//!
//! Edits land here before any transport connects, so a session reopened
//! after a crash or an offline period starts from everything the user typed.
//!
//! ```text
//! local edit ──► record(update) ──► updates CF
//!                                      │ needs_compaction()
//!                                      ▼
//!                 compact(state) ──► snapshots CF (updates dropped, one batch)
//! ```
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::error::CacheError;
use crate::lock;
use crate::replica::ReplicatedText;

const CF_SNAPSHOTS: &str = "snapshots";
const CF_UPDATES: &str = "updates";
const CF_META: &str = "meta";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_UPDATES, CF_META];

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 32MB)
    pub block_cache_size: usize,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 128)
    pub max_open_files: i32,
    /// Pending updates per document before a snapshot is due (default: 100)
    pub compaction_threshold: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("quire_cache"),
            block_cache_size: 32 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 128,
            compaction_threshold: 100,
        }
    }
}

impl CacheConfig {
    /// Create config for testing (small caches, low compaction threshold).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 64,
            compaction_threshold: 8,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CacheMeta {
    /// Sequence number for the next update
    next_seq: u64,
    /// Updates stored since the last snapshot
    pending: u64,
    /// Some cached edit has not been delivered to a peer yet
    unsynced: bool,
}

impl CacheMeta {
    fn encode(&self) -> Result<Vec<u8>, CacheError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CacheError::Corrupt(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, CacheError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| CacheError::Corrupt(e.to_string()))?;
        Ok(meta)
    }
}

/// Everything the cache holds for one document.
#[derive(Debug, Clone, Default)]
pub struct CachedDocument {
    pub snapshot: Option<Vec<u8>>,
    /// Updates after the snapshot, in write order
    pub updates: Vec<Vec<u8>>,
    pub unsynced: bool,
}

impl CachedDocument {
    pub fn is_empty(&self) -> bool {
        self.snapshot.is_none() && self.updates.is_empty()
    }
}

/// One RocksDB instance shared by every document of a process.
pub struct CacheStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: CacheConfig,
    /// Serializes meta read-modify-write.
    write_lock: Mutex<()>,
}

impl CacheStore {
    pub fn open(config: CacheConfig) -> Result<Self, CacheError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened local cache at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &CacheConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        opts.set_block_based_table_factory(&block_opts);

        // Payloads are already LZ4 framed
        opts.set_compression_type(DBCompressionType::None);

        match name {
            CF_UPDATES => {
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            CF_SNAPSHOTS | CF_META => {
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Reads ────────────────────────────────────────────────────────

    /// Snapshot plus the updates written after it.
    pub fn load(&self, doc_id: Uuid) -> Result<CachedDocument, CacheError> {
        let snapshot = match self.db.get_cf(self.cf(CF_SNAPSHOTS)?, doc_id.as_bytes())? {
            Some(compressed) => Some(decompress(&compressed)?),
            None => None,
        };

        let cf = self.cf(CF_UPDATES)?;
        let start = update_key(doc_id, 0);
        let mut updates = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::From(&start, Direction::Forward)) {
            let (key, value) = item?;
            if key.len() != 24 || &key[..16] != doc_id.as_bytes() {
                break;
            }
            updates.push(decompress(&value)?);
        }

        let unsynced = self.load_meta(doc_id)?.is_some_and(|m| m.unsynced);
        Ok(CachedDocument {
            snapshot,
            updates,
            unsynced,
        })
    }

    pub fn has_unsynced(&self, doc_id: Uuid) -> Result<bool, CacheError> {
        Ok(self.load_meta(doc_id)?.is_some_and(|m| m.unsynced))
    }

    /// Updates stored since the last snapshot.
    pub fn pending_updates(&self, doc_id: Uuid) -> Result<u64, CacheError> {
        Ok(self.load_meta(doc_id)?.map_or(0, |m| m.pending))
    }

    /// Every document with cached state.
    pub fn documents(&self) -> Result<Vec<Uuid>, CacheError> {
        let cf = self.cf(CF_META)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let id = Uuid::from_slice(&key)
                .map_err(|e| CacheError::Corrupt(format!("Invalid document key: {e}")))?;
            ids.push(id);
        }
        Ok(ids)
    }

    // ─── Writes ───────────────────────────────────────────────────────

    /// Append an update. Returns the number of updates pending compaction.
    pub fn append_update(&self, doc_id: Uuid, update: &[u8], unsynced: bool) -> Result<u64, CacheError> {
        let cf_updates = self.cf(CF_UPDATES)?;
        let cf_meta = self.cf(CF_META)?;

        let _guard = lock(&self.write_lock);
        let mut meta = self.load_meta(doc_id)?.unwrap_or_default();
        let key = update_key(doc_id, meta.next_seq);
        meta.next_seq += 1;
        meta.pending += 1;
        meta.unsynced |= unsynced;

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_updates, key, lz4_flex::compress_prepend_size(update));
        batch.put_cf(cf_meta, doc_id.as_bytes(), meta.encode()?);
        self.write(batch)?;

        Ok(meta.pending)
    }

    /// Everything cached for the document has reached a peer.
    pub fn mark_synced(&self, doc_id: Uuid) -> Result<(), CacheError> {
        let cf_meta = self.cf(CF_META)?;
        let _guard = lock(&self.write_lock);
        let Some(mut meta) = self.load_meta(doc_id)? else {
            return Ok(());
        };
        if !meta.unsynced {
            return Ok(());
        }
        meta.unsynced = false;

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_meta, doc_id.as_bytes(), meta.encode()?);
        self.write(batch)
    }

    /// Replace the snapshot and drop the updates it covers, in one batch.
    pub fn save_snapshot(&self, doc_id: Uuid, state: &[u8]) -> Result<(), CacheError> {
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_META)?;

        let _guard = lock(&self.write_lock);
        let mut meta = self.load_meta(doc_id)?.unwrap_or_default();
        let mut batch = WriteBatch::default();
        let dropped = self.delete_updates(&mut batch, doc_id)?;
        meta.pending = 0;

        batch.put_cf(cf_snapshots, doc_id.as_bytes(), lz4_flex::compress_prepend_size(state));
        batch.put_cf(cf_meta, doc_id.as_bytes(), meta.encode()?);
        self.write(batch)?;

        log::debug!(
            "Compacted cache for {doc_id}: {dropped} updates folded into {} byte snapshot",
            state.len()
        );
        Ok(())
    }

    /// Remove every trace of a document.
    pub fn delete_document(&self, doc_id: Uuid) -> Result<(), CacheError> {
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_META)?;

        let _guard = lock(&self.write_lock);
        let mut batch = WriteBatch::default();
        self.delete_updates(&mut batch, doc_id)?;
        batch.delete_cf(cf_snapshots, doc_id.as_bytes());
        batch.delete_cf(cf_meta, doc_id.as_bytes());
        self.write(batch)
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn load_meta(&self, doc_id: Uuid) -> Result<Option<CacheMeta>, CacheError> {
        match self.db.get_cf(self.cf(CF_META)?, doc_id.as_bytes())? {
            Some(bytes) => Ok(Some(CacheMeta::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn delete_updates(&self, batch: &mut WriteBatch, doc_id: Uuid) -> Result<u64, CacheError> {
        let cf = self.cf(CF_UPDATES)?;
        let start = update_key(doc_id, 0);
        let mut count = 0;
        for item in self.db.iterator_cf(cf, IteratorMode::From(&start, Direction::Forward)) {
            let (key, _) = item?;
            if key.len() != 24 || &key[..16] != doc_id.as_bytes() {
                break;
            }
            batch.delete_cf(cf, &key);
            count += 1;
        }
        Ok(count)
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, CacheError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| CacheError::Database(format!("Column family '{name}' not found")))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), CacheError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }
}

fn update_key(doc_id: Uuid, seq: u64) -> [u8; 24] {
    let mut key = [0u8; 24];
    key[..16].copy_from_slice(doc_id.as_bytes());
    key[16..].copy_from_slice(&seq.to_be_bytes());
    key
}

fn decompress(bytes: &[u8]) -> Result<Vec<u8>, CacheError> {
    lz4_flex::decompress_size_prepended(bytes).map_err(|e| CacheError::Corrupt(e.to_string()))
}

// ───────────────────────────────────────────────────────────────────
// Per-document handle
// ───────────────────────────────────────────────────────────────────

/// What `reconcile_into` found in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconcileOutcome {
    /// A snapshot or at least one update was applied
    pub restored: bool,
    /// Cached edits never reached a peer
    pub unsynced: bool,
    pub updates: usize,
}

/// The cache as seen by one session.
pub struct LocalCache {
    store: Arc<CacheStore>,
    doc_id: Uuid,
    destroyed: AtomicBool,
}

impl LocalCache {
    pub fn attach(store: Arc<CacheStore>, doc_id: Uuid) -> Self {
        Self {
            store,
            doc_id,
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    fn ensure_attached(&self) -> Result<(), CacheError> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(CacheError::Destroyed(self.doc_id));
        }
        Ok(())
    }

    /// Apply the cached snapshot and updates to `replica`.
    pub fn reconcile_into(&self, replica: &ReplicatedText) -> Result<ReconcileOutcome, CacheError> {
        self.ensure_attached()?;
        let cached = self.store.load(self.doc_id)?;
        if cached.is_empty() {
            return Ok(ReconcileOutcome::default());
        }

        if let Some(snapshot) = &cached.snapshot {
            replica.apply_remote(snapshot)?;
        }
        for update in &cached.updates {
            replica.apply_remote(update)?;
        }

        log::info!(
            "Reconciled {} cached updates into {} (unsynced: {})",
            cached.updates.len(),
            self.doc_id,
            cached.unsynced
        );
        Ok(ReconcileOutcome {
            restored: true,
            unsynced: cached.unsynced,
            updates: cached.updates.len(),
        })
    }

    /// Persist an update. `unsynced` marks edits that have not reached a peer.
    pub fn record(&self, update: &[u8], unsynced: bool) -> Result<(), CacheError> {
        self.ensure_attached()?;
        self.store.append_update(self.doc_id, update, unsynced)?;
        Ok(())
    }

    pub fn mark_synced(&self) -> Result<(), CacheError> {
        self.ensure_attached()?;
        self.store.mark_synced(self.doc_id)
    }

    pub fn has_unsynced(&self) -> Result<bool, CacheError> {
        self.ensure_attached()?;
        self.store.has_unsynced(self.doc_id)
    }

    pub fn needs_compaction(&self) -> Result<bool, CacheError> {
        self.ensure_attached()?;
        let pending = self.store.pending_updates(self.doc_id)?;
        Ok(pending >= self.store.config().compaction_threshold)
    }

    /// Fold every pending update into a snapshot of `state`.
    pub fn compact(&self, state: &[u8]) -> Result<(), CacheError> {
        self.ensure_attached()?;
        self.store.save_snapshot(self.doc_id, state)
    }

    /// Write a final snapshot and detach. Later calls are no-ops.
    pub fn destroy(&self, state: &[u8]) -> Result<(), CacheError> {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.store.save_snapshot(self.doc_id, state)?;
        log::debug!("Detached local cache for {}", self.doc_id);
        Ok(())
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_store(dir: &Path) -> Arc<CacheStore> {
        Arc::new(CacheStore::open(CacheConfig::for_testing(dir)).unwrap())
    }

    #[test]
    fn test_empty_cache_reconciles_nothing() {
        let dir = tempdir().unwrap();
        let cache = LocalCache::attach(open_store(dir.path()), Uuid::new_v4());
        let replica = ReplicatedText::new();

        let outcome = cache.reconcile_into(&replica).unwrap();
        assert_eq!(outcome, ReconcileOutcome::default());
        assert!(replica.is_empty());
    }

    #[test]
    fn test_updates_survive_reopen() {
        let dir = tempdir().unwrap();
        let doc = Uuid::new_v4();
        {
            let cache = LocalCache::attach(open_store(dir.path()), doc);
            let replica = ReplicatedText::new();
            cache.record(&replica.insert(0, "hello").unwrap(), true).unwrap();
            cache.record(&replica.insert(5, " world").unwrap(), true).unwrap();
        }

        let cache = LocalCache::attach(open_store(dir.path()), doc);
        let replica = ReplicatedText::new();
        let outcome = cache.reconcile_into(&replica).unwrap();
        assert!(outcome.restored);
        assert!(outcome.unsynced);
        assert_eq!(outcome.updates, 2);
        assert_eq!(replica.text(), "hello world");
    }

    #[test]
    fn test_mark_synced_clears_flag() {
        let dir = tempdir().unwrap();
        let cache = LocalCache::attach(open_store(dir.path()), Uuid::new_v4());
        let replica = ReplicatedText::new();

        cache.record(&replica.insert(0, "x").unwrap(), false).unwrap();
        assert!(!cache.has_unsynced().unwrap());
        cache.record(&replica.insert(1, "y").unwrap(), true).unwrap();
        assert!(cache.has_unsynced().unwrap());
        cache.mark_synced().unwrap();
        assert!(!cache.has_unsynced().unwrap());
    }

    #[test]
    fn test_compaction_folds_updates() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        let doc = Uuid::new_v4();
        let cache = LocalCache::attach(store.clone(), doc);
        let replica = ReplicatedText::new();

        for i in 0..8 {
            cache.record(&replica.insert(i, "a").unwrap(), false).unwrap();
        }
        assert!(cache.needs_compaction().unwrap());

        cache.compact(&replica.encode_state()).unwrap();
        assert!(!cache.needs_compaction().unwrap());
        let cached = store.load(doc).unwrap();
        assert!(cached.snapshot.is_some());
        assert!(cached.updates.is_empty());

        let restored = ReplicatedText::new();
        cache.reconcile_into(&restored).unwrap();
        assert_eq!(restored.text(), "aaaaaaaa");
    }

    #[test]
    fn test_documents_are_isolated() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        let a = LocalCache::attach(store.clone(), Uuid::new_v4());
        let b = LocalCache::attach(store.clone(), Uuid::new_v4());
        let replica = ReplicatedText::new();
        a.record(&replica.insert(0, "only a").unwrap(), true).unwrap();

        let other = ReplicatedText::new();
        assert!(!b.reconcile_into(&other).unwrap().restored);
        assert!(other.is_empty());
        assert_eq!(store.documents().unwrap().len(), 1);
    }

    #[test]
    fn test_destroy_is_idempotent_and_detaches() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        let doc = Uuid::new_v4();
        let cache = LocalCache::attach(store.clone(), doc);
        let replica = ReplicatedText::new();
        cache.record(&replica.insert(0, "kept").unwrap(), true).unwrap();

        cache.destroy(&replica.encode_state()).unwrap();
        cache.destroy(&replica.encode_state()).unwrap();
        assert!(cache.is_destroyed());
        assert!(matches!(cache.record(b"x", true), Err(CacheError::Destroyed(id)) if id == doc));

        let reopened = LocalCache::attach(store, doc);
        let restored = ReplicatedText::new();
        let outcome = reopened.reconcile_into(&restored).unwrap();
        assert!(outcome.unsynced);
        assert_eq!(restored.text(), "kept");
    }

    #[test]
    fn test_delete_document() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        let doc = Uuid::new_v4();
        store.append_update(doc, b"payload", false).unwrap();
        store.delete_document(doc).unwrap();
        assert!(store.load(doc).unwrap().is_empty());
        assert!(store.documents().unwrap().is_empty());
    }
}
