//! RocksDB-backed document and version store.
//!
//! Column families:
//! - `documents`     — Document records (JSON), keyed by document id
//! - `versions`      — Version records (JSON), keyed by version id
//! - `version_index` — `<resource_type> 0x00 <resource_id:16> <version_number:8 BE>` → version id
//!
//! The index key doubles as the uniqueness constraint on
//! `(resource_id, resource_type, version_number)`: an insert whose index key
//! already exists is rejected with `StoreError::Conflict`. Check-then-write
//! sequences run under a single write lock, and each write is one atomic batch.
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{DocumentStore, VersionStore};
use crate::document::{Document, NewDocument};
use crate::error::StoreError;
use crate::version::{NewVersion, Version};

const CF_DOCUMENTS: &str = "documents";
const CF_VERSIONS: &str = "versions";
const CF_VERSION_INDEX: &str = "version_index";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_VERSIONS, CF_VERSION_INDEX];

/// Backend configuration.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: true — saves are user-visible)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("quire_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 256,
        }
    }
}

impl BackendConfig {
    /// Create config for testing (small caches, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

/// Durable backend for documents and their versions.
pub struct RocksBackend {
    db: DBWithThreadMode<SingleThreaded>,
    config: BackendConfig,
    /// Serializes read-modify-write sequences.
    write_lock: Mutex<()>,
}

impl RocksBackend {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: BackendConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened version store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &BackendConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_compression_type(DBCompressionType::Lz4);

        match name {
            CF_DOCUMENTS | CF_VERSIONS => {
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_VERSION_INDEX => {
                // Tiny values, range-scanned per resource
                opts.set_compression_type(DBCompressionType::None);
            }
            _ => {}
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    // ─── Documents ────────────────────────────────────────────────────

    fn load_document(&self, id: Uuid) -> Result<Document, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(cf, id.as_bytes())? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Err(StoreError::NotFound(id)),
        }
    }

    fn write_document(&self, document: &Document) -> Result<(), StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(cf, document.id.as_bytes(), serde_json::to_vec(document)?);
        self.write(batch)
    }

    fn update_document_locked(
        &self,
        id: Uuid,
        content: String,
        updated_by: &str,
    ) -> Result<Document, StoreError> {
        let _guard = self.lock()?;
        let mut document = self.load_document(id)?;
        document.apply_update(content, updated_by);
        self.write_document(&document)?;
        Ok(document)
    }

    fn all_documents(&self) -> Result<Vec<Document>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let mut documents = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            documents.push(serde_json::from_slice(&value)?);
        }
        Ok(documents)
    }

    // ─── Versions ─────────────────────────────────────────────────────

    fn load_version(&self, id: Uuid) -> Result<Version, StoreError> {
        let cf = self.cf(CF_VERSIONS)?;
        match self.db.get_cf(cf, id.as_bytes())? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Err(StoreError::NotFound(id)),
        }
    }

    fn insert_version_locked(&self, new: NewVersion) -> Result<Version, StoreError> {
        let cf_versions = self.cf(CF_VERSIONS)?;
        let cf_index = self.cf(CF_VERSION_INDEX)?;
        let index_key = Self::index_key(&new.resource_type, new.resource_id, new.version_number);

        let _guard = self.lock()?;
        if self.db.get_cf(cf_index, &index_key)?.is_some() {
            return Err(StoreError::Conflict {
                resource_id: new.resource_id,
                resource_type: new.resource_type,
                version_number: new.version_number,
            });
        }

        let version = new.into_version();
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_versions, version.id.as_bytes(), serde_json::to_vec(&version)?);
        batch.put_cf(cf_index, &index_key, version.id.as_bytes());
        self.write(batch)?;

        Ok(version)
    }

    fn set_tags_locked(&self, id: Uuid, tags: BTreeSet<String>) -> Result<Version, StoreError> {
        let cf = self.cf(CF_VERSIONS)?;
        let _guard = self.lock()?;
        let mut version = self.load_version(id)?;
        version.tags = tags;

        let mut batch = WriteBatch::default();
        batch.put_cf(cf, version.id.as_bytes(), serde_json::to_vec(&version)?);
        self.write(batch)?;
        Ok(version)
    }

    /// Version ids of a resource, highest number first.
    fn indexed_ids_desc(
        &self,
        resource_id: Uuid,
        resource_type: &str,
        limit: Option<usize>,
    ) -> Result<Vec<(u64, Uuid)>, StoreError> {
        let cf = self.cf(CF_VERSION_INDEX)?;
        let prefix = Self::index_prefix(resource_type, resource_id);
        let end_key = Self::index_key(resource_type, resource_id, u64::MAX);

        let mut ids = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&end_key, Direction::Reverse));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) || key.len() != prefix.len() + 8 {
                break;
            }
            let mut number = [0u8; 8];
            number.copy_from_slice(&key[prefix.len()..]);
            let id = Uuid::from_slice(&value)
                .map_err(|e| StoreError::Serialization(format!("Invalid version id in index: {e}")))?;
            ids.push((u64::from_be_bytes(number), id));

            if limit.is_some_and(|n| ids.len() >= n) {
                break;
            }
        }
        Ok(ids)
    }

    fn versions_desc(&self, resource_id: Uuid, resource_type: &str) -> Result<Vec<Version>, StoreError> {
        self.indexed_ids_desc(resource_id, resource_type, None)?
            .into_iter()
            .map(|(_, id)| self.load_version(id))
            .collect()
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>, StoreError> {
        self.write_lock
            .lock()
            .map_err(|_| StoreError::Database("write lock poisoned".into()))
    }

    fn index_prefix(resource_type: &str, resource_id: Uuid) -> Vec<u8> {
        let mut key = Vec::with_capacity(resource_type.len() + 1 + 16 + 8);
        key.extend_from_slice(resource_type.as_bytes());
        key.push(0);
        key.extend_from_slice(resource_id.as_bytes());
        key
    }

    fn index_key(resource_type: &str, resource_id: Uuid, version_number: u64) -> Vec<u8> {
        let mut key = Self::index_prefix(resource_type, resource_id);
        key.extend_from_slice(&version_number.to_be_bytes());
        key
    }
}

#[async_trait]
impl DocumentStore for RocksBackend {
    async fn create_document(&self, new: NewDocument) -> Result<Document, StoreError> {
        let document = new.into_document();
        self.write_document(&document)?;
        Ok(document)
    }

    async fn get_document(&self, id: Uuid) -> Result<Document, StoreError> {
        self.load_document(id)
    }

    async fn update_document(
        &self,
        id: Uuid,
        content: String,
        updated_by: &str,
    ) -> Result<Document, StoreError> {
        self.update_document_locked(id, content, updated_by)
    }

    async fn list_documents(&self) -> Result<Vec<Document>, StoreError> {
        self.all_documents()
    }
}

#[async_trait]
impl VersionStore for RocksBackend {
    async fn insert_version(&self, new: NewVersion) -> Result<Version, StoreError> {
        self.insert_version_locked(new)
    }

    async fn get_version(&self, id: Uuid) -> Result<Version, StoreError> {
        self.load_version(id)
    }

    async fn list_versions(
        &self,
        resource_id: Uuid,
        resource_type: &str,
    ) -> Result<Vec<Version>, StoreError> {
        self.versions_desc(resource_id, resource_type)
    }

    async fn max_version_number(
        &self,
        resource_id: Uuid,
        resource_type: &str,
    ) -> Result<Option<u64>, StoreError> {
        Ok(self
            .indexed_ids_desc(resource_id, resource_type, Some(1))?
            .first()
            .map(|(number, _)| *number))
    }

    async fn set_tags(&self, id: Uuid, tags: BTreeSet<String>) -> Result<Version, StoreError> {
        self.set_tags_locked(id, tags)
    }

    async fn versions_with_tag(
        &self,
        resource_id: Uuid,
        resource_type: &str,
        tag: &str,
    ) -> Result<Vec<Version>, StoreError> {
        Ok(self
            .versions_desc(resource_id, resource_type)?
            .into_iter()
            .filter(|v| v.has_tag(tag))
            .collect())
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::Content;
    use serde_json::json;
    use tempfile::tempdir;

    fn new_version(resource_id: Uuid, number: u64, content: Content) -> NewVersion {
        NewVersion {
            resource_id,
            resource_type: "document".into(),
            version_number: number,
            content,
            comment: None,
            created_by: "alice".into(),
            tags: BTreeSet::new(),
        }
    }

    #[tokio::test]
    async fn test_document_roundtrip_and_update() {
        let dir = tempdir().unwrap();
        let store = RocksBackend::open(BackendConfig::for_testing(dir.path().join("db"))).unwrap();

        let doc = store
            .create_document(NewDocument::new("Draft", "first", "alice"))
            .await
            .unwrap();
        assert_eq!(store.get_document(doc.id).await.unwrap(), doc);

        let updated = store
            .update_document(doc.id, "second".into(), "bob")
            .await
            .unwrap();
        assert_eq!(updated.version, 1);
        assert_eq!(updated.updated_by, "bob");
        assert_eq!(store.list_documents().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_document() {
        let dir = tempdir().unwrap();
        let store = RocksBackend::open(BackendConfig::for_testing(dir.path().join("db"))).unwrap();
        assert!(matches!(
            store.get_document(Uuid::new_v4()).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_version_index_order_and_conflict() {
        let dir = tempdir().unwrap();
        let store = RocksBackend::open(BackendConfig::for_testing(dir.path().join("db"))).unwrap();
        let resource = Uuid::new_v4();

        for n in 1..=3 {
            store
                .insert_version(new_version(resource, n, Content::text(format!("v{n}"))))
                .await
                .unwrap();
        }
        // A different resource interleaved in the index must not leak in.
        store
            .insert_version(new_version(Uuid::new_v4(), 7, Content::text("other")))
            .await
            .unwrap();

        let numbers: Vec<u64> = store
            .list_versions(resource, "document")
            .await
            .unwrap()
            .iter()
            .map(|v| v.version_number)
            .collect();
        assert_eq!(numbers, vec![3, 2, 1]);
        assert_eq!(store.max_version_number(resource, "document").await.unwrap(), Some(3));

        let dup = store
            .insert_version(new_version(resource, 2, Content::text("dup")))
            .await;
        assert!(matches!(dup, Err(StoreError::Conflict { version_number: 2, .. })));
    }

    #[tokio::test]
    async fn test_structured_content_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        let resource = Uuid::new_v4();
        let content = Content::from(json!({"rows": [{"a": 1}], "title": "t"}));

        let id = {
            let store = RocksBackend::open(BackendConfig::for_testing(&path)).unwrap();
            store
                .insert_version(new_version(resource, 1, content.clone()))
                .await
                .unwrap()
                .id
        };

        let store = RocksBackend::open(BackendConfig::for_testing(&path)).unwrap();
        let loaded = store.get_version(id).await.unwrap();
        assert_eq!(loaded.content, content);
        assert_eq!(store.max_version_number(resource, "document").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_tags_and_tag_query() {
        let dir = tempdir().unwrap();
        let store = RocksBackend::open(BackendConfig::for_testing(dir.path().join("db"))).unwrap();
        let resource = Uuid::new_v4();

        let v1 = store
            .insert_version(new_version(resource, 1, Content::text("a")))
            .await
            .unwrap();
        store
            .insert_version(new_version(resource, 2, Content::text("b")))
            .await
            .unwrap();

        let tagged = store
            .set_tags(v1.id, ["release".to_string()].into_iter().collect())
            .await
            .unwrap();
        assert!(tagged.has_tag("release"));

        let found = store
            .versions_with_tag(resource, "document", "release")
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, v1.id);
        assert!(store
            .versions_with_tag(resource, "document", "releas")
            .await
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_backend_config_default() {
        let config = BackendConfig::default();
        assert_eq!(config.bloom_filter_bits, 10);
        assert!(config.sync_writes);
        assert!(!BackendConfig::for_testing("x").sync_writes);
    }
}
