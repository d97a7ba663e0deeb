//! Persistence boundary for documents and versions.
//!
//! ```text
//! ┌──────────────────┐     ┌──────────────────┐
//! │ SessionManager   │     │ VersionControl   │
//! └────────┬─────────┘     └────────┬─────────┘
//!          │ DocumentStore          │ VersionStore
//!          ▼                        ▼
//! ┌──────────────────────────────────────────────┐
//! │ MemoryBackend  |  RocksBackend               │
//! │                │   CF "documents"            │
//! │                │   CF "versions"             │
//! │                │   CF "version_index"        │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Both backends enforce the version-number uniqueness rule themselves, so
//! callers never have to assume they are the only writer.

pub mod memory;
pub mod rocks;

pub use memory::MemoryBackend;
pub use rocks::{BackendConfig, RocksBackend};

use async_trait::async_trait;
use uuid::Uuid;

use crate::document::{Document, NewDocument};
use crate::error::StoreError;
use crate::version::{NewVersion, Version};
use std::collections::BTreeSet;

/// Storage for [`Document`] records.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn create_document(&self, new: NewDocument) -> Result<Document, StoreError>;

    /// Point lookup; `StoreError::NotFound` when the id does not resolve.
    async fn get_document(&self, id: Uuid) -> Result<Document, StoreError>;

    /// Replace the content and increment `version` by one, atomically.
    ///
    /// The increment happens inside the store, so two callers that both read
    /// version `n` still end up at `n + 1` and `n + 2`.
    async fn update_document(
        &self,
        id: Uuid,
        content: String,
        updated_by: &str,
    ) -> Result<Document, StoreError>;

    async fn list_documents(&self) -> Result<Vec<Document>, StoreError>;
}

/// Storage for [`Version`] records.
#[async_trait]
pub trait VersionStore: Send + Sync {
    /// Insert a version. Fails with `StoreError::Conflict` if its number is taken.
    async fn insert_version(&self, new: NewVersion) -> Result<Version, StoreError>;

    async fn get_version(&self, id: Uuid) -> Result<Version, StoreError>;

    /// All versions of a resource, highest `version_number` first.
    async fn list_versions(
        &self,
        resource_id: Uuid,
        resource_type: &str,
    ) -> Result<Vec<Version>, StoreError>;

    /// Highest `version_number` recorded for a resource, read fresh.
    async fn max_version_number(
        &self,
        resource_id: Uuid,
        resource_type: &str,
    ) -> Result<Option<u64>, StoreError>;

    /// Replace the tag set of a version and return the updated record.
    async fn set_tags(&self, id: Uuid, tags: BTreeSet<String>) -> Result<Version, StoreError>;

    /// Versions of one resource whose tag set contains `tag`, highest first.
    async fn versions_with_tag(
        &self,
        resource_id: Uuid,
        resource_type: &str,
        tag: &str,
    ) -> Result<Vec<Version>, StoreError>;
}
