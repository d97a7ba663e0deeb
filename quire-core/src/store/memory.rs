//! In-process backend.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{DocumentStore, VersionStore};
use crate::document::{Document, NewDocument};
use crate::error::StoreError;
use crate::version::{NewVersion, Version};

/// Map-backed store. Each write takes the table's write lock, which makes
/// the uniqueness check and the insert a single step.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    documents: RwLock<HashMap<Uuid, Document>>,
    versions: RwLock<HashMap<Uuid, Version>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a document record as-is (fixtures, imports).
    pub async fn put_document(&self, document: Document) {
        self.documents.write().await.insert(document.id, document);
    }
}

fn sorted_desc(mut versions: Vec<Version>) -> Vec<Version> {
    versions.sort_by(|a, b| b.version_number.cmp(&a.version_number));
    versions
}

#[async_trait]
impl DocumentStore for MemoryBackend {
    async fn create_document(&self, new: NewDocument) -> Result<Document, StoreError> {
        let document = new.into_document();
        self.documents
            .write()
            .await
            .insert(document.id, document.clone());
        Ok(document)
    }

    async fn get_document(&self, id: Uuid) -> Result<Document, StoreError> {
        self.documents
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn update_document(
        &self,
        id: Uuid,
        content: String,
        updated_by: &str,
    ) -> Result<Document, StoreError> {
        let mut documents = self.documents.write().await;
        let document = documents.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        document.apply_update(content, updated_by);
        Ok(document.clone())
    }

    async fn list_documents(&self) -> Result<Vec<Document>, StoreError> {
        Ok(self.documents.read().await.values().cloned().collect())
    }
}

#[async_trait]
impl VersionStore for MemoryBackend {
    async fn insert_version(&self, new: NewVersion) -> Result<Version, StoreError> {
        let mut versions = self.versions.write().await;
        let taken = versions.values().any(|v| {
            v.resource_id == new.resource_id
                && v.resource_type == new.resource_type
                && v.version_number == new.version_number
        });
        if taken {
            return Err(StoreError::Conflict {
                resource_id: new.resource_id,
                resource_type: new.resource_type,
                version_number: new.version_number,
            });
        }

        let version = new.into_version();
        versions.insert(version.id, version.clone());
        Ok(version)
    }

    async fn get_version(&self, id: Uuid) -> Result<Version, StoreError> {
        self.versions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn list_versions(
        &self,
        resource_id: Uuid,
        resource_type: &str,
    ) -> Result<Vec<Version>, StoreError> {
        let versions = self.versions.read().await;
        Ok(sorted_desc(
            versions
                .values()
                .filter(|v| v.resource_id == resource_id && v.resource_type == resource_type)
                .cloned()
                .collect(),
        ))
    }

    async fn max_version_number(
        &self,
        resource_id: Uuid,
        resource_type: &str,
    ) -> Result<Option<u64>, StoreError> {
        let versions = self.versions.read().await;
        Ok(versions
            .values()
            .filter(|v| v.resource_id == resource_id && v.resource_type == resource_type)
            .map(|v| v.version_number)
            .max())
    }

    async fn set_tags(&self, id: Uuid, tags: BTreeSet<String>) -> Result<Version, StoreError> {
        let mut versions = self.versions.write().await;
        let version = versions.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        version.tags = tags;
        Ok(version.clone())
    }

    async fn versions_with_tag(
        &self,
        resource_id: Uuid,
        resource_type: &str,
        tag: &str,
    ) -> Result<Vec<Version>, StoreError> {
        let versions = self.versions.read().await;
        Ok(sorted_desc(
            versions
                .values()
                .filter(|v| {
                    v.resource_id == resource_id
                        && v.resource_type == resource_type
                        && v.has_tag(tag)
                })
                .cloned()
                .collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::Content;

    fn new_version(resource_id: Uuid, number: u64) -> NewVersion {
        NewVersion {
            resource_id,
            resource_type: "document".into(),
            version_number: number,
            content: Content::text(format!("v{number}")),
            comment: None,
            created_by: "alice".into(),
            tags: BTreeSet::new(),
        }
    }

    #[tokio::test]
    async fn test_update_document_increments_version() {
        let store = MemoryBackend::new();
        let doc = store
            .create_document(NewDocument::new("Notes", "a", "alice"))
            .await
            .unwrap();

        let updated = store.update_document(doc.id, "b".into(), "bob").await.unwrap();
        assert_eq!(updated.version, doc.version + 1);
        assert_eq!(store.get_document(doc.id).await.unwrap().content, "b");
    }

    #[tokio::test]
    async fn test_update_missing_document() {
        let store = MemoryBackend::new();
        let result = store.update_document(Uuid::new_v4(), "x".into(), "bob").await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_duplicate_version_number_conflicts() {
        let store = MemoryBackend::new();
        let resource = Uuid::new_v4();
        store.insert_version(new_version(resource, 1)).await.unwrap();

        let result = store.insert_version(new_version(resource, 1)).await;
        assert!(matches!(result, Err(StoreError::Conflict { version_number: 1, .. })));

        // Same number on another resource is fine.
        store.insert_version(new_version(Uuid::new_v4(), 1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_versions_descending() {
        let store = MemoryBackend::new();
        let resource = Uuid::new_v4();
        for n in [2, 1, 3] {
            store.insert_version(new_version(resource, n)).await.unwrap();
        }

        let numbers: Vec<u64> = store
            .list_versions(resource, "document")
            .await
            .unwrap()
            .iter()
            .map(|v| v.version_number)
            .collect();
        assert_eq!(numbers, vec![3, 2, 1]);
        assert_eq!(store.max_version_number(resource, "document").await.unwrap(), Some(3));
        assert_eq!(store.max_version_number(resource, "sheet").await.unwrap(), None);
    }
}
