//! Version control engine.
//!
//! Numbers, tags, compares and restores versions of a resource. Every write
//! goes through the [`VersionStore`] boundary; the engine keeps no cached
//! state between calls, so several engines (or processes) can share one
//! store.
//!
//! ```text
//! create_version ──► max_version_number ──► insert_version
//!                          ▲                     │
//!                          └──── Conflict ◄──────┘  (retry, fresh read)
//!
//! restore_version(v) ──► create_version(v.content, "Restored from version N", v.tags)
//! ```
//!
//! Callers that keep their own counter (a document's save count) can ask for
//! a specific number with the `_numbered` variants. The request is honored
//! while it is above the current maximum; otherwise numbering falls back to
//! `max + 1` so history stays strictly increasing.

use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::content::Content;
use crate::diff::VersionDiff;
use crate::error::{StoreError, VersionError};
use crate::store::VersionStore;
use crate::version::{NewVersion, Version};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct VersioningConfig {
    /// Resource type every version created by this engine is filed under.
    pub resource_type: String,
    /// Attempts at allocating a version number before giving up on conflicts.
    pub max_create_attempts: u32,
}

impl Default for VersioningConfig {
    fn default() -> Self {
        Self {
            resource_type: "document".to_string(),
            max_create_attempts: 5,
        }
    }
}

/// Immutable, numbered history for resources of one type.
#[derive(Clone)]
pub struct VersionControl {
    store: Arc<dyn VersionStore>,
    config: VersioningConfig,
}

impl VersionControl {
    pub fn new(store: Arc<dyn VersionStore>, config: VersioningConfig) -> Self {
        Self { store, config }
    }

    pub fn with_defaults(store: Arc<dyn VersionStore>) -> Self {
        Self::new(store, VersioningConfig::default())
    }

    pub fn resource_type(&self) -> &str {
        &self.config.resource_type
    }

    /// Snapshot `content` as the next version of `resource_id`.
    ///
    /// The number is `max + 1` (or 1 for a fresh resource), read from the
    /// store on every attempt. A concurrent writer that takes the same number
    /// causes a retry with a newly read maximum.
    pub async fn create_version(
        &self,
        resource_id: Uuid,
        content: Content,
        created_by: &str,
        comment: Option<String>,
        tags: BTreeSet<String>,
    ) -> Result<Version, VersionError> {
        let resource_type = self.config.resource_type.clone();
        self.create_version_of(resource_type, resource_id, None, content, created_by, comment, tags)
            .await
    }

    /// Snapshot `content` as version `version_number` of `resource_id`.
    ///
    /// Used when the number must match an external counter. If the number is
    /// no longer above the stored maximum (or is taken while inserting), the
    /// version is numbered `max + 1` instead.
    pub async fn create_version_numbered(
        &self,
        resource_id: Uuid,
        version_number: u64,
        content: Content,
        created_by: &str,
        comment: Option<String>,
        tags: BTreeSet<String>,
    ) -> Result<Version, VersionError> {
        let resource_type = self.config.resource_type.clone();
        self.create_version_of(
            resource_type,
            resource_id,
            Some(version_number),
            content,
            created_by,
            comment,
            tags,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_version_of(
        &self,
        resource_type: String,
        resource_id: Uuid,
        preferred: Option<u64>,
        content: Content,
        created_by: &str,
        comment: Option<String>,
        tags: BTreeSet<String>,
    ) -> Result<Version, VersionError> {
        let max_attempts = self.config.max_create_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let max = self
                .store
                .max_version_number(resource_id, &resource_type)
                .await?
                .unwrap_or(0);
            let next = match preferred {
                Some(n) if n > max => n,
                Some(n) => {
                    log::warn!("Version {n} of {resource_id} is not above {max}, numbering it {}", max + 1);
                    max + 1
                }
                None => max + 1,
            };

            let new = NewVersion {
                resource_id,
                resource_type: resource_type.clone(),
                version_number: next,
                content: content.clone(),
                comment: comment.clone(),
                created_by: created_by.to_string(),
                tags: tags.clone(),
            };

            match self.store.insert_version(new).await {
                Ok(version) => {
                    log::info!(
                        "Created version {} of {resource_type} {resource_id}",
                        version.version_number
                    );
                    return Ok(version);
                }
                Err(StoreError::Conflict { version_number, .. }) if attempt < max_attempts => {
                    log::warn!(
                        "Version {version_number} of {resource_id} taken concurrently, retrying ({attempt}/{max_attempts})"
                    );
                }
                Err(StoreError::Conflict { .. }) => {
                    log::error!(
                        "Giving up allocating a version number for {resource_id} after {attempt} attempts"
                    );
                    return Err(VersionError::Conflict {
                        resource_id,
                        attempts: attempt,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub async fn get_version(&self, version_id: Uuid) -> Result<Version, VersionError> {
        Ok(self.store.get_version(version_id).await?)
    }

    /// Full history of a resource, highest `version_number` first.
    pub async fn get_version_history(&self, resource_id: Uuid) -> Result<Vec<Version>, VersionError> {
        Ok(self
            .store
            .list_versions(resource_id, &self.config.resource_type)
            .await?)
    }

    pub async fn get_latest_version(&self, resource_id: Uuid) -> Result<Version, VersionError> {
        self.get_version_history(resource_id)
            .await?
            .into_iter()
            .next()
            .ok_or(VersionError::NoHistory(resource_id))
    }

    /// Look up a version by its number within a resource.
    pub async fn get_version_by_number(
        &self,
        resource_id: Uuid,
        version_number: u64,
    ) -> Result<Option<Version>, VersionError> {
        Ok(self
            .get_version_history(resource_id)
            .await?
            .into_iter()
            .find(|v| v.version_number == version_number))
    }

    /// Diff two versions. Both are fetched concurrently; the lower
    /// `version_number` is always treated as the previous one.
    pub async fn compare_versions(&self, a: Uuid, b: Uuid) -> Result<VersionDiff, VersionError> {
        let (first, second) = tokio::join!(self.get_version(a), self.get_version(b));
        Ok(VersionDiff::between(&first?, &second?))
    }

    /// Append a new version carrying the content and tags of `version_id`.
    ///
    /// The restored version is left untouched; the new one is numbered
    /// `max + 1` and its comment records where it came from.
    pub async fn restore_version(&self, version_id: Uuid, user_id: &str) -> Result<Version, VersionError> {
        self.restore_version_of(version_id, user_id, None).await
    }

    /// [`restore_version`](Self::restore_version) with the new version
    /// numbered like [`create_version_numbered`](Self::create_version_numbered).
    pub async fn restore_version_numbered(
        &self,
        version_id: Uuid,
        user_id: &str,
        version_number: u64,
    ) -> Result<Version, VersionError> {
        self.restore_version_of(version_id, user_id, Some(version_number))
            .await
    }

    async fn restore_version_of(
        &self,
        version_id: Uuid,
        user_id: &str,
        preferred: Option<u64>,
    ) -> Result<Version, VersionError> {
        let target = self.get_version(version_id).await?;
        log::info!(
            "Restoring version {} of {} {} for {user_id}",
            target.version_number,
            target.resource_type,
            target.resource_id
        );

        self.create_version_of(
            target.resource_type,
            target.resource_id,
            preferred,
            target.content,
            user_id,
            Some(Version::restored_comment(target.version_number)),
            target.tags,
        )
        .await
    }

    /// Add `tag` to a version. Tagging twice is the same as tagging once.
    pub async fn tag_version(&self, version_id: Uuid, tag: &str) -> Result<Version, VersionError> {
        let version = self.get_version(version_id).await?;
        if version.has_tag(tag) {
            return Ok(version);
        }

        let mut tags = version.tags;
        tags.insert(tag.to_string());
        Ok(self.store.set_tags(version_id, tags).await?)
    }

    /// Remove `tag` from a version. Removing an absent tag is a no-op.
    pub async fn untag_version(&self, version_id: Uuid, tag: &str) -> Result<Version, VersionError> {
        let version = self.get_version(version_id).await?;
        if !version.has_tag(tag) {
            return Ok(version);
        }

        let mut tags = version.tags;
        tags.remove(tag);
        Ok(self.store.set_tags(version_id, tags).await?)
    }

    pub async fn get_versions_by_tag(
        &self,
        resource_id: Uuid,
        tag: &str,
    ) -> Result<Vec<Version>, VersionError> {
        Ok(self
            .store
            .versions_with_tag(resource_id, &self.config.resource_type, tag)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBackend;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn engine() -> VersionControl {
        VersionControl::with_defaults(Arc::new(MemoryBackend::new()))
    }

    /// Store that lets a competing writer grab the next number before each of
    /// the first `steals` inserts.
    struct ContendedStore {
        inner: MemoryBackend,
        steals: AtomicU32,
    }

    #[async_trait]
    impl VersionStore for ContendedStore {
        async fn insert_version(&self, new: NewVersion) -> Result<Version, StoreError> {
            if self.steals.load(Ordering::SeqCst) > 0 {
                self.steals.fetch_sub(1, Ordering::SeqCst);
                let mut rival = new.clone();
                rival.created_by = "rival".into();
                self.inner.insert_version(rival).await?;
            }
            self.inner.insert_version(new).await
        }

        async fn get_version(&self, id: Uuid) -> Result<Version, StoreError> {
            self.inner.get_version(id).await
        }

        async fn list_versions(&self, id: Uuid, rt: &str) -> Result<Vec<Version>, StoreError> {
            self.inner.list_versions(id, rt).await
        }

        async fn max_version_number(&self, id: Uuid, rt: &str) -> Result<Option<u64>, StoreError> {
            self.inner.max_version_number(id, rt).await
        }

        async fn set_tags(&self, id: Uuid, tags: BTreeSet<String>) -> Result<Version, StoreError> {
            self.inner.set_tags(id, tags).await
        }

        async fn versions_with_tag(
            &self,
            id: Uuid,
            rt: &str,
            tag: &str,
        ) -> Result<Vec<Version>, StoreError> {
            self.inner.versions_with_tag(id, rt, tag).await
        }
    }

    #[tokio::test]
    async fn test_sequential_creates_are_gapless() {
        let vc = engine();
        let resource = Uuid::new_v4();
        for n in 1..=5u64 {
            let v = vc
                .create_version(resource, Content::text(format!("rev {n}")), "alice", None, BTreeSet::new())
                .await
                .unwrap();
            assert_eq!(v.version_number, n);
        }

        let numbers: Vec<u64> = vc
            .get_version_history(resource)
            .await
            .unwrap()
            .iter()
            .map(|v| v.version_number)
            .collect();
        assert_eq!(numbers, vec![5, 4, 3, 2, 1]);
    }

    #[tokio::test]
    async fn test_conflict_is_retried_with_fresh_number() {
        let store = Arc::new(ContendedStore {
            inner: MemoryBackend::new(),
            steals: AtomicU32::new(2),
        });
        let vc = VersionControl::with_defaults(store.clone());
        let resource = Uuid::new_v4();

        let v = vc
            .create_version(resource, Content::text("mine"), "alice", None, BTreeSet::new())
            .await
            .unwrap();
        assert_eq!(v.version_number, 3);
        assert_eq!(v.created_by, "alice");
    }

    #[tokio::test]
    async fn test_conflict_surfaces_when_attempts_exhausted() {
        let store = Arc::new(ContendedStore {
            inner: MemoryBackend::new(),
            steals: AtomicU32::new(10),
        });
        let config = VersioningConfig {
            max_create_attempts: 3,
            ..VersioningConfig::default()
        };
        let vc = VersionControl::new(store, config);

        let result = vc
            .create_version(Uuid::new_v4(), Content::text("x"), "alice", None, BTreeSet::new())
            .await;
        assert!(matches!(result, Err(VersionError::Conflict { attempts: 3, .. })));
    }

    #[tokio::test]
    async fn test_restore_appends_new_version() {
        let vc = engine();
        let resource = Uuid::new_v4();
        let tags: BTreeSet<String> = ["milestone".to_string()].into_iter().collect();
        let v1 = vc
            .create_version(resource, Content::from(json!({"a": 1})), "alice", None, tags)
            .await
            .unwrap();
        vc.create_version(resource, Content::from(json!({"a": 2})), "alice", None, BTreeSet::new())
            .await
            .unwrap();

        let restored = vc.restore_version(v1.id, "bob").await.unwrap();
        assert_eq!(restored.version_number, 3);
        assert_eq!(restored.content, v1.content);
        assert_eq!(restored.comment.as_deref(), Some("Restored from version 1"));
        assert_eq!(restored.created_by, "bob");
        assert!(restored.has_tag("milestone"));

        let latest = vc.get_latest_version(resource).await.unwrap();
        assert_eq!(latest.id, restored.id);
        // The original is untouched.
        assert_eq!(vc.get_version(v1.id).await.unwrap(), v1);
    }

    #[tokio::test]
    async fn test_numbered_create_follows_external_counter() {
        let vc = engine();
        let resource = Uuid::new_v4();

        let first = vc
            .create_version_numbered(resource, 1, Content::text("a"), "alice", None, BTreeSet::new())
            .await
            .unwrap();
        assert_eq!(first.version_number, 1);

        // Saves without versioning leave a gap; the number is still honored.
        let fourth = vc
            .create_version_numbered(resource, 4, Content::text("b"), "alice", None, BTreeSet::new())
            .await
            .unwrap();
        assert_eq!(fourth.version_number, 4);

        // A number at or below the maximum never rewinds history.
        let stale = vc
            .create_version_numbered(resource, 2, Content::text("c"), "alice", None, BTreeSet::new())
            .await
            .unwrap();
        assert_eq!(stale.version_number, 5);
    }

    #[tokio::test]
    async fn test_numbered_create_taken_concurrently_moves_past_rival() {
        let store = Arc::new(ContendedStore {
            inner: MemoryBackend::new(),
            steals: AtomicU32::new(1),
        });
        let vc = VersionControl::with_defaults(store);
        let resource = Uuid::new_v4();

        let v = vc
            .create_version_numbered(resource, 7, Content::text("mine"), "alice", None, BTreeSet::new())
            .await
            .unwrap();
        assert_eq!(v.version_number, 8);
        assert_eq!(v.created_by, "alice");
    }

    #[tokio::test]
    async fn test_numbered_restore() {
        let vc = engine();
        let resource = Uuid::new_v4();
        let v1 = vc
            .create_version_numbered(resource, 1, Content::text("one"), "alice", None, BTreeSet::new())
            .await
            .unwrap();

        let restored = vc.restore_version_numbered(v1.id, "bob", 3).await.unwrap();
        assert_eq!(restored.version_number, 3);
        assert_eq!(restored.content, v1.content);
        assert_eq!(restored.comment.as_deref(), Some("Restored from version 1"));
    }

    #[tokio::test]
    async fn test_tagging_is_idempotent() {
        let vc = engine();
        let v = vc
            .create_version(Uuid::new_v4(), Content::text("a"), "alice", None, BTreeSet::new())
            .await
            .unwrap();

        vc.tag_version(v.id, "t").await.unwrap();
        let twice = vc.tag_version(v.id, "t").await.unwrap();
        assert_eq!(twice.tags.iter().filter(|t| *t == "t").count(), 1);

        let untagged = vc.untag_version(v.id, "t").await.unwrap();
        assert!(untagged.tags.is_empty());
        let again = vc.untag_version(v.id, "t").await.unwrap();
        assert_eq!(again, untagged);
    }

    #[tokio::test]
    async fn test_versions_by_tag_scoped_to_resource() {
        let vc = engine();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let va = vc
            .create_version(a, Content::text("a"), "alice", None, BTreeSet::new())
            .await
            .unwrap();
        let vb = vc
            .create_version(b, Content::text("b"), "alice", None, BTreeSet::new())
            .await
            .unwrap();
        vc.tag_version(va.id, "release").await.unwrap();
        vc.tag_version(vb.id, "release").await.unwrap();

        let found = vc.get_versions_by_tag(a, "release").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, va.id);
    }

    #[tokio::test]
    async fn test_missing_version_is_not_found() {
        let vc = engine();
        let id = Uuid::new_v4();
        assert!(matches!(vc.get_version(id).await, Err(VersionError::NotFound(got)) if got == id));
        assert!(matches!(vc.tag_version(id, "x").await, Err(VersionError::NotFound(_))));
        assert!(matches!(
            vc.get_latest_version(Uuid::new_v4()).await,
            Err(VersionError::NoHistory(_))
        ));
    }

    #[tokio::test]
    async fn test_get_version_by_number() {
        let vc = engine();
        let resource = Uuid::new_v4();
        for text in ["a", "b"] {
            vc.create_version(resource, Content::text(text), "alice", None, BTreeSet::new())
                .await
                .unwrap();
        }
        let v2 = vc.get_version_by_number(resource, 2).await.unwrap().unwrap();
        assert_eq!(v2.content, Content::text("b"));
        assert!(vc.get_version_by_number(resource, 9).await.unwrap().is_none());
    }
}
