//! Immutable version records.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::content::Content;
use crate::unix_timestamp;

/// A numbered snapshot of a resource's content.
///
/// Versions are never rewritten. The only field that changes after creation
/// is `tags`, which labels the snapshot without altering its content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Version {
    pub id: Uuid,
    pub resource_id: Uuid,
    pub resource_type: String,
    /// 1-based, unique per `(resource_id, resource_type)`.
    pub version_number: u64,
    pub content: Content,
    pub comment: Option<String>,
    pub created_by: String,
    /// Unix seconds.
    pub created_at: u64,
    pub tags: BTreeSet<String>,
}

impl Version {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Provenance comment recorded on a version created by a restore.
    pub fn restored_comment(version_number: u64) -> String {
        format!("Restored from version {version_number}")
    }
}

/// Insert shape for a version; the number is chosen by the version engine.
#[derive(Debug, Clone, PartialEq)]
pub struct NewVersion {
    pub resource_id: Uuid,
    pub resource_type: String,
    pub version_number: u64,
    pub content: Content,
    pub comment: Option<String>,
    pub created_by: String,
    pub tags: BTreeSet<String>,
}

impl NewVersion {
    /// Materialize the record with a fresh id and creation time.
    pub fn into_version(self) -> Version {
        Version {
            id: Uuid::new_v4(),
            resource_id: self.resource_id,
            resource_type: self.resource_type,
            version_number: self.version_number,
            content: self.content,
            comment: self.comment,
            created_by: self.created_by,
            created_at: unix_timestamp(),
            tags: self.tags,
        }
    }
}
