//! Collaborative document records.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::unix_timestamp;

/// The authoritative record of a shared document.
///
/// `version` counts saves: 0 for a fresh record, bumped by exactly one on
/// every successful save. The backing store performs the increment so
/// concurrent savers never collide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub title: String,
    /// Current serialized text.
    pub content: String,
    pub version: u64,
    /// Unix seconds of the last update.
    pub last_modified: u64,
    pub created_by: String,
    pub updated_by: String,
}

/// Insert shape for a new document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDocument {
    pub title: String,
    pub content: String,
    pub created_by: String,
}

impl NewDocument {
    pub fn new(
        title: impl Into<String>,
        content: impl Into<String>,
        created_by: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            content: content.into(),
            created_by: created_by.into(),
        }
    }

    /// Materialize the record with a fresh id. Nothing has been saved yet, so
    /// the version is 0.
    pub fn into_document(self) -> Document {
        Document {
            id: Uuid::new_v4(),
            title: self.title,
            content: self.content,
            version: 0,
            last_modified: unix_timestamp(),
            updated_by: self.created_by.clone(),
            created_by: self.created_by,
        }
    }
}

impl Document {
    /// Apply a save: new content, new editor, version incremented by one.
    pub fn apply_update(&mut self, content: String, updated_by: &str) {
        self.content = content;
        self.updated_by = updated_by.to_string();
        self.version += 1;
        self.last_modified = unix_timestamp();
    }
}
