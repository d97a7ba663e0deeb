//! Error types for storage and version control.

use thiserror::Error;
use uuid::Uuid;

/// Errors raised by a backing store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(Uuid),

    /// The `(resource_id, resource_type, version_number)` triple is taken.
    #[error("Version {version_number} of {resource_type} {resource_id} already exists")]
    Conflict {
        resource_id: Uuid,
        resource_type: String,
        version_number: u64,
    },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Errors raised by the version control engine.
#[derive(Debug, Clone, Error)]
pub enum VersionError {
    #[error("Version not found: {0}")]
    NotFound(Uuid),

    #[error("No versions recorded for resource {0}")]
    NoHistory(Uuid),

    #[error("Could not allocate a version number for {resource_id} after {attempts} attempts")]
    Conflict { resource_id: Uuid, attempts: u32 },

    #[error("Store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for VersionError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => VersionError::NotFound(id),
            other => VersionError::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_not_found_maps_to_version_not_found() {
        let id = Uuid::new_v4();
        match VersionError::from(StoreError::NotFound(id)) {
            VersionError::NotFound(got) => assert_eq!(got, id),
            other => panic!("Expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_error_display() {
        let err = StoreError::Conflict {
            resource_id: Uuid::nil(),
            resource_type: "document".into(),
            version_number: 4,
        };
        assert!(err.to_string().contains("Version 4"));

        let err = VersionError::Conflict {
            resource_id: Uuid::nil(),
            attempts: 5,
        };
        assert!(err.to_string().contains("5 attempts"));
    }
}
