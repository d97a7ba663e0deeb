//! Error types for the collaboration layer.

use quire_core::{StoreError, VersionError};
use thiserror::Error;
use uuid::Uuid;

/// Wire encoding failures.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Invalid message type")]
    InvalidMessageType,
}

/// Failures inside the CRDT replica.
#[derive(Debug, Clone, Error)]
pub enum ReplicaError {
    #[error("Position {index} is past the end of the text ({len} chars)")]
    OutOfBounds { index: usize, len: usize },

    #[error("Malformed update: {0}")]
    Decode(String),

    #[error("Failed to apply update: {0}")]
    Apply(String),
}

/// Realtime channel failures.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Connection closed")]
    Closed,

    #[error("Offline queue full ({0} updates)")]
    QueueFull(usize),

    /// The receiver fell behind; the count of lost messages.
    #[error("Missed {0} messages")]
    Lagged(u64),

    #[error("Handshake timed out")]
    Timeout,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Local durable cache failures.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Corrupt cache entry: {0}")]
    Corrupt(String),

    #[error("Cache for document {0} has been destroyed")]
    Destroyed(Uuid),

    #[error(transparent)]
    Replica(#[from] ReplicaError),
}

impl From<rocksdb::Error> for CacheError {
    fn from(e: rocksdb::Error) -> Self {
        CacheError::Database(e.to_string())
    }
}

/// Errors surfaced by a collaboration session.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("No authenticated user")]
    NotAuthenticated,

    #[error("Not found: {0}")]
    NotFound(Uuid),

    #[error("Document {0} already has an open session")]
    AlreadyOpen(Uuid),

    #[error("Session has been disconnected")]
    Detached,

    #[error("Version control error: {0}")]
    Version(VersionError),

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Replica error: {0}")]
    Replica(#[from] ReplicaError),
}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => SessionError::NotFound(id),
            other => SessionError::Store(other),
        }
    }
}

impl From<VersionError> for SessionError {
    fn from(e: VersionError) -> Self {
        match e {
            VersionError::NotFound(id) => SessionError::NotFound(id),
            other => SessionError::Version(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_flattens() {
        let id = Uuid::new_v4();
        assert!(matches!(
            SessionError::from(StoreError::NotFound(id)),
            SessionError::NotFound(got) if got == id
        ));
        assert!(matches!(
            SessionError::from(VersionError::NotFound(id)),
            SessionError::NotFound(got) if got == id
        ));
    }

    #[test]
    fn test_conflict_stays_wrapped() {
        let err = SessionError::from(VersionError::Conflict {
            resource_id: Uuid::nil(),
            attempts: 5,
        });
        assert!(matches!(err, SessionError::Version(VersionError::Conflict { .. })));
        assert!(err.to_string().contains("5 attempts"));
    }

    #[test]
    fn test_transport_error_display() {
        let err = SessionError::from(TransportError::Connect("refused".into()));
        assert_eq!(err.to_string(), "Transport error: Connection failed: refused");
    }
}
