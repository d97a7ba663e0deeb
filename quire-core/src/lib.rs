//! # quire-core — Versioned content for Quire
//!
//! Immutable, numbered history for collaboratively edited resources, and the
//! structural diff used to compare any two snapshots.
//!
//! ## Modules
//!
//! - [`content`] — Tagged payload (`Text`, `List`, `Map`, `Scalar`)
//! - [`diff`] — Shape-aware diff between payloads and between versions
//! - [`document`] / [`version`] — Stored record shapes
//! - [`store`] — Persistence traits with in-memory and RocksDB backends
//! - [`engine`] — Version numbering, tagging, comparison and restore

pub mod content;
pub mod diff;
pub mod document;
pub mod engine;
pub mod error;
pub mod store;
pub mod version;

pub use content::{Content, ContentKind};
pub use diff::{diff, ContentDiff, Modification, VersionDiff};
pub use document::{Document, NewDocument};
pub use engine::{VersionControl, VersioningConfig};
pub use error::{StoreError, VersionError};
pub use store::{BackendConfig, DocumentStore, MemoryBackend, RocksBackend, VersionStore};
pub use version::{NewVersion, Version};

use std::time::SystemTime;

/// Seconds since the Unix epoch.
pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
