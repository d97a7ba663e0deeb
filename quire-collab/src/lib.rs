//! # quire-collab — Real-time collaboration sessions for Quire
//!
//! Binds a replicated text document to a durable local cache, a realtime
//! transport, a presence channel and the version control engine from
//! `quire-core`.
//!
//! ## Architecture
//!
//! ```text
//!                    ┌────────────────────────┐
//!   open(doc) ─────► │  CollaborationSession  │ ──► DocumentStore / VersionControl
//!                    └───┬─────────┬──────┬───┘        (save, restore, history)
//!                        │         │      │
//!               ┌────────▼──┐ ┌────▼────┐ ┌▼──────────────┐
//!               │ Replicated│ │ Local   │ │ Transport     │ ◄──► RelayServer / LoopbackHub
//!               │ Text (Yrs)│ │ Cache   │ │ + Presence    │
//!               └───────────┘ │(RocksDB)│ └───────────────┘
//!                             └─────────┘
//! ```
//!
//! ## Modules
//!
//! - [`replica`] — Yrs-backed text with character positions
//! - [`presence`] — Awareness states and the derived peer list
//! - [`protocol`] — Binary wire protocol (bincode-encoded `SyncMessage`)
//! - [`transport`] — Transport trait, WebSocket client, in-process hub
//! - [`relay`] — WebSocket relay server with per-document rooms
//! - [`cache`] — RocksDB cache of replica state, LZ4-compressed
//! - [`session`] — Session manager and the owned session handle

pub mod cache;
pub mod error;
pub mod presence;
pub mod protocol;
pub mod relay;
pub mod replica;
pub mod session;
pub mod transport;

pub use cache::{CacheConfig, CacheStore, LocalCache, ReconcileOutcome};
pub use error::{CacheError, ProtocolError, ReplicaError, SessionError, TransportError};
pub use presence::{color_for, AwarenessUpdate, CollaborationUser, CursorRange, PresenceChannel};
pub use protocol::{MessageType, SyncMessage};
pub use relay::{RelayConfig, RelayServer, RelayStats};
pub use replica::ReplicatedText;
pub use session::{
    CollaborationSession, IdentityProvider, ReconnectConfig, SessionManager, SessionOptions,
    SessionState, StaticIdentity,
};
pub use transport::{
    ConnectionStatus, LoopbackHub, OfflineQueue, Transport, TransportEvent, TransportFactory,
    WebSocketConfig, WebSocketFactory,
};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
