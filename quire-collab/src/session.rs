//! Collaboration sessions: one live, replicated document per handle.
//!
//! ```text
//! SessionManager::open(doc)
//!   1. claim the document (one session per document per manager)
//!   2. reconcile the local cache into a fresh replica
//!   3. fetch the authoritative record (NotFound releases everything)
//!   4. connect the transport, announce presence, SyncStep1
//!   5. wait up to sync_timeout for a peer's SyncStep2 (only if peers exist)
//!   6. seed the replica from the record when it is safe to do so
//!   7. spawn the driver: transport events + presence changes → SessionState
//! ```
//!
//! The driver also owns reconnection. When the transport reports a lost
//! connection (or the first connect failed) it retries with exponential
//! backoff; a successful reconnect repeats the announce + SyncStep1 handshake,
//! and the other peers answer our `Join` with their own SyncStep1.
//!
//! The returned [`CollaborationSession`] owns the replica, the transport and
//! the cache handle. Dropping it, or calling [`CollaborationSession::disconnect`],
//! releases all three.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use quire_core::{diff, Content, ContentDiff, Document, DocumentStore, Version, VersionControl};

use crate::cache::{CacheStore, LocalCache, ReconcileOutcome};
use crate::error::{SessionError, TransportError};
use crate::lock;
use crate::presence::{AwarenessUpdate, CollaborationUser, CursorRange, PresenceChannel, USER_FIELD};
use crate::protocol::{MessageType, SyncMessage};
use crate::replica::ReplicatedText;
use crate::transport::{ConnectionStatus, Transport, TransportEvent, TransportFactory};

/// Reconnection policy for a session's transport.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Reconnect automatically after the connection drops
    pub enabled: bool,
    /// Attempts per outage before giving up (0 = infinite)
    pub max_attempts: u32,
    /// Delay before the first attempt; doubled after every failure
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 0,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectConfig {
    /// Delay before attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt > self.max_attempts
    }
}

/// Per-session behavior.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Create a version on every save (default: true)
    pub enable_versioning: bool,
    /// How long `open` waits for a peer's state when peers are present
    pub sync_timeout: Duration,
    pub reconnect: ReconnectConfig,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            enable_versioning: true,
            sync_timeout: Duration::from_secs(2),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl SessionOptions {
    pub fn for_testing() -> Self {
        Self {
            enable_versioning: true,
            sync_timeout: Duration::from_millis(500),
            reconnect: ReconnectConfig {
                base_delay: Duration::from_millis(20),
                max_delay: Duration::from_millis(200),
                ..ReconnectConfig::default()
            },
        }
    }

    pub fn without_versioning(mut self) -> Self {
        self.enable_versioning = false;
        self
    }

    pub fn without_reconnect(mut self) -> Self {
        self.reconnect.enabled = false;
        self
    }
}

/// What the UI renders.
///
/// A session starts out as [`SessionState::loading`]. `open` only returns
/// once loading has finished, so receivers from
/// [`CollaborationSession::subscribe`] begin at `is_loading == false`.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub is_loading: bool,
    pub is_connected: bool,
    pub users: Vec<CollaborationUser>,
    /// Text of the most recent failure
    pub error: Option<String>,
}

impl SessionState {
    /// State before the document has been loaded.
    pub fn loading() -> Self {
        Self {
            is_loading: true,
            is_connected: false,
            users: Vec::new(),
            error: None,
        }
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::loading()
    }
}

/// Resolves the acting user for saves and restores.
pub trait IdentityProvider: Send + Sync {
    fn current_user(&self) -> Option<String>;
}

/// Fixed identity, or none at all.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity(Option<String>);

impl StaticIdentity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self(Some(user_id.into()))
    }

    pub fn anonymous() -> Self {
        Self(None)
    }
}

impl IdentityProvider for StaticIdentity {
    fn current_user(&self) -> Option<String> {
        self.0.clone()
    }
}

// ───────────────────────────────────────────────────────────────────
// Manager
// ───────────────────────────────────────────────────────────────────

type OpenSet = Arc<Mutex<HashSet<Uuid>>>;

/// Releases the document's claim when dropped.
struct OpenSlot {
    open: OpenSet,
    doc_id: Uuid,
}

impl Drop for OpenSlot {
    fn drop(&mut self) {
        lock(&self.open).remove(&self.doc_id);
    }
}

/// Opens sessions against shared stores, transport and cache.
pub struct SessionManager {
    documents: Arc<dyn DocumentStore>,
    versions: VersionControl,
    transports: Arc<dyn TransportFactory>,
    identity: Arc<dyn IdentityProvider>,
    cache: Option<Arc<CacheStore>>,
    open: OpenSet,
}

impl SessionManager {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        versions: VersionControl,
        transports: Arc<dyn TransportFactory>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        Self {
            documents,
            versions,
            transports,
            identity,
            cache: None,
            open: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Persist replica state locally so offline edits survive restarts.
    pub fn with_cache(mut self, cache: Arc<CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn versions(&self) -> &VersionControl {
        &self.versions
    }

    pub fn is_open(&self, doc_id: Uuid) -> bool {
        lock(&self.open).contains(&doc_id)
    }

    fn claim(&self, doc_id: Uuid) -> Result<OpenSlot, SessionError> {
        if !lock(&self.open).insert(doc_id) {
            return Err(SessionError::AlreadyOpen(doc_id));
        }
        Ok(OpenSlot {
            open: self.open.clone(),
            doc_id,
        })
    }

    /// Open a live session on `doc_id` as `user`.
    ///
    /// Resolves after the record has been fetched, the peer sync has finished
    /// (or timed out) and the replica has been seeded. The loading phase is
    /// therefore never visible through the returned session. A failed connect
    /// does not fail the open: the session starts offline, records the error
    /// and keeps retrying in the background.
    pub async fn open(
        &self,
        doc_id: Uuid,
        user: CollaborationUser,
        options: SessionOptions,
    ) -> Result<CollaborationSession, SessionError> {
        let slot = self.claim(doc_id)?;
        let replica = ReplicatedText::new();

        let cache = self.cache.clone().map(|store| LocalCache::attach(store, doc_id));
        let outcome = match &cache {
            Some(cache) => cache.reconcile_into(&replica)?,
            None => ReconcileOutcome::default(),
        };

        let record = self.documents.get_document(doc_id).await?;

        let peer_id = Uuid::new_v4();
        let mut presence = PresenceChannel::new(peer_id);
        presence.set_local_field(
            USER_FIELD,
            serde_json::to_value(&user).unwrap_or(serde_json::Value::Null),
        );
        let presence_rx = presence.subscribe();

        let transport = self.transports.create(doc_id, peer_id);
        let mut events = transport.take_events().ok_or(TransportError::Closed)?;
        let (state, _) = watch::channel(SessionState::loading());

        let shared = Arc::new(SessionShared {
            doc_id,
            peer_id,
            user,
            options,
            replica: Mutex::new(replica),
            presence: Mutex::new(presence),
            transport,
            cache,
            documents: self.documents.clone(),
            versions: self.versions.clone(),
            identity: self.identity.clone(),
            state,
            clock: AtomicU64::new(0),
            detached: AtomicBool::new(false),
            connecting: tokio::sync::Mutex::new(()),
            driver: Mutex::new(None),
            slot: Mutex::new(Some(slot)),
        });

        let peers = match shared.transport.connect().await {
            Ok(peers) => peers,
            Err(e) => {
                log::warn!("Opening {doc_id} offline: {e}");
                shared.set_error(e.to_string());
                0
            }
        };

        shared.handshake(&mut events, peers).await;
        shared.seed(&record, &outcome, peers)?;

        let is_connected = shared.transport.status() == ConnectionStatus::Connected;
        let users = lock(&shared.presence).peers();
        shared.state.send_modify(|s| {
            s.is_loading = false;
            s.is_connected = is_connected;
            s.users = users;
        });

        let driver = tokio::spawn(drive(shared.clone(), events, presence_rx, !is_connected));
        *lock(&shared.driver) = Some(driver);

        log::info!(
            "Opened session on {doc_id} as {} ({peers} peers, restored from cache: {})",
            shared.user.id,
            outcome.restored
        );
        Ok(CollaborationSession { shared })
    }
}

// ───────────────────────────────────────────────────────────────────
// Session
// ───────────────────────────────────────────────────────────────────

struct SessionShared {
    doc_id: Uuid,
    peer_id: Uuid,
    user: CollaborationUser,
    options: SessionOptions,
    replica: Mutex<ReplicatedText>,
    presence: Mutex<PresenceChannel>,
    transport: Arc<dyn Transport>,
    cache: Option<LocalCache>,
    documents: Arc<dyn DocumentStore>,
    versions: VersionControl,
    identity: Arc<dyn IdentityProvider>,
    state: watch::Sender<SessionState>,
    clock: AtomicU64,
    detached: AtomicBool,
    /// Serializes connect attempts from the driver and from `reconnect`
    connecting: tokio::sync::Mutex<()>,
    driver: Mutex<Option<JoinHandle<()>>>,
    slot: Mutex<Option<OpenSlot>>,
}

impl SessionShared {
    // ─── Open ─────────────────────────────────────────────────────────

    async fn handshake(&self, events: &mut mpsc::UnboundedReceiver<TransportEvent>, peers: usize) {
        let hello = lock(&self.presence).local_update();
        self.announce(&hello);
        self.request_sync();

        if peers == 0 {
            return;
        }

        let deadline = tokio::time::Instant::now() + self.options.sync_timeout;
        loop {
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Some(TransportEvent::Message(msg))) if msg.msg_type == MessageType::SyncStep2 => {
                    self.handle_event(TransportEvent::Message(msg));
                    break;
                }
                Ok(Some(event)) => self.handle_event(event),
                Ok(None) => break,
                Err(_) => {
                    log::warn!(
                        "No peer state for {} within {:?}, continuing with local state",
                        self.doc_id,
                        self.options.sync_timeout
                    );
                    break;
                }
            }
        }
    }

    /// Connect again and repeat the handshake without waiting for answers;
    /// the driver merges them as they arrive.
    async fn reconnect(&self) -> Result<usize, TransportError> {
        let _guard = self.connecting.lock().await;
        let peers = self.transport.connect().await?;
        let hello = lock(&self.presence).local_update();
        self.announce(&hello);
        self.request_sync();
        log::info!("Reconnected {} ({peers} peers present)", self.doc_id);
        Ok(peers)
    }

    fn seed(&self, record: &Document, outcome: &ReconcileOutcome, peers: usize) -> Result<(), SessionError> {
        let update = {
            let replica = lock(&self.replica);
            if replica.is_empty() {
                (!record.content.is_empty()).then(|| replica.set_text(&record.content))
            } else if !outcome.unsynced && peers == 0 && replica.text() != record.content {
                log::debug!("Resetting cached replica of {} to the stored record", self.doc_id);
                Some(replica.set_text(&record.content))
            } else {
                None
            }
        };

        match update {
            Some(update) => self.publish(update),
            None => Ok(()),
        }
    }

    // ─── Outgoing ─────────────────────────────────────────────────────

    /// Cache and broadcast a local update.
    fn publish(&self, update: Vec<u8>) -> Result<(), SessionError> {
        let online = self.transport.status() == ConnectionStatus::Connected;
        self.persist(&update, !online)?;
        let clock = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        match self
            .transport
            .send(SyncMessage::update(self.peer_id, self.doc_id, clock, update))
        {
            Ok(()) => Ok(()),
            // The edit is in the replica; peers pull it with SyncStep1 once we rejoin.
            Err(TransportError::QueueFull(limit)) => {
                log::debug!("Offline queue for {} full ({limit}), relying on resync", self.doc_id);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Ask peers for everything our state vector lacks.
    fn request_sync(&self) {
        let sv = lock(&self.replica).state_vector();
        self.send_quietly(SyncMessage::sync_step1(self.peer_id, self.doc_id, sv));
    }

    fn persist(&self, update: &[u8], unsynced: bool) -> Result<(), SessionError> {
        let Some(cache) = &self.cache else {
            return Ok(());
        };
        cache.record(update, unsynced)?;
        if cache.needs_compaction()? {
            let state = lock(&self.replica).encode_state();
            cache.compact(&state)?;
        }
        Ok(())
    }

    fn announce(&self, update: &AwarenessUpdate) {
        match SyncMessage::awareness(self.doc_id, update) {
            Ok(msg) => self.send_quietly(msg),
            Err(e) => log::warn!("Failed to encode awareness for {}: {e}", self.doc_id),
        }
    }

    /// Send a control message; failures only reach the error field.
    fn send_quietly(&self, msg: SyncMessage) {
        if let Err(e) = self.transport.send(msg) {
            log::warn!("Send failed on {}: {e}", self.doc_id);
            self.set_error(e.to_string());
        }
    }

    // ─── Incoming ─────────────────────────────────────────────────────

    fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Message(msg) => self.handle_message(msg),
            TransportEvent::Status(ConnectionStatus::Connected) => {
                if let Some(cache) = &self.cache {
                    if let Err(e) = cache.mark_synced() {
                        log::warn!("Failed to mark {} synced: {e}", self.doc_id);
                    }
                }
                self.state.send_if_modified(|s| !std::mem::replace(&mut s.is_connected, true));
            }
            TransportEvent::Status(ConnectionStatus::Disconnected) => {
                let users = {
                    let mut presence = lock(&self.presence);
                    presence.retain_local();
                    presence.peers()
                };
                self.state.send_if_modified(|s| {
                    let changed = s.is_connected || s.users != users;
                    s.is_connected = false;
                    s.users = users;
                    changed
                });
            }
            TransportEvent::Status(ConnectionStatus::Connecting) => {}
            TransportEvent::Error(e) => {
                log::warn!("Transport error on {}: {e}", self.doc_id);
                let lagged = matches!(e, TransportError::Lagged(_));
                self.set_error(e.to_string());
                if lagged {
                    self.request_sync();
                }
            }
        }
    }

    fn handle_message(&self, msg: SyncMessage) {
        match msg.msg_type {
            MessageType::Update | MessageType::SyncStep2 => {
                let applied = lock(&self.replica).apply_remote(&msg.payload);
                match applied {
                    Ok(()) => {
                        log::debug!("Merged {:?} from {} into {}", msg.msg_type, msg.peer_id, self.doc_id);
                        if let Err(e) = self.persist(&msg.payload, false) {
                            log::error!("Failed to cache remote update for {}: {e}", self.doc_id);
                        }
                    }
                    Err(e) => {
                        log::warn!("Rejected update from {}: {e}", msg.peer_id);
                        self.set_error(e.to_string());
                    }
                }
            }
            MessageType::SyncStep1 => {
                let diff = lock(&self.replica).encode_diff(&msg.payload);
                match diff {
                    Ok(diff) => self.send_quietly(SyncMessage::sync_step2(self.peer_id, self.doc_id, diff)),
                    Err(e) => log::warn!("Bad state vector from {}: {e}", msg.peer_id),
                }
                let hello = lock(&self.presence).local_update();
                self.announce(&hello);
            }
            MessageType::Awareness => match msg.awareness_update() {
                Ok(update) => {
                    lock(&self.presence).apply_remote(update);
                }
                Err(e) => log::warn!("Bad awareness from {}: {e}", msg.peer_id),
            },
            MessageType::Join => {
                // A rejoining peer may hold edits its offline queue could not keep.
                log::debug!("Peer {} joined {}", msg.peer_id, self.doc_id);
                let hello = lock(&self.presence).local_update();
                self.announce(&hello);
                self.request_sync();
            }
            MessageType::Leave => {
                log::debug!("Peer {} left {}", msg.peer_id, self.doc_id);
                lock(&self.presence).remove_peer(msg.peer_id);
            }
            MessageType::Ping => self.send_quietly(SyncMessage::pong(self.peer_id)),
            MessageType::Pong | MessageType::Welcome => {}
        }
    }

    fn refresh_users(&self) {
        let users = lock(&self.presence).peers();
        self.state.send_if_modified(|s| {
            if s.users == users {
                return false;
            }
            s.users = users;
            true
        });
    }

    // ─── State ────────────────────────────────────────────────────────

    fn set_error(&self, message: String) {
        self.state.send_modify(|s| s.error = Some(message));
    }

    /// Record a failure in the session state before handing it back.
    fn track<T>(&self, result: Result<T, SessionError>) -> Result<T, SessionError> {
        if let Err(e) = &result {
            self.set_error(e.to_string());
        }
        result
    }

    fn ensure_attached(&self) -> Result<(), SessionError> {
        if self.detached.load(Ordering::Acquire) {
            return Err(SessionError::Detached);
        }
        Ok(())
    }

    fn actor(&self) -> Result<String, SessionError> {
        self.identity.current_user().ok_or(SessionError::NotAuthenticated)
    }
}

/// Next reconnect attempt of the current outage.
struct Retry {
    attempt: u32,
    at: Instant,
}

async fn drive(
    shared: Arc<SessionShared>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    mut presence_rx: watch::Receiver<u64>,
    offline: bool,
) {
    let policy = shared.options.reconnect.clone();
    let schedule = |attempt: u32| {
        if !policy.enabled {
            return None;
        }
        if policy.exhausted(attempt) {
            log::warn!("Giving up reconnecting {} after {} attempts", shared.doc_id, attempt - 1);
            return None;
        }
        let delay = policy.delay(attempt);
        log::info!("Reconnecting {} in {delay:?} (attempt {attempt})", shared.doc_id);
        Some(Retry {
            attempt,
            at: Instant::now() + delay,
        })
    };
    let mut retry = if offline { schedule(1) } else { None };

    loop {
        let retry_at = retry.as_ref().map(|r| r.at);
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    // Failed attempts report Disconnected too; only a drop starts an outage.
                    let dropped = matches!(event, TransportEvent::Status(ConnectionStatus::Disconnected))
                        && shared.state.borrow().is_connected;
                    shared.handle_event(event);
                    if dropped && retry.is_none() {
                        retry = schedule(1);
                    }
                }
                None => break,
            },
            changed = presence_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                shared.refresh_users();
            }
            _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                let attempt = retry.take().map_or(1, |r| r.attempt);
                if let Err(e) = shared.reconnect().await {
                    log::warn!("Reconnect of {} failed: {e}", shared.doc_id);
                    shared.set_error(e.to_string());
                    retry = schedule(attempt + 1);
                }
            }
        }
    }
    log::debug!("Session driver for {} stopped", shared.doc_id);
}

/// Owned handle to one open document.
pub struct CollaborationSession {
    shared: Arc<SessionShared>,
}

impl CollaborationSession {
    pub fn doc_id(&self) -> Uuid {
        self.shared.doc_id
    }

    /// This session's id on the presence channel.
    pub fn peer_id(&self) -> Uuid {
        self.shared.peer_id
    }

    pub fn user(&self) -> &CollaborationUser {
        &self.shared.user
    }

    pub fn state(&self) -> SessionState {
        self.shared.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    pub fn is_detached(&self) -> bool {
        self.shared.detached.load(Ordering::Acquire)
    }

    /// Reconnect now instead of waiting for the next scheduled attempt.
    ///
    /// Returns the number of other peers present. A no-op when connected.
    pub async fn reconnect(&self) -> Result<usize, SessionError> {
        let result = match self.shared.ensure_attached() {
            Ok(()) => self.shared.reconnect().await.map_err(SessionError::from),
            Err(e) => Err(e),
        };
        self.shared.track(result)
    }

    // ─── Editing ──────────────────────────────────────────────────────

    /// Current text of the replica.
    pub fn text(&self) -> String {
        lock(&self.shared.replica).text()
    }

    pub fn insert(&self, index: usize, chunk: &str) -> Result<(), SessionError> {
        let shared = &self.shared;
        shared.track((|| {
            shared.ensure_attached()?;
            let update = lock(&shared.replica).insert(index, chunk)?;
            shared.publish(update)
        })())
    }

    pub fn delete(&self, index: usize, len: usize) -> Result<(), SessionError> {
        let shared = &self.shared;
        shared.track((|| {
            shared.ensure_attached()?;
            let update = lock(&shared.replica).delete(index, len)?;
            shared.publish(update)
        })())
    }

    /// Publish the local cursor, or clear it with `None`.
    pub fn set_cursor(&self, cursor: Option<CursorRange>) -> Result<(), SessionError> {
        self.shared.ensure_attached()?;
        let update = lock(&self.shared.presence).set_cursor(cursor);
        self.shared.announce(&update);
        Ok(())
    }

    // ─── Persistence ──────────────────────────────────────────────────

    /// Write the replica's text to the document record and, with versioning
    /// on, snapshot it as a new version.
    pub async fn save(&self, comment: Option<String>) -> Result<Document, SessionError> {
        let result = self.save_inner(comment).await;
        self.shared.track(result)
    }

    async fn save_inner(&self, comment: Option<String>) -> Result<Document, SessionError> {
        let shared = &self.shared;
        shared.ensure_attached()?;
        let actor = shared.actor()?;
        let content = lock(&shared.replica).text();

        let document = shared
            .documents
            .update_document(shared.doc_id, content.clone(), &actor)
            .await?;

        if shared.options.enable_versioning {
            let version = shared
                .versions
                .create_version_numbered(
                    shared.doc_id,
                    document.version,
                    Content::text(content),
                    &actor,
                    comment,
                    BTreeSet::new(),
                )
                .await?;
            log::info!(
                "Saved {} as version {} (document version {})",
                shared.doc_id,
                version.version_number,
                document.version
            );
        } else {
            log::info!("Saved {} (document version {})", shared.doc_id, document.version);
        }

        Ok(document)
    }

    /// Versions of this document, newest first.
    pub async fn get_version_history(&self) -> Result<Vec<Version>, SessionError> {
        let result = self
            .shared
            .versions
            .get_version_history(self.shared.doc_id)
            .await
            .map_err(SessionError::from);
        self.shared.track(result)
    }

    /// Bring back an older version's content.
    ///
    /// The record is updated first, then the replica's text is replaced as an
    /// ordinary local edit so every peer converges on it. The restore version
    /// is appended last; if that fails the record and replica still agree and
    /// the error is returned.
    pub async fn restore_version(&self, version_id: Uuid) -> Result<Document, SessionError> {
        let result = self.restore_inner(version_id).await;
        self.shared.track(result)
    }

    async fn restore_inner(&self, version_id: Uuid) -> Result<Document, SessionError> {
        let shared = &self.shared;
        shared.ensure_attached()?;
        let actor = shared.actor()?;

        let version = shared.versions.get_version(version_id).await?;
        if version.resource_id != shared.doc_id || version.resource_type != shared.versions.resource_type() {
            return Err(SessionError::NotFound(version_id));
        }
        let content = version.content.as_text();

        let document = shared
            .documents
            .update_document(shared.doc_id, content.clone(), &actor)
            .await?;

        let update = lock(&shared.replica).set_text(&content);
        let published = shared.publish(update);

        if shared.options.enable_versioning {
            shared
                .versions
                .restore_version_numbered(version_id, &actor, document.version)
                .await?;
        }
        published?;

        log::info!(
            "Restored {} to version {} for {actor}",
            shared.doc_id,
            version.version_number
        );
        Ok(document)
    }

    /// Diff the content of two versions, `a` as before and `b` as after.
    pub async fn compare_versions(&self, a: Uuid, b: Uuid) -> Result<ContentDiff, SessionError> {
        let versions = &self.shared.versions;
        let (first, second) = tokio::join!(versions.get_version(a), versions.get_version(b));
        let result = match (first, second) {
            (Ok(first), Ok(second)) => Ok(diff(&first.content, &second.content)),
            (Err(e), _) | (_, Err(e)) => Err(SessionError::from(e)),
        };
        self.shared.track(result)
    }

    // ─── Teardown ─────────────────────────────────────────────────────

    /// Leave the channel and release the transport and cache.
    ///
    /// Safe to call any number of times; later edits fail with `Detached`.
    pub fn disconnect(&self) {
        let shared = &self.shared;
        if shared.detached.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(driver) = lock(&shared.driver).take() {
            driver.abort();
        }

        let goodbye = lock(&shared.presence).clear_local_state();
        shared.announce(&goodbye);
        shared.transport.disconnect();

        if let Some(cache) = &shared.cache {
            let state = lock(&shared.replica).encode_state();
            if let Err(e) = cache.destroy(&state) {
                log::error!("Failed to flush cache for {}: {e}", shared.doc_id);
            }
        }

        shared.state.send_modify(|s| {
            s.is_connected = false;
            s.users.clear();
        });
        lock(&shared.slot).take();
        log::info!("Closed session on {}", shared.doc_id);
    }
}

impl Drop for CollaborationSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl std::fmt::Debug for CollaborationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollaborationSession")
            .field("doc_id", &self.shared.doc_id)
            .field("peer_id", &self.shared.peer_id)
            .field("detached", &self.is_detached())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackHub;
    use quire_core::{MemoryBackend, NewDocument};

    async fn setup(content: &str, identity: StaticIdentity) -> (SessionManager, Arc<MemoryBackend>, Uuid) {
        let backend = Arc::new(MemoryBackend::new());
        let doc = backend
            .create_document(NewDocument::new("Notes", content, "alice"))
            .await
            .unwrap();
        let manager = SessionManager::new(
            backend.clone(),
            VersionControl::with_defaults(backend.clone()),
            Arc::new(LoopbackHub::default()),
            Arc::new(identity),
        );
        (manager, backend, doc.id)
    }

    #[test]
    fn test_initial_state() {
        let state = SessionState::default();
        assert!(state.is_loading);
        assert!(!state.is_connected);
        assert!(state.users.is_empty());
        assert!(state.error.is_none());
    }

    #[test]
    fn test_reconnect_delay_doubles_up_to_cap() {
        let policy = ReconnectConfig {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            max_attempts: 3,
            enabled: true,
        };
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
        assert_eq!(policy.delay(4), Duration::from_millis(500));
        assert_eq!(policy.delay(u32::MAX), Duration::from_millis(500));
        assert!(!policy.exhausted(3));
        assert!(policy.exhausted(4));
        assert!(!ReconnectConfig::default().exhausted(1_000));
    }

    #[test]
    fn test_static_identity() {
        assert_eq!(StaticIdentity::new("bob").current_user().as_deref(), Some("bob"));
        assert!(StaticIdentity::anonymous().current_user().is_none());
    }

    #[tokio::test]
    async fn test_open_seeds_replica_from_record() {
        let (manager, _, doc) = setup("hello", StaticIdentity::new("alice")).await;
        let session = manager
            .open(doc, CollaborationUser::new("alice", "Alice"), SessionOptions::for_testing())
            .await
            .unwrap();

        assert_eq!(session.text(), "hello");
        let state = session.state();
        assert!(!state.is_loading);
        assert!(state.is_connected);
        assert_eq!(state.users.len(), 1);
        assert_eq!(state.users[0].name, "Alice");
    }

    #[tokio::test]
    async fn test_open_missing_document_releases_claim() {
        let (manager, _, _) = setup("", StaticIdentity::new("alice")).await;
        let missing = Uuid::new_v4();
        let err = manager
            .open(missing, CollaborationUser::new("alice", "Alice"), SessionOptions::for_testing())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::NotFound(id) if id == missing));
        assert!(!manager.is_open(missing));
    }

    #[tokio::test]
    async fn test_second_open_rejected_until_disconnect() {
        let (manager, _, doc) = setup("x", StaticIdentity::new("alice")).await;
        let user = CollaborationUser::new("alice", "Alice");
        let session = manager.open(doc, user.clone(), SessionOptions::for_testing()).await.unwrap();

        let err = manager.open(doc, user.clone(), SessionOptions::for_testing()).await.unwrap_err();
        assert!(matches!(err, SessionError::AlreadyOpen(_)));

        session.disconnect();
        session.disconnect();
        assert!(!manager.is_open(doc));
        assert!(matches!(session.insert(0, "y"), Err(SessionError::Detached)));
        manager.open(doc, user, SessionOptions::for_testing()).await.unwrap();
    }

    #[tokio::test]
    async fn test_save_without_identity_records_error() {
        let (manager, backend, doc) = setup("draft", StaticIdentity::anonymous()).await;
        let session = manager
            .open(doc, CollaborationUser::new("anon", "Anon"), SessionOptions::for_testing())
            .await
            .unwrap();

        let err = session.save(None).await.unwrap_err();
        assert!(matches!(err, SessionError::NotAuthenticated));
        assert!(session.state().error.is_some());
        assert!(session.state().is_connected);
        assert_eq!(backend.get_document(doc).await.unwrap().version, 0);
    }

    #[tokio::test]
    async fn test_compare_versions_keeps_argument_order() {
        let (manager, _, doc) = setup("hello", StaticIdentity::new("alice")).await;
        let session = manager
            .open(doc, CollaborationUser::new("alice", "Alice"), SessionOptions::for_testing())
            .await
            .unwrap();

        session.save(None).await.unwrap();
        session.insert(5, "\nworld").unwrap();
        session.save(None).await.unwrap();

        let history = session.get_version_history().await.unwrap();
        let (v2, v1) = (history[0].id, history[1].id);
        let forward = session.compare_versions(v1, v2).await.unwrap();
        assert_eq!(forward.additions, vec![serde_json::json!("world")]);
        let backward = session.compare_versions(v2, v1).await.unwrap();
        assert_eq!(backward.deletions, vec![serde_json::json!("world")]);
    }
}
