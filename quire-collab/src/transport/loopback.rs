//! In-process transport: every document is a tokio broadcast channel.
//!
//! Useful for tests and for embedding several sessions in one process. The
//! hub plays the relay's role, so sessions see the same message flow they
//! would see over a WebSocket.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{queue_offline, ConnectionStatus, OfflineQueue, Transport, TransportEvent, TransportFactory};
use crate::error::TransportError;
use crate::lock;
use crate::protocol::SyncMessage;

type Room = broadcast::Sender<Arc<Vec<u8>>>;

struct Channel {
    sender: Room,
    members: usize,
}

/// Fan-out hub shared by all loopback transports of a process.
#[derive(Clone)]
pub struct LoopbackHub {
    rooms: Arc<Mutex<HashMap<Uuid, Channel>>>,
    capacity: usize,
    offline_queue_size: usize,
}

impl LoopbackHub {
    /// `capacity` messages are buffered per receiver before it lags.
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
            offline_queue_size: 10_000,
        }
    }

    /// Join a document's channel, creating it on first use. Returns the
    /// channel, a receiver and the number of members already present.
    fn join(&self, doc_id: Uuid) -> (Room, broadcast::Receiver<Arc<Vec<u8>>>, usize) {
        let mut rooms = lock(&self.rooms);
        let channel = rooms.entry(doc_id).or_insert_with(|| Channel {
            sender: broadcast::channel(self.capacity).0,
            members: 0,
        });
        let present = channel.members;
        channel.members += 1;
        (channel.sender.clone(), channel.sender.subscribe(), present)
    }

    /// Leave a document's channel; the last member out removes it.
    fn leave(&self, doc_id: Uuid) {
        let mut rooms = lock(&self.rooms);
        if let Some(channel) = rooms.get_mut(&doc_id) {
            channel.members = channel.members.saturating_sub(1);
            if channel.members == 0 {
                rooms.remove(&doc_id);
                log::debug!("Loopback room {doc_id} removed (empty)");
            }
        }
    }

    /// Number of transports currently connected to a document.
    pub fn peer_count(&self, doc_id: Uuid) -> usize {
        lock(&self.rooms)
            .get(&doc_id)
            .map_or(0, |channel| channel.members)
    }

    /// Documents with at least one connected transport.
    pub fn room_count(&self) -> usize {
        lock(&self.rooms).len()
    }
}

impl Default for LoopbackHub {
    fn default() -> Self {
        Self::new(256)
    }
}

impl TransportFactory for LoopbackHub {
    fn create(&self, doc_id: Uuid, peer_id: Uuid) -> Arc<dyn Transport> {
        Arc::new(LoopbackTransport::new(self.clone(), doc_id, peer_id))
    }
}

pub struct LoopbackTransport {
    hub: LoopbackHub,
    doc_id: Uuid,
    peer_id: Uuid,
    status: Arc<Mutex<ConnectionStatus>>,
    room: Mutex<Option<Room>>,
    offline: Mutex<OfflineQueue>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl LoopbackTransport {
    pub fn new(hub: LoopbackHub, doc_id: Uuid, peer_id: Uuid) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let offline = OfflineQueue::new(hub.offline_queue_size);
        Self {
            hub,
            doc_id,
            peer_id,
            status: Arc::new(Mutex::new(ConnectionStatus::Disconnected)),
            room: Mutex::new(None),
            offline: Mutex::new(offline),
            forwarder: Mutex::new(None),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
        }
    }

    fn publish(&self, room: &Room, msg: &SyncMessage) -> Result<(), TransportError> {
        let encoded = msg.encode()?;
        // No receivers just means nobody else is listening.
        let _ = room.send(Arc::new(encoded));
        Ok(())
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(&self) -> Result<usize, TransportError> {
        if *lock(&self.status) == ConnectionStatus::Connected {
            return Ok(self.hub.peer_count(self.doc_id).saturating_sub(1));
        }

        let (room, mut rx, peers) = self.hub.join(self.doc_id);

        let events = self.event_tx.clone();
        let status = self.status.clone();
        let own_id = self.peer_id;
        let doc_id = self.doc_id;
        let forwarder = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(bytes) => match SyncMessage::decode(&bytes) {
                        Ok(msg) if msg.peer_id == own_id => {}
                        Ok(msg) => {
                            if events.send(TransportEvent::Message(msg)).is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Dropping undecodable loopback message: {e}"),
                    },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Loopback peer {own_id} lagged by {n} messages on {doc_id}");
                        let _ = events.send(TransportEvent::Error(TransportError::Lagged(n)));
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        *lock(&status) = ConnectionStatus::Disconnected;
                        let _ = events.send(TransportEvent::Status(ConnectionStatus::Disconnected));
                        break;
                    }
                }
            }
        });

        *lock(&self.forwarder) = Some(forwarder);
        *lock(&self.room) = Some(room.clone());
        *lock(&self.status) = ConnectionStatus::Connected;

        self.publish(&room, &SyncMessage::join(self.peer_id, self.doc_id))?;
        let _ = self
            .event_tx
            .send(TransportEvent::Status(ConnectionStatus::Connected));

        let queued = lock(&self.offline).drain();
        if !queued.is_empty() {
            log::info!("Replaying {} queued updates for {}", queued.len(), self.doc_id);
            for msg in &queued {
                self.publish(&room, msg)?;
            }
        }

        log::debug!("Loopback peer {} joined {} ({peers} already present)", self.peer_id, self.doc_id);
        Ok(peers)
    }

    fn disconnect(&self) {
        let previous = std::mem::replace(&mut *lock(&self.status), ConnectionStatus::Disconnected);
        if let Some(task) = lock(&self.forwarder).take() {
            task.abort();
        }
        if let Some(room) = lock(&self.room).take() {
            let _ = self.publish(&room, &SyncMessage::leave(self.peer_id, self.doc_id));
            self.hub.leave(self.doc_id);
        }
        if previous != ConnectionStatus::Disconnected {
            let _ = self
                .event_tx
                .send(TransportEvent::Status(ConnectionStatus::Disconnected));
            log::debug!("Loopback peer {} left {}", self.peer_id, self.doc_id);
        }
    }

    fn send(&self, msg: SyncMessage) -> Result<(), TransportError> {
        let room = lock(&self.room).clone();
        match room {
            Some(room) if *lock(&self.status) == ConnectionStatus::Connected => self.publish(&room, &msg),
            _ => queue_offline(&mut lock(&self.offline), msg),
        }
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        lock(&self.event_rx).take()
    }

    fn status(&self) -> ConnectionStatus {
        *lock(&self.status)
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}
