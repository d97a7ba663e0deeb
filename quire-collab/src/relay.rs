//! WebSocket relay with room-per-document routing.
//!
//! Architecture:
//! ```text
//! Peer A ──┐
//!           ├── Room (doc_id) ── broadcast channel ──┬──► Peer A (own frames skipped)
//! Peer B ──┘                                         ├──► Peer B
//!                                                    └──► Peer C
//! ```
//!
//! The relay holds no document state. It answers `Join` with `Welcome`
//! (the number of peers already in the room), forwards every other frame
//! to the rest of the room unchanged, answers `Ping` with `Pong`, and
//! announces `Leave` when a socket closes. A peer that falls more than
//! `broadcast_capacity` frames behind is disconnected rather than silently
//! skipped, so its session reconnects and resynchronizes.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 8

use futures_util::{SinkExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{MessageType, SyncMessage};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per peer before it lags
    pub broadcast_capacity: usize,
    /// Joins beyond this are refused
    pub max_peers_per_room: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            max_peers_per_room: 100,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

struct Room {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    peers: HashSet<Uuid>,
}

impl Room {
    fn new(capacity: usize) -> Self {
        Self {
            sender: broadcast::channel(capacity.max(1)).0,
            peers: HashSet::new(),
        }
    }
}

type Rooms = Arc<RwLock<HashMap<Uuid, Room>>>;

pub struct RelayServer {
    config: RelayConfig,
    rooms: Rooms,
    stats: Arc<RwLock<RelayStats>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind `bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Relay listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Rooms,
        stats: Arc<RwLock<RelayStats>>,
        config: RelayConfig,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut membership: Option<(Uuid, Uuid)> = None;
        let mut room_rx: Option<broadcast::Receiver<Arc<Vec<u8>>>> = None;
        let mut room_tx: Option<broadcast::Sender<Arc<Vec<u8>>>> = None;

        let result: Result<(), BoxError> = async {
            loop {
                tokio::select! {
                    frame = ws_receiver.next() => {
                        match frame {
                            Some(Ok(Message::Binary(data))) => {
                                let msg = match SyncMessage::decode(&data) {
                                    Ok(msg) => msg,
                                    Err(e) => {
                                        log::warn!("Failed to decode frame from {addr}: {e}");
                                        continue;
                                    }
                                };
                                {
                                    let mut s = stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += data.len() as u64;
                                }

                                match msg.msg_type {
                                    MessageType::Join if membership.is_none() => {
                                        let joined = {
                                            let mut rooms_w = rooms.write().await;
                                            let room = rooms_w
                                                .entry(msg.doc_id)
                                                .or_insert_with(|| Room::new(config.broadcast_capacity));
                                            if room.peers.len() >= config.max_peers_per_room {
                                                None
                                            } else {
                                                let present = room.peers.len() as u32;
                                                room.peers.insert(msg.peer_id);
                                                Some((present, room.sender.clone(), room.sender.subscribe()))
                                            }
                                        };

                                        let Some((present, tx, rx)) = joined else {
                                            log::warn!("Room {} full, refusing {}", msg.doc_id, msg.peer_id);
                                            ws_sender.send(Message::Close(None)).await?;
                                            break;
                                        };

                                        let welcome = SyncMessage::welcome(msg.doc_id, present).encode()?;
                                        ws_sender.send(Message::Binary(welcome.into())).await?;
                                        let _ = tx.send(Arc::new(data.to_vec()));

                                        membership = Some((msg.peer_id, msg.doc_id));
                                        room_rx = Some(rx);
                                        room_tx = Some(tx);
                                        let active_rooms = rooms.read().await.len();
                                        stats.write().await.active_rooms = active_rooms;
                                        log::info!("Peer {} joined doc {} ({present} present)", msg.peer_id, msg.doc_id);
                                    }
                                    MessageType::Ping => {
                                        let pong = SyncMessage::pong(msg.peer_id).encode()?;
                                        ws_sender.send(Message::Binary(pong.into())).await?;
                                    }
                                    _ => match &room_tx {
                                        Some(tx) => {
                                            let _ = tx.send(Arc::new(data.to_vec()));
                                        }
                                        None => log::debug!("Ignoring {:?} before join from {addr}", msg.msg_type),
                                    },
                                }
                            }
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }
                            Some(Err(e)) => {
                                log::warn!("WebSocket error from {addr}: {e}");
                                break;
                            }
                            Some(Ok(_)) => {}
                        }
                    }

                    frame = async {
                        match room_rx.as_mut() {
                            Some(rx) => rx.recv().await,
                            None => std::future::pending().await,
                        }
                    } => {
                        match frame {
                            Ok(data) => {
                                let own = SyncMessage::decode(&data)
                                    .is_ok_and(|m| Some(m.peer_id) == membership.map(|(p, _)| p));
                                if !own {
                                    ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                // Skipped updates cannot be replayed; the peer resyncs on reconnect.
                                log::warn!("Peer {membership:?} lagged by {n} frames, closing");
                                ws_sender.send(Message::Close(None)).await?;
                                break;
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
            Ok(())
        }
        .await;

        if let Some((peer_id, doc_id)) = membership {
            let active_rooms = {
                let mut rooms_w = rooms.write().await;
                if let Some(room) = rooms_w.get_mut(&doc_id) {
                    room.peers.remove(&peer_id);
                    if let Ok(leave) = SyncMessage::leave(peer_id, doc_id).encode() {
                        let _ = room.sender.send(Arc::new(leave));
                    }
                    if room.peers.is_empty() {
                        rooms_w.remove(&doc_id);
                        log::info!("Room {doc_id} removed (empty)");
                    }
                }
                rooms_w.len()
            };
            stats.write().await.active_rooms = active_rooms;
        }
        stats.write().await.active_connections -= 1;

        result
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Number of peers currently joined to a document.
    pub async fn room_size(&self, doc_id: Uuid) -> usize {
        self.rooms
            .read()
            .await
            .get(&doc_id)
            .map_or(0, |room| room.peers.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_config_default() {
        let config = RelayConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.max_peers_per_room, 100);
    }

    #[tokio::test]
    async fn test_lagging_peer_is_disconnected() {
        use crate::transport::{ConnectionStatus, TransportEvent, TransportFactory};
        use crate::{WebSocketConfig, WebSocketFactory};
        use tokio::time::{timeout, Duration};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let relay = Arc::new(RelayServer::new(RelayConfig {
            bind_addr: url.clone(),
            broadcast_capacity: 2,
            max_peers_per_room: 10,
        }));
        let server = relay.clone();
        tokio::spawn(async move { server.serve(listener).await });

        let doc = Uuid::new_v4();
        let peer = WebSocketFactory::new(WebSocketConfig::for_testing(url)).create(doc, Uuid::new_v4());
        let mut events = peer.take_events().unwrap();
        peer.connect().await.unwrap();

        // Overrun the room's buffer before the peer's relay task can drain it.
        let sender = relay.rooms.read().await.get(&doc).unwrap().sender.clone();
        for clock in 0..16 {
            let frame = SyncMessage::update(Uuid::new_v4(), doc, clock, vec![0; 8]).encode().unwrap();
            sender.send(Arc::new(frame)).unwrap();
        }

        let closed = timeout(Duration::from_secs(2), async {
            while let Some(event) = events.recv().await {
                if matches!(event, TransportEvent::Status(ConnectionStatus::Disconnected)) {
                    return true;
                }
            }
            false
        })
        .await;
        assert_eq!(closed, Ok(true));
        assert_eq!(peer.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_relay_stats_initial() {
        let relay = RelayServer::with_defaults();
        let stats = relay.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_rooms, 0);
        assert_eq!(relay.room_size(Uuid::new_v4()).await, 0);
    }
}
