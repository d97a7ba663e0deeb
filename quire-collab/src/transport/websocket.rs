//! WebSocket transport talking to a [`RelayServer`](crate::relay::RelayServer).
//!
//! Provides:
//! - Connection lifecycle with a `Join`/`Welcome` handshake
//! - Background reader and writer tasks per connection
//! - Heartbeat pings while connected
//! - Offline queue for updates made while disconnected
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use super::{queue_offline, ConnectionStatus, OfflineQueue, Transport, TransportEvent, TransportFactory};
use crate::error::TransportError;
use crate::lock;
use crate::protocol::{MessageType, SyncMessage};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Relay base URL; the document id is appended as a path segment
    pub server_url: String,
    /// Maximum updates held while offline
    pub offline_queue_size: usize,
    /// Time allowed for connecting and receiving `Welcome`
    pub handshake_timeout: Duration,
    /// Interval between heartbeat pings
    pub heartbeat_interval: Duration,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            offline_queue_size: 10_000,
            handshake_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

impl WebSocketConfig {
    /// Short timeouts for tests.
    pub fn for_testing(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            offline_queue_size: 1_000,
            handshake_timeout: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(1),
        }
    }
}

/// Creates one [`WebSocketTransport`] per document.
#[derive(Debug, Clone)]
pub struct WebSocketFactory {
    config: WebSocketConfig,
}

impl WebSocketFactory {
    pub fn new(config: WebSocketConfig) -> Self {
        Self { config }
    }
}

impl TransportFactory for WebSocketFactory {
    fn create(&self, doc_id: Uuid, peer_id: Uuid) -> Arc<dyn Transport> {
        Arc::new(WebSocketTransport::new(self.config.clone(), doc_id, peer_id))
    }
}

pub struct WebSocketTransport {
    config: WebSocketConfig,
    doc_id: Uuid,
    peer_id: Uuid,
    status: Arc<Mutex<ConnectionStatus>>,
    /// Frames for the writer task of the live connection
    outgoing: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    offline: Mutex<OfflineQueue>,
    reader: Mutex<Option<JoinHandle<()>>>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl WebSocketTransport {
    pub fn new(config: WebSocketConfig, doc_id: Uuid, peer_id: Uuid) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let offline = OfflineQueue::new(config.offline_queue_size);
        Self {
            config,
            doc_id,
            peer_id,
            status: Arc::new(Mutex::new(ConnectionStatus::Disconnected)),
            outgoing: Mutex::new(None),
            offline: Mutex::new(offline),
            reader: Mutex::new(None),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
        }
    }

    pub fn url(&self) -> String {
        format!("{}/{}", self.config.server_url.trim_end_matches('/'), self.doc_id)
    }

    pub fn offline_queue_len(&self) -> usize {
        lock(&self.offline).len()
    }

    fn set_status(&self, status: ConnectionStatus) {
        *lock(&self.status) = status;
        let _ = self.event_tx.send(TransportEvent::Status(status));
    }

    fn fail(&self, err: TransportError) -> TransportError {
        *lock(&self.status) = ConnectionStatus::Disconnected;
        let _ = self
            .event_tx
            .send(TransportEvent::Status(ConnectionStatus::Disconnected));
        log::warn!("Connection to {} failed: {err}", self.url());
        err
    }

    async fn handshake(&self) -> Result<usize, TransportError> {
        let url = self.url();
        let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let join = SyncMessage::join(self.peer_id, self.doc_id).encode()?;
        ws_writer
            .send(Message::Binary(join.into()))
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        // Messages from peers may arrive before the relay's welcome.
        let peers = loop {
            match ws_reader.next().await {
                Some(Ok(Message::Binary(data))) => {
                    let msg = SyncMessage::decode(&data)?;
                    if msg.msg_type == MessageType::Welcome {
                        break msg.peer_count()? as usize;
                    }
                    if msg.peer_id != self.peer_id {
                        let _ = self.event_tx.send(TransportEvent::Message(msg));
                    }
                }
                Some(Ok(Message::Close(_))) | None => return Err(TransportError::Closed),
                Some(Err(e)) => return Err(TransportError::Connect(e.to_string())),
                Some(Ok(_)) => {}
            }
        };

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let heartbeat = self.config.heartbeat_interval;
        let peer_id = self.peer_id;

        // Writer: drains `outgoing` until the sender is dropped, then closes.
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat);
            ticker.tick().await;
            loop {
                tokio::select! {
                    frame = out_rx.recv() => match frame {
                        Some(data) => {
                            if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            let _ = ws_writer.close().await;
                            break;
                        }
                    },
                    _ = ticker.tick() => {
                        if let Ok(ping) = SyncMessage::ping(peer_id).encode() {
                            if ws_writer.send(Message::Binary(ping.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        });

        // Reader: forwards other peers' messages as events.
        let events = self.event_tx.clone();
        let status = self.status.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Binary(data)) => match SyncMessage::decode(&data) {
                        Ok(msg) if msg.peer_id == peer_id => {}
                        Ok(msg) if matches!(msg.msg_type, MessageType::Pong | MessageType::Welcome) => {}
                        Ok(msg) => {
                            if events.send(TransportEvent::Message(msg)).is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Dropping undecodable frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }

            let was_connected = {
                let mut current = lock(&status);
                let was = *current == ConnectionStatus::Connected;
                *current = ConnectionStatus::Disconnected;
                was
            };
            if was_connected {
                log::warn!("Connection lost for peer {peer_id}");
                let _ = events.send(TransportEvent::Status(ConnectionStatus::Disconnected));
            }
        });

        *lock(&self.outgoing) = Some(out_tx);
        *lock(&self.reader) = Some(reader);
        Ok(peers)
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self) -> Result<usize, TransportError> {
        if *lock(&self.status) == ConnectionStatus::Connected {
            return Ok(0);
        }
        self.set_status(ConnectionStatus::Connecting);

        let peers = match tokio::time::timeout(self.config.handshake_timeout, self.handshake()).await {
            Ok(Ok(peers)) => peers,
            Ok(Err(e)) => return Err(self.fail(e)),
            Err(_) => return Err(self.fail(TransportError::Timeout)),
        };

        self.set_status(ConnectionStatus::Connected);

        let queued = lock(&self.offline).drain();
        if !queued.is_empty() {
            log::info!("Replaying {} queued updates for {}", queued.len(), self.doc_id);
            for msg in queued {
                self.send(msg)?;
            }
        }

        log::info!("Connected to {} ({peers} peers present)", self.url());
        Ok(peers)
    }

    fn disconnect(&self) {
        let previous = std::mem::replace(&mut *lock(&self.status), ConnectionStatus::Disconnected);

        if let Some(reader) = lock(&self.reader).take() {
            reader.abort();
        }
        // Dropping the sender lets the writer flush `Leave` and close the socket.
        if let Some(out) = lock(&self.outgoing).take() {
            if let Ok(leave) = SyncMessage::leave(self.peer_id, self.doc_id).encode() {
                let _ = out.send(leave);
            }
        }

        if previous != ConnectionStatus::Disconnected {
            let _ = self
                .event_tx
                .send(TransportEvent::Status(ConnectionStatus::Disconnected));
            log::info!("Disconnected peer {} from {}", self.peer_id, self.doc_id);
        }
    }

    fn send(&self, msg: SyncMessage) -> Result<(), TransportError> {
        if *lock(&self.status) == ConnectionStatus::Connected {
            let encoded = msg.encode()?;
            if let Some(out) = lock(&self.outgoing).as_ref() {
                if out.send(encoded).is_ok() {
                    return Ok(());
                }
            }
        }
        queue_offline(&mut lock(&self.offline), msg)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        lock(&self.event_rx).take()
    }

    fn status(&self) -> ConnectionStatus {
        *lock(&self.status)
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}
