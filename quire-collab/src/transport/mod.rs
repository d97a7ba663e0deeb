//! Realtime channels that carry [`SyncMessage`]s between peers of a document.
//!
//! ```text
//! ┌──────────────┐  send(SyncMessage)   ┌───────────────┐
//! │   Session    │ ───────────────────► │   Transport   │ ──► relay / hub
//! │   driver     │ ◄─────────────────── │ (per document)│ ◄──
//! └──────────────┘    TransportEvent    └───────────────┘
//! ```
//!
//! A transport only moves messages; merge and presence semantics live in the
//! session. Updates sent while disconnected wait in an [`OfflineQueue`] and
//! are replayed on the next connect.

pub mod loopback;
pub mod websocket;

pub use loopback::{LoopbackHub, LoopbackTransport};
pub use websocket::{WebSocketConfig, WebSocketFactory, WebSocketTransport};

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::TransportError;
use crate::protocol::{MessageType, SyncMessage};

/// Connection status as seen by the local peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by a transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Status(ConnectionStatus),
    /// A message from another peer (own messages are never delivered)
    Message(SyncMessage),
    Error(TransportError),
}

/// One document's realtime channel.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Join the document channel. Returns the number of other peers present.
    async fn connect(&self) -> Result<usize, TransportError>;

    /// Leave the channel and release background tasks. Safe to call repeatedly.
    fn disconnect(&self);

    /// Send to every other peer. Updates are queued while offline; other
    /// message types are dropped.
    fn send(&self, msg: SyncMessage) -> Result<(), TransportError>;

    /// Event stream. Only the first call returns `Some`.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;

    fn status(&self) -> ConnectionStatus;
}

/// Builds a transport for a document.
pub trait TransportFactory: Send + Sync {
    fn create(&self, doc_id: Uuid, peer_id: Uuid) -> Arc<dyn Transport>;
}

// ───────────────────────────────────────────────────────────────────
// Offline queue
// ───────────────────────────────────────────────────────────────────

/// Updates produced while disconnected, replayed in order on reconnect.
#[derive(Debug)]
pub struct OfflineQueue {
    queue: VecDeque<SyncMessage>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an update. Returns `false` when the queue is full.
    pub fn enqueue(&mut self, msg: SyncMessage) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(msg);
        true
    }

    pub fn drain(&mut self) -> Vec<SyncMessage> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|m| m.payload.len()).sum()
    }
}

/// Shared offline rule: queue updates, drop everything else.
pub(crate) fn queue_offline(queue: &mut OfflineQueue, msg: SyncMessage) -> Result<(), TransportError> {
    match msg.msg_type {
        MessageType::Update => {
            if queue.enqueue(msg) {
                Ok(())
            } else {
                Err(TransportError::QueueFull(queue.len()))
            }
        }
        other => {
            log::trace!("Dropping {other:?} while offline");
            Ok(())
        }
    }
}
