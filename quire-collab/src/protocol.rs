//! Binary protocol for replica synchronization.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ doc_id   │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ 16 bytes │ varint   │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! Handshake between peers that share a document:
//! ```text
//! newcomer ── Join ───────────► relay ── Welcome(peers) ──► newcomer
//! newcomer ── SyncStep1(sv) ──► peers
//! peers    ── SyncStep2(diff) ► newcomer
//! ```
//! After the handshake every local edit travels as an `Update`.
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::presence::AwarenessUpdate;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Sender's state vector; peers answer with `SyncStep2`
    SyncStep1 = 1,
    /// Updates the requester is missing
    SyncStep2 = 2,
    /// Incremental update from a local edit
    Update = 3,
    /// JSON awareness state
    Awareness = 4,
    /// Peer joined the document channel
    Join = 5,
    /// Peer left the document channel
    Leave = 6,
    Ping = 7,
    Pong = 8,
    /// Relay's reply to `Join`: number of other peers already present
    Welcome = 9,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub doc_id: Uuid,
    /// Sender-local counter, increases with every update sent
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, peer_id: Uuid, doc_id: Uuid, clock: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            peer_id,
            doc_id,
            clock,
            payload,
        }
    }

    pub fn update(peer_id: Uuid, doc_id: Uuid, clock: u64, yrs_update: Vec<u8>) -> Self {
        Self::new(MessageType::Update, peer_id, doc_id, clock, yrs_update)
    }

    pub fn sync_step1(peer_id: Uuid, doc_id: Uuid, state_vector: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep1, peer_id, doc_id, 0, state_vector)
    }

    pub fn sync_step2(peer_id: Uuid, doc_id: Uuid, state_diff: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep2, peer_id, doc_id, 0, state_diff)
    }

    pub fn awareness(doc_id: Uuid, update: &AwarenessUpdate) -> Result<Self, ProtocolError> {
        Ok(Self::new(
            MessageType::Awareness,
            update.peer_id,
            doc_id,
            update.clock,
            update.encode()?,
        ))
    }

    pub fn join(peer_id: Uuid, doc_id: Uuid) -> Self {
        Self::new(MessageType::Join, peer_id, doc_id, 0, Vec::new())
    }

    pub fn leave(peer_id: Uuid, doc_id: Uuid) -> Self {
        Self::new(MessageType::Leave, peer_id, doc_id, 0, Vec::new())
    }

    pub fn welcome(doc_id: Uuid, peers: u32) -> Self {
        Self::new(MessageType::Welcome, Uuid::nil(), doc_id, 0, peers.to_be_bytes().to_vec())
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self::new(MessageType::Ping, peer_id, Uuid::nil(), 0, Vec::new())
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self::new(MessageType::Pong, peer_id, Uuid::nil(), 0, Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse an awareness payload.
    pub fn awareness_update(&self) -> Result<AwarenessUpdate, ProtocolError> {
        if self.msg_type != MessageType::Awareness {
            return Err(ProtocolError::InvalidMessageType);
        }
        AwarenessUpdate::decode(&self.payload)
    }

    /// Parse a welcome payload.
    pub fn peer_count(&self) -> Result<u32, ProtocolError> {
        if self.msg_type != MessageType::Welcome {
            return Err(ProtocolError::InvalidMessageType);
        }
        let bytes: [u8; 4] = self
            .payload
            .as_slice()
            .try_into()
            .map_err(|_| ProtocolError::Deserialization("welcome payload must be 4 bytes".into()))?;
        Ok(u32::from_be_bytes(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    #[test]
    fn test_update_roundtrip() {
        let peer = Uuid::new_v4();
        let doc = Uuid::new_v4();
        let msg = SyncMessage::update(peer, doc, 42, vec![1, 2, 3, 4, 5]);

        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.msg_type, MessageType::Update);
    }

    #[test]
    fn test_awareness_roundtrip() {
        let mut state = Map::new();
        state.insert("user".into(), json!({"id": "u1", "name": "Ada"}));
        let update = AwarenessUpdate {
            peer_id: Uuid::new_v4(),
            clock: 7,
            state: Some(state),
        };

        let msg = SyncMessage::awareness(Uuid::new_v4(), &update).unwrap();
        assert_eq!(msg.peer_id, update.peer_id);
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.awareness_update().unwrap(), update);
    }

    #[test]
    fn test_welcome_peer_count() {
        let msg = SyncMessage::welcome(Uuid::new_v4(), 3);
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.peer_count().unwrap(), 3);
    }

    #[test]
    fn test_wrong_type_payload_accessors() {
        let ping = SyncMessage::ping(Uuid::new_v4());
        assert!(matches!(ping.awareness_update(), Err(ProtocolError::InvalidMessageType)));
        assert!(matches!(ping.peer_count(), Err(ProtocolError::InvalidMessageType)));

        let mut short = SyncMessage::welcome(Uuid::nil(), 1);
        short.payload.pop();
        assert!(matches!(short.peer_count(), Err(ProtocolError::Deserialization(_))));
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(SyncMessage::decode(&[0xFF, 0xFE, 0xFD]).is_err());
    }

    #[test]
    fn test_update_size_efficient() {
        let msg = SyncMessage::update(Uuid::new_v4(), Uuid::new_v4(), 1, vec![0u8; 50]);
        let encoded = msg.encode().unwrap();
        assert!(encoded.len() < 150, "Encoded size {} too large for 50-byte update", encoded.len());
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::SyncStep1 as u8, 1);
        assert_eq!(MessageType::Update as u8, 3);
        assert_eq!(MessageType::Welcome as u8, 9);
    }
}
