//! Presence (awareness) for collaboration sessions.
//!
//! Each peer owns one JSON state map and is the only writer of it. States
//! travel as [`AwarenessUpdate`]s stamped with a per-peer clock; an update
//! older than what we already hold is ignored.
//!
//! ```text
//! set_local_field("user", …) ──► AwarenessUpdate ──► transport
//!                                                        │
//! remote PresenceChannel ◄── apply_remote ◄──────────────┘
//!         │
//!         └── watch counter bump ──► session recomputes peers()
//! ```
//!
//! The peer list is never patched incrementally: [`PresenceChannel::peers`]
//! rebuilds it from the full state map on every call.
//!
//! Reference: Kleppmann, Chapter 8 — Broadcast Protocols

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::ProtocolError;

/// State key holding the serialized [`CollaborationUser`].
pub const USER_FIELD: &str = "user";
/// State key holding the serialized [`CursorRange`].
pub const CURSOR_FIELD: &str = "cursor";

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// Display identity broadcast to other peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollaborationUser {
    pub id: String,
    pub name: String,
    /// Hex color (`#rrggbb`). Empty means "derive from id".
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub avatar: Option<String>,
}

impl CollaborationUser {
    /// User with a color derived from `id`.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            color: color_for(&id),
            id,
            name: name.into(),
            avatar: None,
        }
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = color.into();
        self
    }

    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar = Some(avatar.into());
        self
    }
}

/// Text selection in character positions. A caret has `anchor == head`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorRange {
    pub anchor: u32,
    pub head: u32,
}

impl CursorRange {
    pub fn caret(position: u32) -> Self {
        Self {
            anchor: position,
            head: position,
        }
    }
}

/// Stable, visually distinct color for a user id.
///
/// The hue comes from an FNV-1a hash of the id, with fixed saturation and
/// lightness so every cursor is equally readable.
pub fn color_for(id: &str) -> String {
    let hash = id
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325_u64, |h, b| (h ^ b as u64).wrapping_mul(0x0000_0100_0000_01b3));
    let hue = (hash % 360) as f32 / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// Wire payload
// ───────────────────────────────────────────────────────────────────

/// One peer's full awareness state. `state: None` means the peer left.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    pub peer_id: Uuid,
    pub clock: u64,
    pub state: Option<Map<String, Value>>,
}

impl AwarenessUpdate {
    /// JSON, so states stay inspectable by non-Rust peers.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

// ───────────────────────────────────────────────────────────────────
// Channel
// ───────────────────────────────────────────────────────────────────

/// Awareness states of every known peer, the local one included.
pub struct PresenceChannel {
    local_id: Uuid,
    local_clock: u64,
    states: HashMap<Uuid, Map<String, Value>>,
    /// Highest clock seen per remote peer, kept after removal.
    clocks: HashMap<Uuid, u64>,
    changes: watch::Sender<u64>,
}

impl PresenceChannel {
    pub fn new(local_id: Uuid) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            local_id,
            local_clock: 0,
            states: HashMap::new(),
            clocks: HashMap::new(),
            changes,
        }
    }

    pub fn local_id(&self) -> Uuid {
        self.local_id
    }

    /// Set one field of the local state and return the update to broadcast.
    pub fn set_local_field(&mut self, key: &str, value: Value) -> AwarenessUpdate {
        self.states
            .entry(self.local_id)
            .or_default()
            .insert(key.to_string(), value);
        self.local_clock += 1;
        self.notify();
        self.local_update()
    }

    /// Publish the local cursor, or clear it with `None`.
    pub fn set_cursor(&mut self, cursor: Option<CursorRange>) -> AwarenessUpdate {
        let value = cursor
            .and_then(|c| serde_json::to_value(c).ok())
            .unwrap_or(Value::Null);
        self.set_local_field(CURSOR_FIELD, value)
    }

    /// Drop the local state entirely (sent on leave).
    pub fn clear_local_state(&mut self) -> AwarenessUpdate {
        self.states.remove(&self.local_id);
        self.local_clock += 1;
        self.notify();
        self.local_update()
    }

    /// Current local state as an update, for (re)announcing ourselves.
    pub fn local_update(&self) -> AwarenessUpdate {
        AwarenessUpdate {
            peer_id: self.local_id,
            clock: self.local_clock,
            state: self.states.get(&self.local_id).cloned(),
        }
    }

    /// Merge a remote peer's state. Returns whether anything changed.
    pub fn apply_remote(&mut self, update: AwarenessUpdate) -> bool {
        if update.peer_id == self.local_id {
            return false;
        }
        // An equal clock is still news when it brings back a peer we dropped.
        let stale = self.clocks.get(&update.peer_id).is_some_and(|&known| {
            update.clock < known
                || (update.clock == known
                    && (update.state.is_none() || self.states.contains_key(&update.peer_id)))
        });
        if stale {
            log::trace!("Ignoring stale awareness from {}", update.peer_id);
            return false;
        }

        self.clocks.insert(update.peer_id, update.clock);
        match update.state {
            Some(state) => {
                self.states.insert(update.peer_id, state);
            }
            None => {
                self.states.remove(&update.peer_id);
            }
        }
        self.notify();
        true
    }

    /// Forget a peer that left the channel.
    pub fn remove_peer(&mut self, peer_id: Uuid) -> bool {
        if peer_id == self.local_id || self.states.remove(&peer_id).is_none() {
            return false;
        }
        self.notify();
        true
    }

    /// Forget every remote peer (the channel went offline).
    pub fn retain_local(&mut self) -> bool {
        let before = self.states.len();
        let local_id = self.local_id;
        self.states.retain(|id, _| *id == local_id);
        if self.states.len() == before {
            return false;
        }
        self.notify();
        true
    }

    pub fn states(&self) -> &HashMap<Uuid, Map<String, Value>> {
        &self.states
    }

    /// Users present on the channel, ordered by peer id.
    ///
    /// Entries without a parseable `user` field are skipped.
    pub fn peers(&self) -> Vec<CollaborationUser> {
        let mut entries: Vec<(&Uuid, &Map<String, Value>)> = self.states.iter().collect();
        entries.sort_by_key(|(id, _)| **id);

        entries
            .into_iter()
            .filter_map(|(_, state)| {
                let raw = state.get(USER_FIELD)?;
                let mut user: CollaborationUser = serde_json::from_value(raw.clone()).ok()?;
                if user.color.is_empty() {
                    user.color = color_for(&user.id);
                }
                Some(user)
            })
            .collect()
    }

    /// Receiver whose value changes on every state change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn notify(&self) {
        self.changes.send_modify(|n| *n = n.wrapping_add(1));
    }
}
