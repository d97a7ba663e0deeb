//! Replicated text backed by a Yrs document.
//!
//! Every session owns exactly one `ReplicatedText`. Local edits return the v1
//! update they produced so the caller can persist it to the local cache and
//! broadcast it; remote updates are merged with Yrs' own causal ordering.
//!
//! ```text
//! insert/delete/set_text ──► encode_update_v1 ──► cache + transport
//! transport ──► apply_remote ──► merged text
//! ```
//!
//! Positions are character indices. Yrs is configured with byte offsets, and
//! the conversion happens here so callers never split a code point.

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, OffsetKind, Options, ReadTxn, StateVector, Text, TextRef, Transact, Update};

use crate::error::ReplicaError;

/// Name of the shared root text.
pub const TEXT_NAME: &str = "content";

pub struct ReplicatedText {
    doc: Doc,
    text: TextRef,
}

impl ReplicatedText {
    pub fn new() -> Self {
        let doc = Doc::with_options(Options {
            offset_kind: OffsetKind::Bytes,
            ..Options::default()
        });
        let text = doc.get_or_insert_text(TEXT_NAME);
        Self { doc, text }
    }

    /// Current merged text.
    pub fn text(&self) -> String {
        let txn = self.doc.transact();
        self.text.get_string(&txn)
    }

    pub fn is_empty(&self) -> bool {
        let txn = self.doc.transact();
        self.text.len(&txn) == 0
    }

    /// Length in characters.
    pub fn char_len(&self) -> usize {
        self.text().chars().count()
    }

    /// Insert `chunk` before the character at `index`.
    pub fn insert(&self, index: usize, chunk: &str) -> Result<Vec<u8>, ReplicaError> {
        let mut txn = self.doc.transact_mut();
        let current = self.text.get_string(&txn);
        let offset = byte_offset(&current, index)?;
        self.text.insert(&mut txn, offset, chunk);
        Ok(txn.encode_update_v1())
    }

    /// Remove `len` characters starting at `index`.
    pub fn delete(&self, index: usize, len: usize) -> Result<Vec<u8>, ReplicaError> {
        let mut txn = self.doc.transact_mut();
        let current = self.text.get_string(&txn);
        let start = byte_offset(&current, index)?;
        let end_index = index.checked_add(len).ok_or_else(|| ReplicaError::OutOfBounds {
            index,
            len: current.chars().count(),
        })?;
        let end = byte_offset(&current, end_index)?;
        if end > start {
            self.text.remove_range(&mut txn, start, end - start);
        }
        Ok(txn.encode_update_v1())
    }

    /// Replace the whole text (clear, then insert) in a single transaction.
    ///
    /// This is an ordinary local edit: peers converge on it through the
    /// normal merge path.
    pub fn set_text(&self, content: &str) -> Vec<u8> {
        let mut txn = self.doc.transact_mut();
        let len = self.text.len(&txn);
        if len > 0 {
            self.text.remove_range(&mut txn, 0, len);
        }
        if !content.is_empty() {
            self.text.insert(&mut txn, 0, content);
        }
        txn.encode_update_v1()
    }

    /// Merge an update produced by another replica (or replayed from cache).
    pub fn apply_remote(&self, update: &[u8]) -> Result<(), ReplicaError> {
        let update = Update::decode_v1(update).map_err(|e| ReplicaError::Decode(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| ReplicaError::Apply(e.to_string()))
    }

    /// Full state as a single update, suitable for a snapshot.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Everything this replica has that the holder of `remote_sv` lacks.
    pub fn encode_diff(&self, remote_sv: &[u8]) -> Result<Vec<u8>, ReplicaError> {
        let sv = StateVector::decode_v1(remote_sv).map_err(|e| ReplicaError::Decode(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }
}

impl Default for ReplicatedText {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ReplicatedText {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedText")
            .field("len", &self.char_len())
            .finish()
    }
}

fn byte_offset(text: &str, index: usize) -> Result<u32, ReplicaError> {
    let out_of_bounds = || ReplicaError::OutOfBounds {
        index,
        len: text.chars().count(),
    };
    let offset = if index == 0 {
        0
    } else {
        text.char_indices()
            .nth(index)
            .map(|(i, _)| i)
            .or_else(|| (text.chars().count() == index).then_some(text.len()))
            .ok_or_else(out_of_bounds)?
    };
    u32::try_from(offset).map_err(|_| out_of_bounds())
}
