//! Capacity ledger.
//!
//! One `positionOccupancy` document per `(sessionId, positionId)` pair counts
//! the registrations currently holding that position. The document id is the
//! deterministic composite `"{sessionId}_{positionId}"`, so every reservation
//! attempt for the same pair contends on the same document and the store's
//! transaction serialization is the only concurrency control needed.
//!
//! Invariant: `count <= quantity` of the position at all times. Entries are
//! created lazily (a missing entry reads as `count = 0`) and only mutated by
//! the engine's reservation and release transactions.

use crate::document_store::{Document, DocumentKey, StoreError, from_document, to_document};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Identity of a ledger entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LedgerKey {
    /// Session the reservation belongs to
    pub session_id: String,
    /// Reserved position
    pub position_id: String,
}

impl LedgerKey {
    /// Create a ledger key.
    #[must_use]
    pub fn new(session_id: impl Into<String>, position_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            position_id: position_id.into(),
        }
    }

    /// Composite document id `"{sessionId}_{positionId}"`.
    #[must_use]
    pub fn document_id(&self) -> String {
        format!("{}_{}", self.session_id, self.position_id)
    }

    /// Document key inside the ledger collection.
    #[must_use]
    pub fn document_key(&self, collection: &str) -> DocumentKey {
        DocumentKey::new(collection, self.document_id())
    }
}

impl fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.session_id, self.position_id)
    }
}

/// Position has no remaining capacity.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Position full: {count} of {quantity} reserved")]
pub struct CapacityFull {
    /// Occupants at read time
    pub count: u32,
    /// Declared capacity
    pub quantity: u32,
}

/// Stored ledger entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionOccupancy {
    /// Session id
    pub session_id: String,
    /// Position id
    pub position_id: String,
    /// Current number of reservations
    pub count: u32,
}

impl PositionOccupancy {
    /// Entry with no reservations.
    #[must_use]
    pub fn empty(key: &LedgerKey) -> Self {
        Self {
            session_id: key.session_id.clone(),
            position_id: key.position_id.clone(),
            count: 0,
        }
    }

    /// Decode a stored entry, treating a missing document as empty.
    ///
    /// # Errors
    ///
    /// [`StoreError::Malformed`] if the document does not decode.
    pub fn from_stored(
        key: &LedgerKey,
        document_key: &DocumentKey,
        document: Option<&Document>,
    ) -> Result<Self, StoreError> {
        document.map_or_else(
            || Ok(Self::empty(key)),
            |doc| from_document(document_key, doc),
        )
    }

    /// Encode for storage.
    ///
    /// # Errors
    ///
    /// [`StoreError::Malformed`] if encoding fails.
    pub fn to_stored(&self) -> Result<Document, StoreError> {
        to_document(self)
    }

    /// Units still available against `quantity`.
    #[must_use]
    pub const fn remaining(&self, quantity: u32) -> u32 {
        quantity.saturating_sub(self.count)
    }

    /// Take one unit if capacity remains, returning the new count.
    ///
    /// # Errors
    ///
    /// [`CapacityFull`] when `count >= quantity`; the entry is left unchanged.
    pub const fn try_reserve(&mut self, quantity: u32) -> Result<u32, CapacityFull> {
        if self.count >= quantity {
            return Err(CapacityFull {
                count: self.count,
                quantity,
            });
        }
        self.count += 1;
        Ok(self.count)
    }

    /// Give back one unit. Returns `false` if the count was already zero.
    pub const fn release(&mut self) -> bool {
        if self.count == 0 {
            return false;
        }
        self.count -= 1;
        true
    }
}
