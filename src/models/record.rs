//! Persisted records, cursors and per-item classification.

use super::remote_item::{Identity, RemoteItem};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The store's view of a remote item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub identity: Identity,

    pub global_id: i64,

    /// Last known remote update time.
    pub updated_at: DateTime<Utc>,

    /// Full payload as last written.
    pub payload: serde_json::Value,

    /// When this record was written locally.
    pub synced_at: DateTime<Utc>,
}

impl PersistedRecord {
    /// Build the record a store holds after upserting `item`.
    pub fn from_item(item: &RemoteItem, synced_at: DateTime<Utc>) -> Self {
        Self {
            identity: item.identity,
            global_id: item.global_id,
            updated_at: item.updated_at,
            payload: item.payload.clone(),
            synced_at,
        }
    }
}

/// High-water mark of the event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cursor {
    pub last_seen_global_id: i64,
}

impl Cursor {
    pub fn new(last_seen_global_id: i64) -> Self {
        Self {
            last_seen_global_id,
        }
    }

    /// Whether an event id was already observed by this cursor.
    ///
    /// Event ids grow monotonically, so anything at or below the mark is old.
    pub fn covers(&self, global_id: i64) -> bool {
        global_id <= self.last_seen_global_id
    }
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.last_seen_global_id)
    }
}

/// Outcome of comparing a fetched item against its stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    New,
    Updated,
    Unchanged,
}

impl Classification {
    /// Classify `fetched` against what the store holds for its identity.
    ///
    /// A stored `updated_at` later than the fetched one counts as unchanged.
    pub fn of(stored: Option<&PersistedRecord>, fetched: &RemoteItem) -> Self {
        match stored {
            None => Self::New,
            Some(record) if record.updated_at < fetched.updated_at => Self::Updated,
            Some(_) => Self::Unchanged,
        }
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Updated => write!(f, "updated"),
            Self::Unchanged => write!(f, "unchanged"),
        }
    }
}
