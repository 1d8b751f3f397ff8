//! State stores.
//!
//! A [`StateStore`] keeps the last known version of every remote item, keyed
//! by its natural [`Identity`]. Writes are unconditional upserts so replaying
//! the same remote set leaves the store unchanged.

pub mod memory;
pub mod rest;
pub mod sqlite;

use crate::error::PollError;
use crate::models::{Cursor, Identity, PersistedRecord, RemoteItem};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use memory::MemoryStore;
pub use rest::{RestStore, RestStoreConfig};
pub use sqlite::SqliteStore;

/// Durable record store used by the reconciler.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Check that the backing schema exists. Called once at startup.
    async fn verify_schema(&self) -> Result<(), PollError> {
        Ok(())
    }

    /// Fetch the stored record for `identity`. A miss is `Ok(None)`.
    async fn lookup(&self, identity: &Identity) -> Result<Option<PersistedRecord>, PollError>;

    /// Insert or replace the record for `item`. Last write wins.
    async fn upsert(&self, item: &RemoteItem, synced_at: DateTime<Utc>) -> Result<(), PollError>;

    /// Highest event id persisted so far.
    async fn last_cursor(&self) -> Result<Option<Cursor>, PollError>;

    /// Release connections. Safe to call more than once.
    async fn close(&self);
}
