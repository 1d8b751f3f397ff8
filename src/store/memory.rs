//! In-process store.

use super::StateStore;
use crate::error::PollError;
use crate::models::{Cursor, Identity, PersistedRecord, RemoteItem};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

/// Keeps records in a map. Used for tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<Identity, PersistedRecord>>,
    close_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the stored record for `identity`.
    pub fn get(&self, identity: &Identity) -> Option<PersistedRecord> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(identity)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many times [`StateStore::close`] was called.
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn lookup(&self, identity: &Identity) -> Result<Option<PersistedRecord>, PollError> {
        Ok(self.get(identity))
    }

    async fn upsert(&self, item: &RemoteItem, synced_at: DateTime<Utc>) -> Result<(), PollError> {
        self.records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(item.identity, PersistedRecord::from_item(item, synced_at));
        Ok(())
    }

    async fn last_cursor(&self) -> Result<Option<Cursor>, PollError> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        Ok(records
            .keys()
            .filter_map(|identity| match identity {
                Identity::Global { global_id } => Some(*global_id),
                Identity::Scoped { .. } => None,
            })
            .max()
            .map(Cursor::new))
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::remote_item::{parse_timestamp, ItemKind};
    use serde_json::json;

    fn event(id: i64) -> RemoteItem {
        let at = parse_timestamp("2024-01-15T10:30:00Z").unwrap();
        RemoteItem {
            kind: ItemKind::Event,
            identity: Identity::Global { global_id: id },
            global_id: id,
            project_id: Some(10),
            local_sequence: None,
            title: "pushed to".to_string(),
            description: String::new(),
            state: "pushed to".to_string(),
            created_at: at,
            updated_at: at,
            author_id: 1,
            author_name: None,
            reviewer: None,
            web_url: String::new(),
            payload: json!({ "id": id }),
        }
    }

    #[tokio::test]
    async fn test_upsert_then_lookup() {
        let store = MemoryStore::new();
        let item = event(7);

        assert!(store.lookup(&item.identity).await.unwrap().is_none());
        store.upsert(&item, Utc::now()).await.unwrap();

        let record = store.lookup(&item.identity).await.unwrap().unwrap();
        assert_eq!(record.global_id, 7);
        assert_eq!(record.payload, json!({ "id": 7 }));
    }

    #[tokio::test]
    async fn test_last_cursor_is_highest_event() {
        let store = MemoryStore::new();
        assert_eq!(store.last_cursor().await.unwrap(), None);

        for id in [3, 9, 5] {
            store.upsert(&event(id), Utc::now()).await.unwrap();
        }
        assert_eq!(store.last_cursor().await.unwrap(), Some(Cursor::new(9)));
        assert_eq!(store.len(), 3);
    }
}
