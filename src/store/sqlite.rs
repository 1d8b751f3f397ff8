//! Embedded SQLite store.

use super::StateStore;
use crate::db::{self, pool::DbPool};
use crate::error::PollError;
use crate::models::remote_item::parse_timestamp;
use crate::models::{Cursor, Identity, PersistedRecord, RemoteItem};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

/// Store backed by a local SQLite file in WAL mode.
pub struct SqliteStore {
    pool: DbPool,
    closed: AtomicBool,
}

/// Row shape shared by both lookup queries: id, timestamp, payload, synced_at.
type RecordRow = (i64, String, String, String);

fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn record_from_row(identity: Identity, row: RecordRow) -> Result<PersistedRecord, PollError> {
    let (global_id, updated_at, data, synced_at) = row;
    Ok(PersistedRecord {
        identity,
        global_id,
        updated_at: parse_timestamp(&updated_at)?,
        payload: serde_json::from_str(&data)?,
        synced_at: parse_timestamp(&synced_at)?,
    })
}

impl SqliteStore {
    /// Open (creating if needed) the database at `db_path` and apply migrations.
    pub async fn open(db_path: &Path) -> Result<Self, PollError> {
        let pool = db::initialize(db_path)
            .await
            .map_err(|e| PollError::initialization(format!("Failed to open {}: {}", db_path.display(), e)))?;
        log::info!("Using SQLite store at {}", db_path.display());
        Ok(Self::from_pool(pool))
    }

    /// Wrap an already migrated pool.
    pub fn from_pool(pool: DbPool) -> Self {
        Self {
            pool,
            closed: AtomicBool::new(false),
        }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    async fn upsert_merge_request(
        &self,
        item: &RemoteItem,
        project_id: i64,
        iid: i64,
        synced_at: &str,
    ) -> Result<(), PollError> {
        sqlx::query(
            r#"
            INSERT INTO merge_requests (
                id, iid, project_id, title, description, state,
                created_at, updated_at, web_url, author_id, reviewer_username,
                data, synced_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(iid, project_id) DO UPDATE SET
                id = excluded.id,
                title = excluded.title,
                description = excluded.description,
                state = excluded.state,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                web_url = excluded.web_url,
                author_id = excluded.author_id,
                reviewer_username = excluded.reviewer_username,
                data = excluded.data,
                synced_at = excluded.synced_at
            "#,
        )
        .bind(item.global_id)
        .bind(iid)
        .bind(project_id)
        .bind(&item.title)
        .bind(&item.description)
        .bind(&item.state)
        .bind(format_timestamp(&item.created_at))
        .bind(format_timestamp(&item.updated_at))
        .bind(&item.web_url)
        .bind(item.author_id)
        .bind(&item.reviewer)
        .bind(item.payload.to_string())
        .bind(synced_at)
        .execute(&self.pool)
        .await
        .map_err(|e| PollError::persistence_with_op(e.to_string(), "upsert merge request"))?;

        Ok(())
    }

    async fn upsert_event(&self, item: &RemoteItem, synced_at: &str) -> Result<(), PollError> {
        sqlx::query(
            r#"
            INSERT INTO events (
                id, project_id, action_name, target_iid, title,
                author_id, created_at, data, synced_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                project_id = excluded.project_id,
                action_name = excluded.action_name,
                target_iid = excluded.target_iid,
                title = excluded.title,
                author_id = excluded.author_id,
                created_at = excluded.created_at,
                data = excluded.data,
                synced_at = excluded.synced_at
            "#,
        )
        .bind(item.global_id)
        .bind(item.project_id)
        .bind(&item.state)
        .bind(item.local_sequence)
        .bind(&item.title)
        .bind(item.author_id)
        .bind(format_timestamp(&item.created_at))
        .bind(item.payload.to_string())
        .bind(synced_at)
        .execute(&self.pool)
        .await
        .map_err(|e| PollError::persistence_with_op(e.to_string(), "upsert event"))?;

        Ok(())
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn lookup(&self, identity: &Identity) -> Result<Option<PersistedRecord>, PollError> {
        let row: Option<RecordRow> = match *identity {
            Identity::Scoped {
                project_id,
                local_sequence,
            } => {
                sqlx::query_as(
                    "SELECT id, updated_at, data, synced_at FROM merge_requests WHERE project_id = ? AND iid = ?",
                )
                .bind(project_id)
                .bind(local_sequence)
                .fetch_optional(&self.pool)
                .await
            }
            Identity::Global { global_id } => {
                sqlx::query_as("SELECT id, created_at, data, synced_at FROM events WHERE id = ?")
                    .bind(global_id)
                    .fetch_optional(&self.pool)
                    .await
            }
        }
        .map_err(|e| PollError::persistence_with_op(e.to_string(), "lookup"))?;

        row.map(|row| record_from_row(*identity, row)).transpose()
    }

    async fn upsert(&self, item: &RemoteItem, synced_at: DateTime<Utc>) -> Result<(), PollError> {
        let synced_at = format_timestamp(&synced_at);
        match item.identity {
            Identity::Scoped {
                project_id,
                local_sequence,
            } => {
                self.upsert_merge_request(item, project_id, local_sequence, &synced_at)
                    .await
            }
            Identity::Global { .. } => self.upsert_event(item, &synced_at).await,
        }
    }

    async fn last_cursor(&self) -> Result<Option<Cursor>, PollError> {
        let (max_id,): (Option<i64>,) = sqlx::query_as("SELECT MAX(id) FROM events")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| PollError::persistence_with_op(e.to_string(), "last cursor"))?;

        Ok(max_id.map(Cursor::new))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pool.close().await;
        log::info!("SQLite store closed");
    }
}
