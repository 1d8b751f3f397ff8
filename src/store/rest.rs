//! PostgREST (Supabase) store.
//!
//! Records live in two remote tables: `gitlab_merge_requests` keyed by the
//! merge request id, and an events table (default `gitlab_events`) keyed by
//! the event id. Upserts use PostgREST's `resolution=merge-duplicates`.

use super::StateStore;
use crate::error::PollError;
use crate::models::remote_item::parse_timestamp;
use crate::models::{Cursor, Identity, PersistedRecord, RemoteItem};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};

/// Default events table name.
pub const DEFAULT_EVENTS_TABLE: &str = "gitlab_events";

/// Merge requests table name.
pub const MERGE_REQUESTS_TABLE: &str = "gitlab_merge_requests";

/// PostgREST error code for an undefined table.
const UNDEFINED_TABLE: &str = "42P01";

/// PostgREST schema-cache miss for an unknown table.
const SCHEMA_CACHE_MISS: &str = "PGRST205";

/// Connection settings for a PostgREST endpoint.
#[derive(Debug, Clone)]
pub struct RestStoreConfig {
    /// Project URL, e.g. `https://xyz.supabase.co`.
    pub url: String,

    /// Service key sent as `apikey` and bearer token.
    pub secret_key: String,

    pub events_table: String,

    pub timeout_secs: u64,
}

impl RestStoreConfig {
    pub fn new(url: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            secret_key: secret_key.into(),
            events_table: DEFAULT_EVENTS_TABLE.to_string(),
            timeout_secs: 30,
        }
    }
}

/// Store writing to a remote PostgREST service.
pub struct RestStore {
    client: Client,
    config: RestStoreConfig,
    closed: AtomicBool,
}

#[derive(Debug, Serialize)]
struct MergeRequestRow<'a> {
    gitlab_mr_id: i64,
    gitlab_mr_iid: i64,
    project_id: i64,
    title: &'a str,
    description: &'a str,
    state: &'a str,
    merged_by: Value,
    merge_user: Value,
    created_at: String,
    updated_at: String,
    author_id: i64,
    author_username: Value,
    assignee_id: Value,
    assignee_username: Value,
    reviewer_username: Option<&'a str>,
    source_branch: Value,
    target_branch: Value,
    merged_at: Value,
    closed_at: Value,
    reviewers: Value,
    labels: Value,
    has_conflicts: Value,
    blocking_discussions_resolved: Value,
    work_in_progress: Value,
    draft: Value,
    merge_status: Value,
    web_url: &'a str,
    raw_data: &'a Value,
    synced_at: String,
}

#[derive(Debug, Serialize)]
struct EventRow<'a> {
    gitlab_event_id: i64,
    action_name: &'a str,
    target_id: Value,
    target_iid: Option<i64>,
    target_type: Value,
    author_id: i64,
    author_username: Option<&'a str>,
    created_at: String,
    project_id: Option<i64>,
    target_title: &'a str,
    push_data: Value,
    note: Value,
    raw_data: &'a Value,
    synced_at: String,
}

#[derive(Debug, Deserialize)]
struct StoredRow {
    #[serde(alias = "gitlab_mr_id", alias = "gitlab_event_id")]
    id: i64,
    #[serde(alias = "created_at")]
    updated_at: String,
    raw_data: Value,
    synced_at: String,
}

#[derive(Debug, Deserialize)]
struct CursorRow {
    gitlab_event_id: i64,
}

#[derive(Debug, Deserialize)]
struct PostgrestError {
    code: Option<String>,
    message: Option<String>,
}

fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// A top-level field of the payload, or `null`.
fn field(payload: &Value, key: &str) -> Value {
    payload.get(key).cloned().unwrap_or(Value::Null)
}

/// `payload[key][inner]`, or `null` when either level is absent.
fn nested(payload: &Value, key: &str, inner: &str) -> Value {
    payload
        .get(key)
        .map(|value| field(value, inner))
        .unwrap_or(Value::Null)
}

impl RestStore {
    pub fn new(config: RestStoreConfig) -> Result<Self, PollError> {
        let mut headers = header::HeaderMap::new();
        let key = header::HeaderValue::from_str(&config.secret_key)
            .map_err(|_| PollError::initialization("Invalid SUPABASE_SECRET_KEY format"))?;
        let bearer = header::HeaderValue::from_str(&format!("Bearer {}", config.secret_key))
            .map_err(|_| PollError::initialization("Invalid SUPABASE_SECRET_KEY format"))?;
        headers.insert("apikey", key);
        headers.insert(header::AUTHORIZATION, bearer);

        let client = Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PollError::internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config,
            closed: AtomicBool::new(false),
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.config.url.trim_end_matches('/'), table)
    }

    async fn send(&self, request: RequestBuilder, operation: &str) -> Result<Response, PollError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PollError::persistence_with_op("Store is closed", operation));
        }

        let response = request
            .send()
            .await
            .map_err(|e| PollError::persistence_with_op(e.to_string(), operation))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<PostgrestError>(&body)
            .ok()
            .and_then(|e| e.message)
            .unwrap_or(body);
        Err(PollError::persistence_with_op(
            format!("{} ({})", message, status.as_u16()),
            operation,
        ))
    }

    async fn select<T: for<'de> Deserialize<'de>>(
        &self,
        table: &str,
        query: &[(&str, String)],
        operation: &str,
    ) -> Result<Vec<T>, PollError> {
        let request = self.client.get(self.table_url(table)).query(query);
        let response = self.send(request, operation).await?;
        response
            .json::<Vec<T>>()
            .await
            .map_err(|e| PollError::persistence_with_op(e.to_string(), operation))
    }

    async fn upsert_row<T: Serialize>(
        &self,
        table: &str,
        conflict_key: &str,
        row: &T,
        operation: &str,
    ) -> Result<(), PollError> {
        let request = self
            .client
            .post(self.table_url(table))
            .query(&[("on_conflict", conflict_key)])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&[row]);
        self.send(request, operation).await.map(|_| ())
    }

    /// Probe a table; `Ok(false)` when PostgREST reports it missing.
    async fn table_exists(&self, table: &str, key_column: &str) -> Result<bool, PollError> {
        let response = self
            .client
            .get(self.table_url(table))
            .query(&[("select", key_column), ("limit", "1")])
            .send()
            .await
            .map_err(|e| PollError::initialization(format!("Cannot reach {}: {}", self.config.url, e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(true);
        }

        let body = response.text().await.unwrap_or_default();
        let code = serde_json::from_str::<PostgrestError>(&body)
            .ok()
            .and_then(|e| e.code);
        match code.as_deref() {
            Some(UNDEFINED_TABLE) | Some(SCHEMA_CACHE_MISS) => Ok(false),
            _ if status == StatusCode::NOT_FOUND => Ok(false),
            _ if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN => {
                Err(PollError::initialization(format!(
                    "Supabase rejected the secret key ({})",
                    status.as_u16()
                )))
            }
            _ => Err(PollError::initialization(format!(
                "Checking table '{}' failed ({}): {}",
                table,
                status.as_u16(),
                body
            ))),
        }
    }

    fn events_ddl(&self) -> String {
        let table = &self.config.events_table;
        format!(
            r#"
CREATE TABLE {table} (
  id SERIAL PRIMARY KEY,
  gitlab_event_id BIGINT UNIQUE NOT NULL,
  action_name TEXT,
  target_id BIGINT,
  target_iid BIGINT,
  target_type TEXT,
  author_id BIGINT,
  author_username TEXT,
  created_at TIMESTAMPTZ,
  project_id BIGINT,
  target_title TEXT,
  push_data JSONB,
  note JSONB,
  raw_data JSONB,
  synced_at TIMESTAMPTZ,
  inserted_at TIMESTAMPTZ DEFAULT NOW()
);

CREATE INDEX idx_{table}_created_at ON {table}(created_at);
CREATE INDEX idx_{table}_project_id ON {table}(project_id);
"#
        )
    }

    fn merge_requests_ddl() -> String {
        format!(
            r#"
CREATE TABLE {MERGE_REQUESTS_TABLE} (
  id SERIAL PRIMARY KEY,
  gitlab_mr_id BIGINT UNIQUE NOT NULL,
  gitlab_mr_iid BIGINT NOT NULL,
  project_id BIGINT NOT NULL,
  title TEXT,
  description TEXT,
  state TEXT,
  merged_by TEXT,
  merge_user TEXT,
  created_at TIMESTAMPTZ,
  updated_at TIMESTAMPTZ,
  author_id BIGINT,
  author_username TEXT,
  assignee_id BIGINT,
  assignee_username TEXT,
  reviewer_username TEXT,
  source_branch TEXT,
  target_branch TEXT,
  merged_at TIMESTAMPTZ,
  closed_at TIMESTAMPTZ,
  reviewers JSONB,
  labels JSONB,
  has_conflicts BOOLEAN,
  blocking_discussions_resolved BOOLEAN,
  work_in_progress BOOLEAN,
  draft BOOLEAN,
  merge_status TEXT,
  web_url TEXT,
  raw_data JSONB,
  synced_at TIMESTAMPTZ,
  inserted_at TIMESTAMPTZ DEFAULT NOW()
);

CREATE UNIQUE INDEX idx_{MERGE_REQUESTS_TABLE}_project_iid ON {MERGE_REQUESTS_TABLE}(project_id, gitlab_mr_iid);
CREATE INDEX idx_{MERGE_REQUESTS_TABLE}_state ON {MERGE_REQUESTS_TABLE}(state);
CREATE INDEX idx_{MERGE_REQUESTS_TABLE}_reviewer_username ON {MERGE_REQUESTS_TABLE}(reviewer_username);
CREATE INDEX idx_{MERGE_REQUESTS_TABLE}_assignee_username ON {MERGE_REQUESTS_TABLE}(assignee_username);
"#
        )
    }
}

#[async_trait]
impl StateStore for RestStore {
    async fn verify_schema(&self) -> Result<(), PollError> {
        let mut missing = Vec::new();

        if !self.table_exists(&self.config.events_table, "gitlab_event_id").await? {
            log::error!(
                "Table '{}' does not exist. Create it with:\n{}",
                self.config.events_table,
                self.events_ddl()
            );
            missing.push(self.config.events_table.clone());
        }
        if !self.table_exists(MERGE_REQUESTS_TABLE, "gitlab_mr_id").await? {
            log::error!(
                "Table '{}' does not exist. Create it with:\n{}",
                MERGE_REQUESTS_TABLE,
                Self::merge_requests_ddl()
            );
            missing.push(MERGE_REQUESTS_TABLE.to_string());
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(PollError::initialization(format!(
                "Required Supabase tables are missing: {}",
                missing.join(", ")
            )))
        }
    }

    async fn lookup(&self, identity: &Identity) -> Result<Option<PersistedRecord>, PollError> {
        let rows: Vec<StoredRow> = match *identity {
            Identity::Scoped {
                project_id,
                local_sequence,
            } => {
                self.select(
                    MERGE_REQUESTS_TABLE,
                    &[
                        ("select", "gitlab_mr_id,updated_at,raw_data,synced_at".to_string()),
                        ("project_id", format!("eq.{}", project_id)),
                        ("gitlab_mr_iid", format!("eq.{}", local_sequence)),
                        ("limit", "1".to_string()),
                    ],
                    "lookup merge request",
                )
                .await?
            }
            Identity::Global { global_id } => {
                self.select(
                    &self.config.events_table,
                    &[
                        ("select", "gitlab_event_id,created_at,raw_data,synced_at".to_string()),
                        ("gitlab_event_id", format!("eq.{}", global_id)),
                        ("limit", "1".to_string()),
                    ],
                    "lookup event",
                )
                .await?
            }
        };

        rows.into_iter()
            .next()
            .map(|row| {
                Ok(PersistedRecord {
                    identity: *identity,
                    global_id: row.id,
                    updated_at: parse_timestamp(&row.updated_at)?,
                    payload: row.raw_data,
                    synced_at: parse_timestamp(&row.synced_at)?,
                })
            })
            .transpose()
    }

    async fn upsert(&self, item: &RemoteItem, synced_at: DateTime<Utc>) -> Result<(), PollError> {
        let synced_at = format_timestamp(&synced_at);
        let payload = &item.payload;

        match item.identity {
            Identity::Scoped {
                project_id,
                local_sequence,
            } => {
                let row = MergeRequestRow {
                    gitlab_mr_id: item.global_id,
                    gitlab_mr_iid: local_sequence,
                    project_id,
                    title: &item.title,
                    description: &item.description,
                    state: &item.state,
                    merged_by: nested(payload, "merged_by", "username"),
                    merge_user: nested(payload, "merge_user", "username"),
                    created_at: format_timestamp(&item.created_at),
                    updated_at: format_timestamp(&item.updated_at),
                    author_id: item.author_id,
                    author_username: nested(payload, "author", "username"),
                    assignee_id: nested(payload, "assignee", "id"),
                    assignee_username: nested(payload, "assignee", "username"),
                    reviewer_username: item.reviewer.as_deref(),
                    source_branch: field(payload, "source_branch"),
                    target_branch: field(payload, "target_branch"),
                    merged_at: field(payload, "merged_at"),
                    closed_at: field(payload, "closed_at"),
                    reviewers: field(payload, "reviewers"),
                    labels: field(payload, "labels"),
                    has_conflicts: field(payload, "has_conflicts"),
                    blocking_discussions_resolved: field(payload, "blocking_discussions_resolved"),
                    work_in_progress: field(payload, "work_in_progress"),
                    draft: field(payload, "draft"),
                    merge_status: field(payload, "merge_status"),
                    web_url: &item.web_url,
                    raw_data: payload,
                    synced_at,
                };
                self.upsert_row(MERGE_REQUESTS_TABLE, "gitlab_mr_id", &row, "upsert merge request")
                    .await
            }
            Identity::Global { global_id } => {
                let row = EventRow {
                    gitlab_event_id: global_id,
                    action_name: &item.state,
                    target_id: field(payload, "target_id"),
                    target_iid: item.local_sequence,
                    target_type: field(payload, "target_type"),
                    author_id: item.author_id,
                    author_username: item.author_name.as_deref(),
                    created_at: format_timestamp(&item.created_at),
                    project_id: item.project_id,
                    target_title: &item.title,
                    push_data: field(payload, "push_data"),
                    note: field(payload, "note"),
                    raw_data: payload,
                    synced_at,
                };
                self.upsert_row(&self.config.events_table, "gitlab_event_id", &row, "upsert event")
                    .await
            }
        }
    }

    async fn last_cursor(&self) -> Result<Option<Cursor>, PollError> {
        let rows: Vec<CursorRow> = self
            .select(
                &self.config.events_table,
                &[
                    ("select", "gitlab_event_id".to_string()),
                    ("order", "gitlab_event_id.desc".to_string()),
                    ("limit", "1".to_string()),
                ],
                "last cursor",
            )
            .await?;

        Ok(rows.first().map(|row| Cursor::new(row.gitlab_event_id)))
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            log::info!("Supabase store closed");
        }
    }
}
