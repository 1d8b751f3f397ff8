//! Merge request polling against a mock GitLab and a real SQLite file.
//!
//! Each test wires the production collaborators (HTTP client, fetcher,
//! SQLite store, reconciler) and swaps only the notifier for a recorder.

use async_trait::async_trait;
use gitlab_poller_lib::models::{Classification, Identity};
use gitlab_poller_lib::services::fetcher::{MergeRequestFetcher, ScopeTarget};
use gitlab_poller_lib::services::gitlab_client::{GitLabClient, GitLabClientConfig};
use gitlab_poller_lib::services::notifier::{Notification, Notifier};
use gitlab_poller_lib::services::reconciler::{CycleOutcome, Reconciler, SystemClock};
use gitlab_poller_lib::store::{SqliteStore, StateStore};
use gitlab_poller_lib::PollError;
use httpmock::prelude::*;
use serde_json::json;
use std::sync::{Arc, Mutex};
use tempfile::{tempdir, TempDir};

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), PollError> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

fn merge_request(id: i64, iid: i64, updated_at: &str) -> serde_json::Value {
    json!({
        "id": id,
        "iid": iid,
        "project_id": 10,
        "title": format!("MR !{}", iid),
        "description": "Adds things",
        "state": "opened",
        "web_url": format!("https://gitlab.example.com/project/-/merge_requests/{}", iid),
        "created_at": "2023-01-01T00:00:00Z",
        "updated_at": updated_at,
        "author": { "id": 7, "username": "jdoe", "name": "John Doe" },
        "source_branch": "feature",
        "target_branch": "main"
    })
}

struct Harness {
    _dir: TempDir,
    store: Arc<SqliteStore>,
    notifier: Arc<RecordingNotifier>,
    reconciler: Reconciler,
}

async fn harness(base_url: String, reviewer: &str, scope: ScopeTarget) -> Harness {
    let dir = tempdir().unwrap();
    let store = Arc::new(SqliteStore::open(&dir.path().join("db.sqlite")).await.unwrap());
    let notifier = Arc::new(RecordingNotifier::default());
    let client = GitLabClient::new(GitLabClientConfig {
        base_url,
        token: "test-token".to_string(),
        timeout_secs: 5,
    })
    .unwrap();

    let reconciler = Reconciler::new(
        Arc::new(MergeRequestFetcher::new(client, scope, reviewer)),
        store.clone(),
        notifier.clone(),
        Arc::new(SystemClock),
    );

    Harness {
        _dir: dir,
        store,
        notifier,
        reconciler,
    }
}

async fn row_count(store: &SqliteStore) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM merge_requests")
        .fetch_one(store.pool())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_new_then_updated_merge_request() {
    let server = MockServer::start_async().await;
    let first = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/api/v4/merge_requests")
                .query_param("reviewer_id", "42")
                .query_param("state", "opened");
            then.status(200)
                .header("x-total-pages", "1")
                .json_body(json!([merge_request(1, 100, "2023-01-01T00:00:00Z")]));
        })
        .await;

    let h = harness(server.base_url(), "42", ScopeTarget::All).await;
    let identity = Identity::Scoped {
        project_id: 10,
        local_sequence: 100,
    };

    let outcome = h.reconciler.run_cycle().await;
    h.reconciler.drain_notifications().await;
    assert_eq!(outcome.report().unwrap().count(Classification::New), 1);
    assert_eq!(h.notifier.sent.lock().unwrap().len(), 1);
    assert_eq!(
        h.notifier.sent.lock().unwrap()[0].url,
        "https://gitlab.example.com/project/-/merge_requests/100"
    );

    first.delete_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/v4/merge_requests");
            then.status(200)
                .header("x-total-pages", "1")
                .json_body(json!([merge_request(1, 100, "2023-01-02T00:00:00Z")]));
        })
        .await;

    let outcome = h.reconciler.run_cycle().await;
    h.reconciler.drain_notifications().await;
    assert_eq!(outcome.report().unwrap().count(Classification::Updated), 1);
    assert_eq!(h.notifier.sent.lock().unwrap().len(), 1);

    let record = h.store.lookup(&identity).await.unwrap().unwrap();
    assert_eq!(record.payload["updated_at"], "2023-01-02T00:00:00Z");
    assert_eq!(record.payload["source_branch"], "feature");
    assert_eq!(row_count(&h.store).await, 1);
}

#[tokio::test]
async fn test_repeat_cycle_is_idempotent() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/v4/merge_requests");
            then.status(200).header("x-total-pages", "1").json_body(json!([
                merge_request(1, 100, "2023-01-01T00:00:00Z"),
                merge_request(2, 101, "2023-01-01T00:00:00Z"),
            ]));
        })
        .await;

    let h = harness(server.base_url(), "42", ScopeTarget::All).await;

    h.reconciler.run_cycle().await;
    let second = h.reconciler.run_cycle().await;
    h.reconciler.drain_notifications().await;

    assert_eq!(second.report().unwrap().count(Classification::Unchanged), 2);
    assert_eq!(h.notifier.sent.lock().unwrap().len(), 2);
    assert_eq!(row_count(&h.store).await, 2);
}

#[tokio::test]
async fn test_every_page_is_persisted() {
    let server = MockServer::start_async().await;
    let sizes = [100usize, 100, 7];
    let mut next_iid = 0;
    let mut mocks = Vec::new();

    for (index, size) in sizes.iter().enumerate() {
        let page = (index + 1).to_string();
        let items: Vec<serde_json::Value> = (0..*size)
            .map(|_| {
                next_iid += 1;
                merge_request(next_iid, next_iid, "2023-01-01T00:00:00Z")
            })
            .collect();
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/api/v4/projects/10/merge_requests")
                    .query_param("page", page.as_str());
                then.status(200)
                    .header("x-total-pages", "3")
                    .json_body(serde_json::Value::Array(items));
            })
            .await;
        mocks.push(mock);
    }
    let page_four = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/api/v4/projects/10/merge_requests")
                .query_param("page", "4");
            then.status(200).json_body(json!([]));
        })
        .await;

    let h = harness(server.base_url(), "42", ScopeTarget::Project("10".to_string())).await;
    let outcome = h.reconciler.run_cycle().await;

    assert_eq!(outcome.report().unwrap().persisted(), 207);
    assert_eq!(row_count(&h.store).await, 207);
    for mock in &mocks {
        assert_eq!(mock.hits_async().await, 1);
    }
    assert_eq!(page_four.hits_async().await, 0);
}

#[tokio::test]
async fn test_reviewer_username_is_resolved_once() {
    let server = MockServer::start_async().await;
    let users = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/api/v4/users")
                .query_param("username", "alice");
            then.status(200)
                .json_body(json!([{ "id": 42, "username": "alice", "name": "Alice" }]));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/api/v4/groups/acme/merge_requests")
                .query_param("reviewer_id", "42");
            then.status(200).json_body(json!([]));
        })
        .await;

    let h = harness(server.base_url(), "alice", ScopeTarget::Group("acme".to_string())).await;
    h.reconciler.prepare().await.unwrap();

    assert!(matches!(h.reconciler.run_cycle().await, CycleOutcome::Empty));
    assert!(matches!(h.reconciler.run_cycle().await, CycleOutcome::Empty));
    assert_eq!(users.hits_async().await, 1);
}

#[tokio::test]
async fn test_unknown_reviewer_fails_initialization() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/v4/users");
            then.status(200).json_body(json!([]));
        })
        .await;

    let h = harness(server.base_url(), "ghost", ScopeTarget::All).await;
    let err = h.reconciler.prepare().await.unwrap_err();

    assert!(err.is_fatal());
    assert!(err.to_string().contains("user"));
}

#[tokio::test]
async fn test_transport_error_leaves_store_empty() {
    // Nothing listens on the discard port
    let h = harness("http://127.0.0.1:9".to_string(), "42", ScopeTarget::All).await;

    let outcome = h.reconciler.run_cycle().await;

    assert!(matches!(
        outcome,
        CycleOutcome::FetchFailed(PollError::Transport { .. })
    ));
    assert_eq!(row_count(&h.store).await, 0);
    assert!(h.notifier.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_revoked_token_fails_cycle_only() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/v4/merge_requests");
            then.status(401).json_body(json!({ "message": "401 Unauthorized" }));
        })
        .await;

    let h = harness(server.base_url(), "42", ScopeTarget::All).await;

    match h.reconciler.run_cycle().await {
        CycleOutcome::FetchFailed(err) => assert!(err.is_authentication()),
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert!(!h.reconciler.is_running());
}
