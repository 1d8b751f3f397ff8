//! Wiring of concrete collaborators from a validated configuration.

use crate::config::{PollMode, PollerConfig, StoreKind};
use crate::error::PollError;
use crate::services::fetcher::{EventFetcher, MergeRequestFetcher, RemoteFetcher};
use crate::services::gitlab_client::{GitLabClient, GitLabClientConfig};
use crate::services::notifier::{DesktopNotifier, NoopNotifier, Notifier};
use crate::services::reconciler::{Reconciler, SystemClock};
use crate::store::{RestStore, SqliteStore, StateStore};
use std::sync::Arc;

/// Build the fetcher for the configured mode and scope.
///
/// The token is checked against `/user` first; a rejected token is fatal.
pub async fn build_fetcher(config: &PollerConfig) -> Result<Arc<dyn RemoteFetcher>, PollError> {
    let client = GitLabClient::new(GitLabClientConfig {
        base_url: config.base_url.clone(),
        token: config.access_token.clone(),
        ..Default::default()
    })
    .map_err(PollError::into_initialization)?;

    let user = client
        .validate_token()
        .await
        .map_err(PollError::into_initialization)?;
    log::info!("Authenticated as {}", user.username);

    let scope = config.scope();
    let fetcher: Arc<dyn RemoteFetcher> = match config.mode {
        PollMode::MergeRequests => {
            let reviewer = config
                .reviewer
                .clone()
                .ok_or_else(|| PollError::initialization("A reviewer is required to poll merge requests"))?;
            Arc::new(MergeRequestFetcher::new(client, scope, reviewer))
        }
        PollMode::Events => Arc::new(EventFetcher::new(client, scope)),
    };

    Ok(fetcher)
}

/// Open the configured store.
pub async fn build_store(config: &PollerConfig) -> Result<Arc<dyn StateStore>, PollError> {
    let store: Arc<dyn StateStore> = match config.store {
        StoreKind::Sqlite => Arc::new(SqliteStore::open(&config.db_path).await?),
        StoreKind::Rest => {
            let rest = config
                .rest
                .clone()
                .ok_or_else(|| PollError::initialization("Supabase settings are missing"))?;
            log::info!("Using Supabase store at {}", rest.url);
            Arc::new(RestStore::new(rest)?)
        }
    };
    Ok(store)
}

pub fn build_notifier(config: &PollerConfig) -> Arc<dyn Notifier> {
    if config.notify {
        Arc::new(DesktopNotifier::default())
    } else {
        Arc::new(NoopNotifier)
    }
}

/// Build a reconciler and check its collaborators.
///
/// On failure the store is closed before the error is returned.
pub async fn initialize(config: &PollerConfig) -> Result<Arc<Reconciler>, PollError> {
    let fetcher = build_fetcher(config).await?;
    let store = build_store(config).await?;
    let reconciler = Arc::new(Reconciler::new(
        fetcher,
        store,
        build_notifier(config),
        Arc::new(SystemClock),
    ));

    if let Err(e) = reconciler.prepare().await {
        reconciler.shutdown().await;
        return Err(e);
    }

    log::info!("GitLab URL: {}", config.base_url);
    log::info!("Scope: {}", config.scope());
    log::info!("Polling interval: {} minute(s)", config.interval.as_secs() / 60);
    Ok(reconciler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CliOverrides, ConfigValues};
    use crate::services::reconciler::CycleOutcome;
    use httpmock::prelude::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn config_for(server: &MockServer, db: &std::path::Path) -> PollerConfig {
        let values: ConfigValues = [
            ("GITLAB_BASE_URL", server.base_url()),
            ("GITLAB_ACCESS_TOKEN", "test-token".to_string()),
            ("GITLAB_PROJECT_ID", "10".to_string()),
            ("GITLAB_POLLER_NOTIFY", "off".to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        PollerConfig::resolve(
            PollMode::Events,
            &values,
            &CliOverrides::default(),
            Some(db.to_path_buf()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_rejected_token_is_fatal() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/v4/user");
                then.status(401).json_body(json!({ "message": "401 Unauthorized" }));
            })
            .await;

        let dir = tempdir().unwrap();
        let config = config_for(&server, &dir.path().join("db.sqlite"));

        let err = match initialize(&config).await {
            Ok(_) => panic!("expected initialization to fail"),
            Err(e) => e,
        };
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_initialize_and_run_one_cycle() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/v4/user");
                then.status(200)
                    .json_body(json!({ "id": 1, "username": "poller", "name": "Poller" }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/v4/projects/10/events");
                then.status(200).json_body(json!([{
                    "id": 9,
                    "project_id": 10,
                    "action_name": "opened",
                    "author_id": 1,
                    "created_at": "2024-01-15T10:30:00Z"
                }]));
            })
            .await;

        let dir = tempdir().unwrap();
        let config = config_for(&server, &dir.path().join("db.sqlite"));

        let reconciler = initialize(&config).await.unwrap();
        let outcome = reconciler.run_cycle().await;
        reconciler.shutdown().await;

        assert!(matches!(outcome, CycleOutcome::Completed(_)));
        assert!(dir.path().join("db.sqlite").exists());
    }
}
