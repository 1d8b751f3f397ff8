//! GitLab API client.
//!
//! Provides HTTP client for GitLab API v4 with authentication and pagination.

use crate::error::PollError;
use crate::services::fetcher::{GitLabApi, ScopeTarget};
use async_trait::async_trait;
use reqwest::{header, Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Page size used for every list request (GitLab maximum).
pub const PER_PAGE: u32 = 100;

/// GitLab API client configuration.
#[derive(Debug, Clone)]
pub struct GitLabClientConfig {
    /// Base URL of the GitLab instance (e.g., `https://gitlab.com`).
    pub base_url: String,

    /// Personal access token for authentication.
    pub token: String,

    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for GitLabClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://gitlab.com".to_string(),
            token: String::new(),
            timeout_secs: 30,
        }
    }
}

/// GitLab API client.
#[derive(Debug, Clone)]
pub struct GitLabClient {
    client: Client,
    config: GitLabClientConfig,
}

/// Pagination information from GitLab API response headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaginationInfo {
    /// Current page number.
    pub page: u32,

    /// Number of items per page.
    pub per_page: u32,

    /// Total number of pages.
    pub total_pages: u32,

    /// Total number of items.
    pub total: u32,

    /// Next page number (if any).
    pub next_page: Option<u32>,
}

/// Paginated response from GitLab API.
#[derive(Debug)]
pub struct PaginatedResponse<T> {
    /// The response data.
    pub data: Vec<T>,

    /// Pagination information.
    pub pagination: PaginationInfo,
}

/// Query parameters for listing merge requests.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MergeRequestsQuery {
    /// Filter by state: `opened`, `merged`, `closed`, `all`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,

    /// Filter by scope: `created_by_me`, `assigned_to_me`, `all`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    /// Filter by reviewer user ID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviewer_id: Option<i64>,

    /// Sort field: `created_at`, `updated_at`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_by: Option<String>,

    /// Sort direction: `asc` or `desc`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort: Option<String>,

    /// Page number for pagination.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,

    /// Number of items per page (max 100).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_page: Option<u32>,
}

/// Query parameters for listing events.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EventsQuery {
    /// Sort direction by creation date: `asc` or `desc`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_page: Option<u32>,
}

/// GitLab merge request from API.
///
/// Only the fields the poller relies on; the full object is kept as raw JSON.
#[derive(Debug, Clone, Deserialize)]
pub struct GitLabMergeRequest {
    pub id: i64,
    pub iid: i64,
    pub project_id: i64,
    pub title: String,
    pub description: Option<String>,
    pub state: String,
    pub web_url: String,
    pub created_at: String,
    pub updated_at: String,
    pub author: GitLabUser,
}

/// GitLab user from API.
#[derive(Debug, Clone, Deserialize)]
pub struct GitLabUser {
    pub id: i64,
    pub username: String,
    pub name: String,
}

/// GitLab event from API.
#[derive(Debug, Clone, Deserialize)]
pub struct GitLabEvent {
    pub id: i64,
    pub project_id: Option<i64>,
    pub action_name: String,
    pub target_iid: Option<i64>,
    pub target_title: Option<String>,
    pub author_id: i64,
    pub author_username: Option<String>,
    pub created_at: String,
}

impl GitLabClient {
    /// Create a new GitLab client.
    pub fn new(config: GitLabClientConfig) -> Result<Self, PollError> {
        let mut headers = header::HeaderMap::new();

        // Add the private token header for authentication
        let token_value = header::HeaderValue::from_str(&config.token)
            .map_err(|_| PollError::authentication("Invalid token format"))?;
        headers.insert("PRIVATE-TOKEN", token_value);

        // Build the HTTP client
        let client = Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PollError::internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    /// Get the base URL for API requests.
    fn api_url(&self, path: &str) -> String {
        format!(
            "{}/api/v4{}",
            self.config.base_url.trim_end_matches('/'),
            path
        )
    }

    /// Parse pagination headers from response.
    fn parse_pagination(response: &Response) -> PaginationInfo {
        let headers = response.headers();

        let get_header = |name: &str| -> Option<u32> {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse().ok())
        };

        PaginationInfo {
            page: get_header("x-page").unwrap_or(1),
            per_page: get_header("x-per-page").unwrap_or(20),
            total_pages: get_header("x-total-pages").unwrap_or(1),
            total: get_header("x-total").unwrap_or(0),
            next_page: get_header("x-next-page"),
        }
    }

    /// Handle API response errors.
    ///
    /// Maps the statuses the poller reacts to onto distinct error variants:
    /// 401/403 are authentication failures, 404 means the scope is gone and
    /// 429 is rate limiting. Anything else becomes a generic API error.
    async fn handle_response<T: DeserializeOwned>(
        &self,
        response: Response,
        endpoint: &str,
    ) -> Result<T, PollError> {
        let status = response.status();

        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| PollError::internal(format!("Failed to parse response: {}", e)));
        }

        match status {
            StatusCode::UNAUTHORIZED => Err(PollError::authentication_status(
                "GitLab token expired or revoked",
                status.as_u16(),
            )),
            StatusCode::FORBIDDEN => Err(PollError::authentication_status(
                format!("Access denied to {}", endpoint),
                status.as_u16(),
            )),
            StatusCode::NOT_FOUND => Err(PollError::not_found_with_id("GitLab resource", endpoint)),
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = response
                    .headers()
                    .get(header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.trim().parse().ok());
                Err(PollError::rate_limited(endpoint, retry_after))
            }
            _ => {
                let status_code = status.as_u16();
                let body = response.text().await.unwrap_or_default();
                let body_message = serde_json::from_str::<serde_json::Value>(&body)
                    .ok()
                    .and_then(|v| {
                        // GitLab returns errors as {"message": "..."} or {"error": "..."}
                        v.get("message").or_else(|| v.get("error")).map(|m| match m.as_str() {
                            Some(s) => s.to_string(),
                            None => m.to_string(),
                        })
                    });

                let message = body_message
                    .unwrap_or_else(|| format!("Request failed ({}): {}", status_code, body));

                Err(PollError::gitlab_api_full(message, status_code, endpoint))
            }
        }
    }

    /// Make a GET request for a single page.
    async fn get_paginated<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &impl Serialize,
    ) -> Result<PaginatedResponse<T>, PollError> {
        let url = self.api_url(endpoint);

        let response = self.client.get(&url).query(query).send().await?;
        let pagination = Self::parse_pagination(&response);
        let data = self.handle_response::<Vec<T>>(response, endpoint).await?;

        Ok(PaginatedResponse { data, pagination })
    }

    /// Validate the token by fetching the current user.
    pub async fn validate_token(&self) -> Result<GitLabUser, PollError> {
        let url = self.api_url("/user");
        let response = self.client.get(&url).send().await?;
        self.handle_response(response, "/user").await
    }

    /// Look up a user by exact username.
    pub async fn find_user_by_username(&self, username: &str) -> Result<GitLabUser, PollError> {
        let endpoint = "/users";
        let url = self.api_url(endpoint);
        let response = self
            .client
            .get(&url)
            .query(&[("username", username)])
            .send()
            .await?;
        let users: Vec<GitLabUser> = self.handle_response(response, endpoint).await?;

        users
            .into_iter()
            .next()
            .ok_or_else(|| PollError::not_found_with_id("user", username))
    }

    /// List one page of merge requests under `endpoint`.
    pub async fn list_merge_requests(
        &self,
        endpoint: &str,
        query: &MergeRequestsQuery,
    ) -> Result<PaginatedResponse<serde_json::Value>, PollError> {
        self.get_paginated(endpoint, query).await
    }

    /// List one page of events under `endpoint`.
    pub async fn list_events(
        &self,
        endpoint: &str,
        query: &EventsQuery,
    ) -> Result<PaginatedResponse<serde_json::Value>, PollError> {
        self.get_paginated(endpoint, query).await
    }
}

/// Endpoint listing merge requests for a scope.
fn merge_requests_endpoint(target: &ScopeTarget) -> String {
    match target {
        ScopeTarget::All => "/merge_requests".to_string(),
        ScopeTarget::Group(group) => {
            format!("/groups/{}/merge_requests", urlencoding::encode(group))
        }
        ScopeTarget::Project(project) => {
            format!("/projects/{}/merge_requests", urlencoding::encode(project))
        }
    }
}

/// Endpoint listing events for a scope.
///
/// GitLab has no group-level events endpoint; callers validate the scope
/// before polling events.
fn events_endpoint(target: &ScopeTarget) -> Result<String, PollError> {
    match target {
        ScopeTarget::All => Ok("/events".to_string()),
        ScopeTarget::Project(project) => {
            Ok(format!("/projects/{}/events", urlencoding::encode(project)))
        }
        ScopeTarget::Group(_) => Err(PollError::initialization(
            "Event polling supports a project or all projects, not a group",
        )),
    }
}

#[async_trait]
impl GitLabApi for GitLabClient {
    async fn resolve_user_id(&self, reviewer: &str) -> Result<i64, PollError> {
        if let Ok(id) = reviewer.trim().parse::<i64>() {
            return Ok(id);
        }
        Ok(self.find_user_by_username(reviewer.trim()).await?.id)
    }

    async fn merge_requests_page(
        &self,
        target: &ScopeTarget,
        reviewer_id: i64,
        page: u32,
    ) -> Result<PaginatedResponse<serde_json::Value>, PollError> {
        let query = MergeRequestsQuery {
            state: Some("opened".to_string()),
            // The top-level endpoint defaults to `created_by_me`
            scope: matches!(target, ScopeTarget::All).then(|| "all".to_string()),
            reviewer_id: Some(reviewer_id),
            order_by: Some("updated_at".to_string()),
            sort: Some("desc".to_string()),
            page: Some(page),
            per_page: Some(PER_PAGE),
        };
        self.list_merge_requests(&merge_requests_endpoint(target), &query)
            .await
    }

    async fn events_page(
        &self,
        target: &ScopeTarget,
        page: u32,
    ) -> Result<PaginatedResponse<serde_json::Value>, PollError> {
        let query = EventsQuery {
            sort: Some("desc".to_string()),
            page: Some(page),
            per_page: Some(PER_PAGE),
        };
        self.list_events(&events_endpoint(target)?, &query).await
    }
}
