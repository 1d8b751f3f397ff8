//! Remote fetchers.
//!
//! A [`RemoteFetcher`] produces the current set of remote items for the
//! configured scope. Two flavours exist:
//!
//! - [`MergeRequestFetcher`] walks every page of open merge requests for a
//!   reviewer on each call, since state transitions only show up on a full walk.
//! - [`EventFetcher`] walks the event stream newest-first and stops at the
//!   cursor recorded by the previous cycle.
//!
//! Both sit on top of [`GitLabApi`], the page-level seam implemented by
//! [`GitLabClient`](crate::services::gitlab_client::GitLabClient).

use crate::error::PollError;
use crate::models::{Cursor, Identity, RemoteItem};
use crate::services::gitlab_client::{GitLabEvent, GitLabMergeRequest, PaginatedResponse};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;
use tokio::sync::OnceCell;

/// Default upper bound on pages walked per event fetch.
pub const DEFAULT_MAX_EVENT_PAGES: u32 = 10;

/// Where to look for merge requests or events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeTarget {
    /// Everything visible to the token.
    All,

    /// A group id or full path.
    Group(String),

    /// A project id or full path.
    Project(String),
}

impl std::fmt::Display for ScopeTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => write!(f, "all accessible projects"),
            Self::Group(group) => write!(f, "group {}", group),
            Self::Project(project) => write!(f, "project {}", project),
        }
    }
}

/// Page-level access to the GitLab API.
#[async_trait]
pub trait GitLabApi: Send + Sync {
    /// Resolve a reviewer given as numeric id or username to a user id.
    async fn resolve_user_id(&self, reviewer: &str) -> Result<i64, PollError>;

    /// One page of open merge requests reviewed by `reviewer_id`, newest update first.
    async fn merge_requests_page(
        &self,
        target: &ScopeTarget,
        reviewer_id: i64,
        page: u32,
    ) -> Result<PaginatedResponse<serde_json::Value>, PollError>;

    /// One page of events, newest first.
    async fn events_page(
        &self,
        target: &ScopeTarget,
        page: u32,
    ) -> Result<PaginatedResponse<serde_json::Value>, PollError>;
}

/// Result of a successful fetch.
#[derive(Debug, Default)]
pub struct FetchBatch {
    pub items: Vec<RemoteItem>,

    /// Cursor to commit once the items have been consumed.
    pub next_cursor: Option<Cursor>,
}

/// Source of the current remote item set.
#[async_trait]
pub trait RemoteFetcher: Send + Sync {
    /// Short description of the scope for log lines.
    fn describe(&self) -> String;

    /// Check the scope exists before the first cycle.
    async fn prepare(&self) -> Result<(), PollError> {
        Ok(())
    }

    /// Seed the resumption cursor, e.g. from the store after a restart.
    fn resume_from(&self, _cursor: Cursor) {}

    /// Fetch the current remote set.
    async fn fetch_current(&self) -> Result<FetchBatch, PollError>;

    /// Commit the cursor returned by a fetch whose items were consumed.
    fn commit_cursor(&self, _cursor: Cursor) {}
}

/// Walk pages `1..` until a page comes back empty or the last page is reached.
///
/// `fetch_page` is called with increasing page numbers; `should_stop` lets the
/// caller end the walk early after inspecting a page. Returns the pages' data
/// concatenated in order.
async fn walk_pages<F, Fut>(
    max_pages: Option<u32>,
    mut fetch_page: F,
    mut should_stop: impl FnMut(&[serde_json::Value]) -> bool,
) -> Result<Vec<serde_json::Value>, PollError>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<PaginatedResponse<serde_json::Value>, PollError>>,
{
    let mut all_data = Vec::new();
    let mut page = 1u32;

    loop {
        let response = fetch_page(page).await?;
        if response.data.is_empty() {
            break;
        }

        let stop = should_stop(&response.data);
        all_data.extend(response.data);

        let has_more = page < response.pagination.total_pages
            || response.pagination.next_page.is_some_and(|next| next > page);
        if stop || !has_more || max_pages.is_some_and(|max| page >= max) {
            break;
        }
        page += 1;
    }

    Ok(all_data)
}

/// Drop repeated identities, keeping the first (newest) occurrence.
fn dedup_by_identity(items: Vec<RemoteItem>) -> Vec<RemoteItem> {
    let mut seen: HashSet<Identity> = HashSet::with_capacity(items.len());
    items
        .into_iter()
        .filter(|item| seen.insert(item.identity))
        .collect()
}

/// Fetches all open merge requests a reviewer is assigned to.
pub struct MergeRequestFetcher<A> {
    api: A,
    target: ScopeTarget,
    reviewer: String,
    reviewer_id: OnceCell<i64>,
}

impl<A: GitLabApi> MergeRequestFetcher<A> {
    pub fn new(api: A, target: ScopeTarget, reviewer: impl Into<String>) -> Self {
        Self {
            api,
            target,
            reviewer: reviewer.into(),
            reviewer_id: OnceCell::new(),
        }
    }

    async fn reviewer_id(&self) -> Result<i64, PollError> {
        self.reviewer_id
            .get_or_try_init(|| self.api.resolve_user_id(&self.reviewer))
            .await
            .copied()
    }
}

#[async_trait]
impl<A: GitLabApi> RemoteFetcher for MergeRequestFetcher<A> {
    fn describe(&self) -> String {
        format!("merge requests for reviewer {} in {}", self.reviewer, self.target)
    }

    async fn prepare(&self) -> Result<(), PollError> {
        let id = self.reviewer_id().await?;
        log::info!("Reviewer {} resolved to user id {}", self.reviewer, id);
        Ok(())
    }

    async fn fetch_current(&self) -> Result<FetchBatch, PollError> {
        let reviewer_id = self.reviewer_id().await?;
        let raw = walk_pages(
            None,
            |page| self.api.merge_requests_page(&self.target, reviewer_id, page),
            |_| false,
        )
        .await?;

        let mut items = Vec::with_capacity(raw.len());
        for value in raw {
            let parsed = serde_json::from_value::<GitLabMergeRequest>(value.clone())
                .map_err(PollError::from)
                .and_then(|mr| RemoteItem::from_merge_request(&mr, value));
            match parsed {
                Ok(item) => items.push(RemoteItem {
                    reviewer: Some(self.reviewer.clone()),
                    ..item
                }),
                Err(e) => log::warn!("Skipping undecodable merge request: {}", e),
            }
        }

        Ok(FetchBatch {
            items: dedup_by_identity(items),
            next_cursor: None,
        })
    }
}

/// Fetches events newer than the last committed cursor.
pub struct EventFetcher<A> {
    api: A,
    target: ScopeTarget,
    max_pages: u32,
    cursor: Mutex<Option<Cursor>>,
}

impl<A: GitLabApi> EventFetcher<A> {
    pub fn new(api: A, target: ScopeTarget) -> Self {
        Self {
            api,
            target,
            max_pages: DEFAULT_MAX_EVENT_PAGES,
            cursor: Mutex::new(None),
        }
    }

    /// Bound the number of pages walked when catching up to the cursor.
    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    /// The cursor committed so far.
    pub fn cursor(&self) -> Option<Cursor> {
        *self.cursor.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl<A: GitLabApi> RemoteFetcher for EventFetcher<A> {
    fn describe(&self) -> String {
        format!("events in {}", self.target)
    }

    async fn prepare(&self) -> Result<(), PollError> {
        // Probe the first page so a missing project fails at startup
        self.api.events_page(&self.target, 1).await.map(|_| ())
    }

    fn resume_from(&self, cursor: Cursor) {
        log::info!("Resuming from last event ID: {}", cursor);
        *self.cursor.lock().unwrap_or_else(|e| e.into_inner()) = Some(cursor);
    }

    async fn fetch_current(&self) -> Result<FetchBatch, PollError> {
        let cursor = self.cursor();

        // Without a cursor only the newest page is taken; it seeds the cursor
        let max_pages = if cursor.is_some() { self.max_pages } else { 1 };
        let raw = walk_pages(
            Some(max_pages),
            |page| self.api.events_page(&self.target, page),
            |data| match cursor {
                Some(c) => data.iter().any(|v| {
                    v.get("id")
                        .and_then(|id| id.as_i64())
                        .is_some_and(|id| c.covers(id))
                }),
                None => false,
            },
        )
        .await?;

        let mut items = Vec::with_capacity(raw.len());
        for value in raw {
            let parsed = serde_json::from_value::<GitLabEvent>(value.clone())
                .map_err(PollError::from)
                .and_then(|event| RemoteItem::from_event(&event, value));
            match parsed {
                Ok(item) if cursor.is_some_and(|c| c.covers(item.global_id)) => {}
                Ok(item) => items.push(item),
                Err(e) => log::warn!("Skipping undecodable event: {}", e),
            }
        }

        let newest = items.iter().map(|item| item.global_id).max();
        let next_cursor = match (newest, cursor) {
            (Some(id), _) => Some(Cursor::new(id)),
            (None, existing) => existing,
        };

        Ok(FetchBatch {
            items: dedup_by_identity(items),
            next_cursor,
        })
    }

    fn commit_cursor(&self, cursor: Cursor) {
        let mut current = self.cursor.lock().unwrap_or_else(|e| e.into_inner());
        // Never move backwards
        if current.map_or(true, |c| cursor > c) {
            *current = Some(cursor);
        }
    }
}
