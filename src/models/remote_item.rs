//! Remote items as fetched from GitLab.
//!
//! A [`RemoteItem`] is the normalized view of a merge request or an event.
//! The typed fields drive reconciliation; `payload` keeps the complete API
//! response so stores can hand it to downstream consumers unchanged.

use super::merge_request::MergeRequestState;
use crate::error::PollError;
use crate::services::gitlab_client::{GitLabEvent, GitLabMergeRequest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What kind of remote object an item is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    MergeRequest,
    Event,
}

impl ItemKind {
    /// Capitalized label for the start of a log line.
    pub fn label(&self) -> &'static str {
        match self {
            Self::MergeRequest => "Merge request",
            Self::Event => "Event",
        }
    }
}

impl std::fmt::Display for ItemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MergeRequest => write!(f, "merge request"),
            Self::Event => write!(f, "event"),
        }
    }
}

/// Natural key correlating a remote item with its persisted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Identity {
    /// Merge requests: `(project_id, iid)`.
    Scoped { project_id: i64, local_sequence: i64 },

    /// Events: the platform-wide event id.
    Global { global_id: i64 },
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scoped {
                project_id,
                local_sequence,
            } => write!(f, "project {} !{}", project_id, local_sequence),
            Self::Global { global_id } => write!(f, "#{}", global_id),
        }
    }
}

/// A merge request or event returned by the GitLab API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteItem {
    pub kind: ItemKind,

    /// Natural identity used for lookups and upserts.
    pub identity: Identity,

    /// Platform-wide unique id.
    pub global_id: i64,

    /// Owning project, if any (user-level events have none).
    pub project_id: Option<i64>,

    /// Project-scoped number (`iid` of the MR, `target_iid` of an event).
    pub local_sequence: Option<i64>,

    pub title: String,

    /// May be empty.
    pub description: String,

    /// MR state (`opened`, `closed`, `merged`, `locked`) or event action name.
    pub state: String,

    pub created_at: DateTime<Utc>,

    /// Last remote update; equal to `created_at` for events.
    pub updated_at: DateTime<Utc>,

    pub author_id: i64,

    /// Author display name, used for notification subtitles.
    pub author_name: Option<String>,

    /// Reviewer the merge request was fetched for, as configured.
    #[serde(default)]
    pub reviewer: Option<String>,

    /// Web UI link. Empty for events.
    pub web_url: String,

    /// Full API payload, preserved verbatim.
    pub payload: serde_json::Value,
}

impl RemoteItem {
    /// Build an item from a merge request and its raw payload.
    pub fn from_merge_request(
        mr: &GitLabMergeRequest,
        payload: serde_json::Value,
    ) -> Result<Self, PollError> {
        Ok(Self {
            kind: ItemKind::MergeRequest,
            identity: Identity::Scoped {
                project_id: mr.project_id,
                local_sequence: mr.iid,
            },
            global_id: mr.id,
            project_id: Some(mr.project_id),
            local_sequence: Some(mr.iid),
            title: mr.title.clone(),
            description: mr.description.clone().unwrap_or_default(),
            state: mr.state.clone(),
            created_at: parse_timestamp(&mr.created_at)?,
            updated_at: parse_timestamp(&mr.updated_at)?,
            author_id: mr.author.id,
            author_name: Some(mr.author.name.clone()),
            reviewer: None,
            web_url: mr.web_url.clone(),
            payload,
        })
    }

    /// Build an item from an event and its raw payload.
    pub fn from_event(event: &GitLabEvent, payload: serde_json::Value) -> Result<Self, PollError> {
        let created_at = parse_timestamp(&event.created_at)?;
        let title = event
            .target_title
            .clone()
            .unwrap_or_else(|| event.action_name.clone());

        Ok(Self {
            kind: ItemKind::Event,
            identity: Identity::Global {
                global_id: event.id,
            },
            global_id: event.id,
            project_id: event.project_id,
            local_sequence: event.target_iid,
            title,
            description: String::new(),
            state: event.action_name.clone(),
            created_at,
            updated_at: created_at,
            author_id: event.author_id,
            author_name: event.author_username.clone(),
            reviewer: None,
            web_url: String::new(),
            payload,
        })
    }

    /// Parsed merge request state; `None` for events and unknown states.
    pub fn merge_request_state(&self) -> Option<MergeRequestState> {
        match self.kind {
            ItemKind::MergeRequest => MergeRequestState::parse(&self.state),
            ItemKind::Event => None,
        }
    }

    /// Human-readable reference used in log lines: the web URL when known.
    pub fn display_ref(&self) -> String {
        if self.web_url.is_empty() {
            format!("{} {}", self.kind, self.identity)
        } else {
            self.web_url.clone()
        }
    }
}

/// Parse an ISO 8601 timestamp into UTC.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, PollError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| PollError::internal(format!("Invalid timestamp '{}': {}", s, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mr_payload() -> serde_json::Value {
        json!({
            "id": 1,
            "iid": 100,
            "project_id": 10,
            "title": "Test MR",
            "description": null,
            "state": "opened",
            "web_url": "https://gitlab.example.com/project/-/merge_requests/100",
            "created_at": "2023-01-01T00:00:00Z",
            "updated_at": "2023-01-01T00:00:00Z",
            "author": { "id": 7, "username": "jdoe", "name": "John Doe" },
            "labels": ["backend"]
        })
    }

    #[test]
    fn test_from_merge_request_keeps_payload() {
        let payload = mr_payload();
        let mr: GitLabMergeRequest = serde_json::from_value(payload.clone()).unwrap();
        let item = RemoteItem::from_merge_request(&mr, payload.clone()).unwrap();

        assert_eq!(
            item.identity,
            Identity::Scoped {
                project_id: 10,
                local_sequence: 100
            }
        );
        assert_eq!(item.description, "");
        assert_eq!(item.author_id, 7);
        assert_eq!(item.merge_request_state(), Some(MergeRequestState::Opened));
        assert_eq!(item.payload, payload);
        assert_eq!(item.display_ref(), "https://gitlab.example.com/project/-/merge_requests/100");
    }

    #[test]
    fn test_from_event_uses_created_at_for_updated_at() {
        let payload = json!({
            "id": 555,
            "project_id": 10,
            "action_name": "opened",
            "target_iid": 3,
            "target_title": "Add poller",
            "author_id": 7,
            "author_username": "jdoe",
            "created_at": "2024-01-15T10:30:00.000Z"
        });
        let event: GitLabEvent = serde_json::from_value(payload.clone()).unwrap();
        let item = RemoteItem::from_event(&event, payload).unwrap();

        assert_eq!(item.identity, Identity::Global { global_id: 555 });
        assert_eq!(item.created_at, item.updated_at);
        assert_eq!(item.title, "Add poller");
        assert_eq!(item.display_ref(), "event #555");
    }

    #[test]
    fn test_parse_timestamp() {
        let a = parse_timestamp("2024-01-15T10:30:00Z").unwrap();
        let b = parse_timestamp("2024-01-15T12:30:00+02:00").unwrap();
        assert_eq!(a, b);
        assert!(parse_timestamp("invalid").is_err());
    }
}
