//! Merge request lifecycle.

use super::record::PersistedRecord;
use super::remote_item::{ItemKind, RemoteItem};

/// Value of a merge request's `state` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeRequestState {
    Opened,
    Closed,
    Merged,
    Locked,
}

impl MergeRequestState {
    /// Parse GitLab's `state` string. Unknown values yield `None`.
    pub fn parse(state: &str) -> Option<Self> {
        match state {
            "opened" => Some(Self::Opened),
            "closed" => Some(Self::Closed),
            "merged" => Some(Self::Merged),
            "locked" => Some(Self::Locked),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Opened => "opened",
            Self::Closed => "closed",
            Self::Merged => "merged",
            Self::Locked => "locked",
        }
    }

    /// No further review is expected once merged or closed.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Closed | Self::Merged)
    }
}

impl std::fmt::Display for MergeRequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A merge request whose state differs from the stored copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    pub from: MergeRequestState,
    pub to: MergeRequestState,
}

impl StateTransition {
    /// Compare the stored payload's `state` with the fetched item.
    ///
    /// `None` for events, unknown states, or when nothing changed.
    pub fn between(stored: &PersistedRecord, fetched: &RemoteItem) -> Option<Self> {
        if fetched.kind != ItemKind::MergeRequest {
            return None;
        }
        let from = stored
            .payload
            .get("state")
            .and_then(|v| v.as_str())
            .and_then(MergeRequestState::parse)?;
        let to = fetched.merge_request_state()?;

        (from != to).then_some(Self { from, to })
    }

    /// Reopened after being merged or closed.
    pub fn is_reopen(&self) -> bool {
        self.from.is_final() && !self.to.is_final()
    }
}

impl std::fmt::Display for StateTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}
