//! Error types for the poller.
//!
//! Every fallible operation in the crate returns [`PollError`]. The variants
//! follow how failures are handled at runtime: per-cycle failures (transport,
//! authentication, not found, rate limiting) abort the current cycle only,
//! per-item failures (persistence) abort a single item, notification failures
//! are logged and dropped, and only [`PollError::Initialization`] stops the
//! process.

use thiserror::Error;

/// Poller errors.
#[derive(Debug, Error)]
pub enum PollError {
    /// Network or timeout failure talking to GitLab.
    #[error("Network error: {message}")]
    Transport { message: String },

    /// Token invalid, expired, revoked or lacking access.
    #[error("Authentication error: {message}")]
    Authentication {
        message: String,
        status_code: Option<u16>,
    },

    /// The configured scope (user, group, project) does not exist.
    #[error("Not found: {resource}")]
    NotFound {
        resource: String,
        id: Option<String>,
    },

    /// GitLab rejected the request because of rate limiting.
    #[error("Rate limit exceeded on {endpoint}")]
    RateLimited {
        endpoint: String,
        retry_after_secs: Option<u64>,
    },

    /// Any other non-success response from GitLab.
    #[error("GitLab API error: {message}")]
    GitLabApi {
        message: String,
        status_code: Option<u16>,
        endpoint: Option<String>,
    },

    /// A store read or write failed.
    #[error("Persistence error: {message}")]
    Persistence {
        message: String,
        operation: Option<String>,
    },

    /// Desktop notification could not be delivered.
    #[error("Notification error: {message}")]
    Notification { message: String },

    /// A required collaborator is missing at startup.
    #[error("Initialization error: {message}")]
    Initialization { message: String },

    /// Internal error (decoding, invariant violations).
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl PollError {
    /// Create a transport error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create an authentication error.
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
            status_code: None,
        }
    }

    /// Create an authentication error carrying the HTTP status.
    pub fn authentication_status(message: impl Into<String>, status_code: u16) -> Self {
        Self::Authentication {
            message: message.into(),
            status_code: Some(status_code),
        }
    }

    /// Create a not found error.
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: None,
        }
    }

    /// Create a not found error with ID.
    pub fn not_found_with_id(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: Some(id.into()),
        }
    }

    /// Create a rate limit error.
    pub fn rate_limited(endpoint: impl Into<String>, retry_after_secs: Option<u64>) -> Self {
        Self::RateLimited {
            endpoint: endpoint.into(),
            retry_after_secs,
        }
    }

    /// Create a GitLab API error with status code and endpoint.
    pub fn gitlab_api_full(
        message: impl Into<String>,
        status_code: u16,
        endpoint: impl Into<String>,
    ) -> Self {
        Self::GitLabApi {
            message: message.into(),
            status_code: Some(status_code),
            endpoint: Some(endpoint.into()),
        }
    }

    /// Create a persistence error.
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence {
            message: message.into(),
            operation: None,
        }
    }

    /// Create a persistence error with operation context.
    pub fn persistence_with_op(message: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::Persistence {
            message: message.into(),
            operation: Some(operation.into()),
        }
    }

    /// Create a notification error.
    pub fn notification(message: impl Into<String>) -> Self {
        Self::Notification {
            message: message.into(),
        }
    }

    /// Create an initialization error.
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether this error should stop the process instead of the current cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Initialization { .. })
    }

    /// Whether this is an authentication failure (needs operator action).
    pub fn is_authentication(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }

    /// Whether this is a not found failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Turn a startup-time failure into a fatal initialization error.
    ///
    /// Used while preparing collaborators: a scope that does not exist or a
    /// rejected token at startup is a configuration problem, not a transient one.
    pub fn into_initialization(self) -> Self {
        match self {
            Self::Initialization { .. } => self,
            other => Self::initialization(other.to_string()),
        }
    }
}

// Conversions from common error types

impl From<reqwest::Error> for PollError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::network("Request timed out")
        } else if err.is_connect() {
            Self::network("Failed to connect to server")
        } else if err.is_decode() {
            Self::internal(format!("Failed to decode response: {}", err))
        } else {
            Self::network(err.to_string())
        }
    }
}

impl From<sqlx::Error> for PollError {
    fn from(err: sqlx::Error) -> Self {
        Self::persistence(err.to_string())
    }
}

impl From<serde_json::Error> for PollError {
    fn from(err: serde_json::Error) -> Self {
        Self::internal(format!("JSON error: {}", err))
    }
}

impl From<crate::db::DbError> for PollError {
    fn from(err: crate::db::DbError) -> Self {
        Self::persistence(err.to_string())
    }
}
