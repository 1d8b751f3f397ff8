//! Polling services.
//!
//! The GitLab client and the fetchers built on it, desktop notification
//! delivery, the reconciler owning the poll cycle, and the scheduler
//! driving it.

pub mod fetcher;
pub mod gitlab_client;
pub mod notifier;
pub mod reconciler;
pub mod scheduler;

pub use fetcher::{EventFetcher, MergeRequestFetcher, RemoteFetcher, ScopeTarget};
pub use gitlab_client::GitLabClient;
pub use notifier::{DesktopNotifier, NoopNotifier, Notifier};
pub use reconciler::Reconciler;
pub use scheduler::Poller;
