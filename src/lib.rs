//! gitlab-poller - keeps a local record of GitLab merge requests and events.
//!
//! The library polls the GitLab REST API on a fixed interval, reconciles the
//! result against a state store and notifies about newly discovered items.
//! The `gitlab-poller` binary wires it to the command line.

pub mod app;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod store;

pub use config::{PollMode, PollerConfig};
pub use error::PollError;
pub use services::reconciler::{CycleOutcome, Reconciler};
pub use services::scheduler::{Poller, PollerHandle};
