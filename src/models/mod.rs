//! Data models shared by the fetcher, the stores and the reconciler.

pub mod merge_request;
pub mod record;
pub mod remote_item;

// Re-exports for convenient access
pub use merge_request::{MergeRequestState, StateTransition};
pub use record::{Classification, Cursor, PersistedRecord};
pub use remote_item::{Identity, ItemKind, RemoteItem};
