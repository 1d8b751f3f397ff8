//! Poll-cycle reconciliation.
//!
//! One cycle fetches the current remote set, classifies every item against
//! the store, persists it and requests a notification for new items. At most
//! one cycle runs at a time; a cycle triggered while another is running is
//! dropped rather than queued.

use crate::error::PollError;
use crate::models::{Classification, Identity, RemoteItem, StateTransition};
use crate::services::fetcher::RemoteFetcher;
use crate::services::notifier::{Notification, Notifier};
use crate::store::StateStore;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;

/// Source of the `synced_at` timestamp written with each record.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// What happened to one item during a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Classified and written.
    Persisted(Classification),

    /// The store lookup failed; the item was not written.
    LookupFailed,

    /// Classified, but the write failed.
    UpsertFailed(Classification),
}

/// Per-item results of a completed cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub items: Vec<(Identity, ItemOutcome)>,
}

impl CycleReport {
    /// Items classified as `classification`, whether or not the write succeeded.
    pub fn count(&self, classification: Classification) -> usize {
        self.items
            .iter()
            .filter(|(_, outcome)| match outcome {
                ItemOutcome::Persisted(c) | ItemOutcome::UpsertFailed(c) => *c == classification,
                ItemOutcome::LookupFailed => false,
            })
            .count()
    }

    /// Items whose lookup or upsert failed.
    pub fn failures(&self) -> usize {
        self.items
            .iter()
            .filter(|(_, outcome)| !matches!(outcome, ItemOutcome::Persisted(_)))
            .count()
    }

    pub fn persisted(&self) -> usize {
        self.items.len() - self.failures()
    }
}

impl std::fmt::Display for CycleReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} items: {} new, {} updated, {} unchanged, {} failed",
            self.items.len(),
            self.count(Classification::New),
            self.count(Classification::Updated),
            self.count(Classification::Unchanged),
            self.failures()
        )
    }
}

/// Result of one trigger.
#[derive(Debug)]
pub enum CycleOutcome {
    /// Another cycle was running.
    Skipped,

    /// The fetch failed; the store was not touched.
    FetchFailed(PollError),

    /// The remote set was empty.
    Empty,

    Completed(CycleReport),
}

impl CycleOutcome {
    pub fn report(&self) -> Option<&CycleReport> {
        match self {
            Self::Completed(report) => Some(report),
            _ => None,
        }
    }
}

/// Clears the running flag when a cycle ends, however it ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl<'a> RunningGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Owns the poll cycle.
pub struct Reconciler {
    fetcher: Arc<dyn RemoteFetcher>,
    store: Arc<dyn StateStore>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    running: AtomicBool,
    shut_down: AtomicBool,
    notifications: Mutex<JoinSet<()>>,
}

impl Reconciler {
    pub fn new(
        fetcher: Arc<dyn RemoteFetcher>,
        store: Arc<dyn StateStore>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            fetcher,
            store,
            notifier,
            clock,
            running: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            notifications: Mutex::new(JoinSet::new()),
        }
    }

    /// Whether a cycle is in progress.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Check collaborators before the first cycle.
    ///
    /// Verifies the store schema, resolves the fetch scope and seeds the
    /// fetcher's cursor from the store. Any failure is fatal.
    pub async fn prepare(&self) -> Result<(), PollError> {
        self.store
            .verify_schema()
            .await
            .map_err(PollError::into_initialization)?;

        self.fetcher
            .prepare()
            .await
            .map_err(PollError::into_initialization)?;

        let cursor = self
            .store
            .last_cursor()
            .await
            .map_err(PollError::into_initialization)?;
        if let Some(cursor) = cursor {
            self.fetcher.resume_from(cursor);
        }

        Ok(())
    }

    /// Run one cycle unless one is already running.
    pub async fn run_cycle(&self) -> CycleOutcome {
        let Some(_guard) = RunningGuard::acquire(&self.running) else {
            log::info!("Polling already in progress, skipping...");
            return CycleOutcome::Skipped;
        };

        log::info!("Polling {}...", self.fetcher.describe());

        let batch = match self.fetcher.fetch_current().await {
            Ok(batch) => batch,
            Err(e) => {
                log::error!("Polling error: {}", e);
                return CycleOutcome::FetchFailed(e);
            }
        };

        if batch.items.is_empty() {
            log::info!("No items found");
            if let Some(cursor) = batch.next_cursor {
                self.fetcher.commit_cursor(cursor);
            }
            return CycleOutcome::Empty;
        }

        log::info!("Found {} items", batch.items.len());

        let mut report = CycleReport::default();
        for item in &batch.items {
            let outcome = self.reconcile_item(item).await;
            report.items.push((item.identity, outcome));
        }

        if let Some(cursor) = batch.next_cursor {
            self.fetcher.commit_cursor(cursor);
        }

        log::info!("Cycle complete: {}", report);
        CycleOutcome::Completed(report)
    }

    async fn reconcile_item(&self, item: &RemoteItem) -> ItemOutcome {
        let stored = match self.store.lookup(&item.identity).await {
            Ok(stored) => stored,
            Err(e) => {
                log::error!("Error processing {} {}: {}", item.kind, item.identity, e);
                return ItemOutcome::LookupFailed;
            }
        };

        let classification = Classification::of(stored.as_ref(), item);
        match classification {
            Classification::New => {
                log::info!("New {}: {}", item.kind, item.display_ref());
                self.spawn_notification(Notification::new_item(item));
            }
            Classification::Updated => {
                log::info!("{} updated: {}", item.kind.label(), item.display_ref());
                if let Some(transition) = stored.as_ref().and_then(|s| StateTransition::between(s, item)) {
                    if transition.is_reopen() {
                        log::info!("{} reopened ({}): {}", item.kind.label(), transition, item.display_ref());
                    } else {
                        log::info!("{} is now {} ({}): {}", item.kind.label(), transition.to, transition, item.display_ref());
                    }
                }
            }
            Classification::Unchanged => {
                log::debug!("{} unchanged: {}", item.kind.label(), item.display_ref());
            }
        }

        match self.store.upsert(item, self.clock.now()).await {
            Ok(()) => ItemOutcome::Persisted(classification),
            Err(e) => {
                log::error!("Error processing {} {}: {}", item.kind, item.identity, e);
                ItemOutcome::UpsertFailed(classification)
            }
        }
    }

    fn spawn_notification(&self, notification: Notification) {
        let notifier = Arc::clone(&self.notifier);
        let mut tasks = self.notifications.lock().unwrap_or_else(|e| e.into_inner());

        // Reap finished sends so the set does not grow without bound
        while tasks.try_join_next().is_some() {}

        tasks.spawn(async move {
            if let Err(e) = notifier.notify(&notification).await {
                log::warn!("Failed to send notification '{}': {}", notification.title, e);
            }
        });
    }

    /// Wait for every pending notification to finish.
    pub async fn drain_notifications(&self) {
        let mut tasks = {
            let mut guard = self.notifications.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                log::warn!("Notification task failed: {}", e);
            }
        }
    }

    /// Wait for notifications, then close the store. Runs once.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.drain_notifications().await;
        self.store.close().await;
    }
}
