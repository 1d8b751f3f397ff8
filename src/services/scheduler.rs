//! Fixed-interval scheduling of poll cycles.
//!
//! The poller owns a background task that triggers a cycle on every interval
//! tick (the first one immediately) and on manual triggers. Cycles are
//! spawned so a slow cycle never delays the timer; the reconciler's guard
//! drops triggers that arrive while a cycle is still running.

use crate::error::PollError;
use crate::services::reconciler::{CycleOutcome, Reconciler};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Default polling interval (1 minute).
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Commands that can be sent to the running poller.
#[derive(Debug)]
enum PollCommand {
    /// Run a cycle now.
    Trigger,
}

/// Schedules cycles of a [`Reconciler`].
pub struct Poller {
    reconciler: Arc<Reconciler>,
    interval: Duration,
}

impl Poller {
    pub fn new(reconciler: Arc<Reconciler>, interval: Duration) -> Self {
        Self {
            reconciler,
            interval,
        }
    }

    /// Start the background loop. The first cycle runs immediately.
    pub fn start(self) -> PollerHandle {
        let (tx, rx) = mpsc::channel::<PollCommand>(16);
        let cancel = CancellationToken::new();
        let reconciler = self.reconciler.clone();

        log::info!(
            "Poller started, interval {}s",
            self.interval.as_secs_f64()
        );
        let task = tokio::spawn(run_loop(self.reconciler, self.interval, rx, cancel.clone()));

        PollerHandle {
            command_tx: tx,
            cancel,
            task: Mutex::new(Some(task)),
            reconciler,
        }
    }
}

fn spawn_cycle(cycles: &mut JoinSet<CycleOutcome>, reconciler: &Arc<Reconciler>, cancel: &CancellationToken) {
    if cancel.is_cancelled() {
        return;
    }
    let reconciler = reconciler.clone();
    cycles.spawn(async move { reconciler.run_cycle().await });
}

async fn run_loop(
    reconciler: Arc<Reconciler>,
    period: Duration,
    mut rx: mpsc::Receiver<PollCommand>,
    cancel: CancellationToken,
) {
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut cycles: JoinSet<CycleOutcome> = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            _ = interval.tick() => spawn_cycle(&mut cycles, &reconciler, &cancel),
            Some(cmd) = rx.recv() => match cmd {
                PollCommand::Trigger => {
                    log::info!("Manual poll triggered");
                    spawn_cycle(&mut cycles, &reconciler, &cancel);
                }
            },
            Some(result) = cycles.join_next(), if !cycles.is_empty() => {
                if let Err(e) = result {
                    log::error!("Poll cycle task failed: {}", e);
                }
            }
        }
    }

    // Let an in-flight cycle finish before the store is closed
    while let Some(result) = cycles.join_next().await {
        if let Err(e) = result {
            log::error!("Poll cycle task failed: {}", e);
        }
    }
    log::info!("Poller stopped");
}

/// Controls a started [`Poller`].
pub struct PollerHandle {
    command_tx: mpsc::Sender<PollCommand>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    reconciler: Arc<Reconciler>,
}

impl PollerHandle {
    /// Request an immediate cycle.
    pub async fn trigger(&self) -> Result<(), PollError> {
        if self.cancel.is_cancelled() {
            return Err(PollError::internal("Poller is stopped"));
        }
        self.command_tx
            .send(PollCommand::Trigger)
            .await
            .map_err(|_| PollError::internal("Poller is not running"))
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop the timer, wait for the running cycle and pending notifications,
    /// then close the store. Later calls return immediately.
    pub async fn stop(&self) {
        self.cancel.cancel();

        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::error!("Poller task failed: {}", e);
            }
        }

        self.reconciler.shutdown().await;
    }
}
