//! Periodic and on-demand refresh of the inventory.
//!
//! A single background task runs scan cycles (resolve nodes, scan, merge)
//! on a fixed interval and whenever a refresh is forced. Cycles never
//! overlap. Force requests that arrive while a cycle is running collapse
//! into at most one follow-up cycle, however many there are.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::inventory::{ErrorKind, ErrorRecord, InventorySnapshot, InventoryStore};
use crate::scan::{ScanCoordinator, ScanResult};
use crate::slurm::NodeResolver;

/// Default time between periodic scans.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Idle,
    Scanning,
    Stopped,
}

/// What happened to a force-refresh request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshRequest {
    /// A cycle will start promptly.
    Scheduled,
    /// A cycle is running; the request folds into a single follow-up cycle.
    Coalesced,
    /// The scheduler has stopped; nothing will run.
    Ignored,
}

/// One full resolve → scan → merge pass.
#[derive(Clone)]
pub struct RefreshCycle {
    resolver: Arc<dyn NodeResolver>,
    coordinator: ScanCoordinator,
    store: InventoryStore,
}

impl RefreshCycle {
    pub fn new(
        resolver: Arc<dyn NodeResolver>,
        coordinator: ScanCoordinator,
        store: InventoryStore,
    ) -> Self {
        Self {
            resolver,
            coordinator,
            store,
        }
    }

    /// Run one cycle and return the snapshot it published.
    ///
    /// A scheduler failure is not fatal: the cycle merges an empty node set
    /// and logs the failure, so records go Stale rather than disappearing.
    pub async fn run(&self) -> Arc<InventorySnapshot> {
        let result = match self.resolver.resolve().await {
            Ok(nodes) => self.coordinator.scan(nodes).await,
            Err(e) => {
                tracing::warn!(error = %e, "node resolution failed");
                ScanResult::unresolved(ErrorRecord::new(ErrorKind::Scheduler, None, e.to_string()))
            }
        };
        self.store.merge(result)
    }
}

struct Status {
    state: RefreshState,
    /// A forced cycle has been requested and not yet started.
    pending: bool,
}

struct Shared {
    status: Mutex<Status>,
    trigger: Notify,
    cancel: CancellationToken,
    cycles: AtomicU64,
}

/// Handle to the background refresh task.
pub struct RefreshScheduler {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RefreshScheduler {
    /// Spawn the refresh task. The first periodic cycle runs one `interval`
    /// from now; callers wanting an immediate scan run one themselves first.
    pub fn spawn(cycle: RefreshCycle, interval: Duration) -> Self {
        let shared = Arc::new(Shared {
            status: Mutex::new(Status {
                state: RefreshState::Idle,
                pending: false,
            }),
            trigger: Notify::new(),
            cancel: CancellationToken::new(),
            cycles: AtomicU64::new(0),
        });
        let task = tokio::spawn(refresh_loop(shared.clone(), cycle, interval));
        Self {
            shared,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn state(&self) -> RefreshState {
        self.shared.status.lock().state
    }

    /// Number of cycles this scheduler has completed.
    pub fn cycles(&self) -> u64 {
        self.shared.cycles.load(Ordering::Acquire)
    }

    /// Ask for a cycle now. Never cancels or queues behind a running cycle.
    pub fn force_refresh(&self) -> RefreshRequest {
        let mut status = self.shared.status.lock();
        if status.state == RefreshState::Stopped {
            return RefreshRequest::Ignored;
        }
        let request = if status.state == RefreshState::Scanning || status.pending {
            RefreshRequest::Coalesced
        } else {
            RefreshRequest::Scheduled
        };
        status.pending = true;
        // Notify keeps at most one permit, so repeats coalesce.
        self.shared.trigger.notify_one();
        request
    }

    /// Stop scheduling cycles. A cycle already running gets `grace` to finish
    /// (its probes are time-bounded) before the task is aborted.
    pub async fn stop(&self, grace: Duration) {
        self.shared.status.lock().state = RefreshState::Stopped;
        self.shared.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(mut task) = task {
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                tracing::warn!(?grace, "refresh cycle did not finish in time, aborting");
                task.abort();
            }
        }
        tracing::debug!("refresh scheduler stopped");
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

async fn refresh_loop(shared: Arc<Shared>, cycle: RefreshCycle, interval: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            _ = shared.trigger.notified() => tracing::debug!("forced refresh"),
            _ = ticker.tick() => tracing::trace!("periodic refresh"),
        }

        {
            let mut status = shared.status.lock();
            if status.state == RefreshState::Stopped {
                break;
            }
            status.state = RefreshState::Scanning;
            status.pending = false;
        }

        let snapshot = cycle.run().await;
        shared.cycles.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(
            records = snapshot.records.len(),
            errors = snapshot.errors.len(),
            "refresh cycle finished"
        );

        {
            let mut status = shared.status.lock();
            if status.state == RefreshState::Scanning {
                status.state = RefreshState::Idle;
            }
        }
        // A full interval after every cycle, forced or periodic.
        ticker.reset();
    }

    shared.status.lock().state = RefreshState::Stopped;
}
