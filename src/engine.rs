//! The engine facade: the only surface a presentation layer talks to.
//!
//! `Engine::start` loads persisted state, runs one scan cycle so the first
//! render has data, then leaves a scheduler refreshing in the background.
//! Everything the user does (notes, attach, create, kill, capture) goes
//! through here.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::config::Config;
use crate::inventory::{
    ErrorKind, ErrorRecord, InventorySnapshot, InventoryStore, NodeId, SessionIdentity,
    StoreError, DEFAULT_ERROR_LOG_CAPACITY,
};
use crate::persist::{JsonFileStore, MemoryStore, Persistence};
use crate::refresh::{
    RefreshCycle, RefreshRequest, RefreshScheduler, RefreshState, DEFAULT_REFRESH_INTERVAL,
};
use crate::remote::{
    CommandError, ProbeError, ProbeFailure, RemoteShell, SessionControl, SessionProbe, SshProbe,
};
use crate::scan::{ScanCoordinator, ScanOptions, DEFAULT_CAPTURE_LINES};
use crate::slurm::{NodeResolver, SlurmResolver};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Probe(#[from] ProbeError),
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub refresh_interval: Duration,
    pub scan: ScanOptions,
    pub error_log_capacity: usize,
    /// Lines captured by an on-demand [`Engine::capture`].
    pub capture_lines: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            scan: ScanOptions::default(),
            error_log_capacity: DEFAULT_ERROR_LOG_CAPACITY,
            capture_lines: DEFAULT_CAPTURE_LINES,
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            refresh_interval: config.refresh_interval(),
            scan: config.scan_options(),
            error_log_capacity: config.error_log_capacity,
            capture_lines: config.capture_lines,
        }
    }
}

/// The collaborators an engine is assembled from.
pub struct EngineParts {
    pub resolver: Arc<dyn NodeResolver>,
    pub probe: Arc<dyn SessionProbe>,
    pub persistence: Arc<dyn Persistence>,
    pub control: SessionControl,
    pub settings: EngineSettings,
}

impl EngineParts {
    /// Slurm, ssh and JSON files as configured. With `ephemeral`, notes and
    /// snapshots live in memory only and nothing on disk is touched.
    pub fn from_config(config: &Config, ephemeral: bool) -> Self {
        let shell = RemoteShell::new(config.ssh_options());
        let persistence: Arc<dyn Persistence> = if ephemeral {
            Arc::new(MemoryStore::new())
        } else {
            Arc::new(JsonFileStore::new(
                config.notes_path(),
                config.snapshots_path(),
            ))
        };
        Self {
            resolver: Arc::new(SlurmResolver::new(config.slurm_options())),
            probe: Arc::new(SshProbe::new(shell.clone(), config.probe_timeout())),
            persistence,
            control: SessionControl::new(shell, config.probe_timeout()),
            settings: EngineSettings::from_config(config),
        }
    }
}

pub struct Engine {
    store: InventoryStore,
    coordinator: ScanCoordinator,
    control: SessionControl,
    scheduler: RefreshScheduler,
    capture_lines: usize,
}

impl Engine {
    /// Load persisted state, run the initial scan cycle, and start
    /// background refresh. Never fails: every external problem ends up in
    /// the error log of the returned engine's snapshot.
    pub async fn start(parts: EngineParts) -> Self {
        let EngineParts {
            resolver,
            probe,
            persistence,
            control,
            settings,
        } = parts;

        let store = InventoryStore::with_error_capacity(persistence, settings.error_log_capacity);
        store.load();

        let coordinator = ScanCoordinator::new(probe, settings.scan.clone());
        let cycle = RefreshCycle::new(resolver, coordinator.clone(), store.clone());
        let initial = cycle.run().await;
        tracing::info!(
            active = initial.active().count(),
            stale = initial.stale().count(),
            nodes = initial.nodes.len(),
            "initial scan complete"
        );

        let scheduler = RefreshScheduler::spawn(cycle, settings.refresh_interval);
        Self {
            store,
            coordinator,
            control,
            scheduler,
            capture_lines: settings.capture_lines,
        }
    }

    /// Halt background refresh and flush persistence once.
    pub async fn stop(&self, grace: Duration) -> Result<(), StoreError> {
        self.scheduler.stop(grace).await;
        self.store.flush()
    }

    pub fn force_refresh(&self) -> RefreshRequest {
        self.scheduler.force_refresh()
    }

    pub fn refresh_state(&self) -> RefreshState {
        self.scheduler.state()
    }

    /// Scan cycles completed in the background, not counting the initial one.
    pub fn refresh_cycles(&self) -> u64 {
        self.scheduler.cycles()
    }

    pub fn snapshot(&self) -> Arc<InventorySnapshot> {
        self.store.current()
    }

    /// Notified whenever a new snapshot is published.
    pub fn subscribe(&self) -> watch::Receiver<Arc<InventorySnapshot>> {
        self.store.subscribe()
    }

    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.store.errors()
    }

    pub fn store(&self) -> &InventoryStore {
        &self.store
    }

    pub fn set_note(&self, identity: &SessionIdentity, text: &str) -> Result<(), StoreError> {
        self.store.set_note(identity, text)
    }

    pub fn delete_note(&self, identity: &SessionIdentity) -> Result<(), StoreError> {
        self.store.delete_note(identity)
    }

    pub fn forget(&self, identity: &SessionIdentity) -> Result<(), StoreError> {
        self.store.forget(identity)
    }

    fn require_active(&self, identity: &SessionIdentity) -> Result<(), CommandError> {
        match self.store.current().get(identity) {
            Some(record) if record.is_active() => Ok(()),
            _ => Err(CommandError::SessionOffline(identity.clone())),
        }
    }

    fn log_command_failure<T>(&self, result: Result<T, CommandError>) -> Result<T, CommandError> {
        if let Err(e) = &result {
            tracing::warn!(error = %e, "command failed");
            self.store.record_error(ErrorRecord::new(
                ErrorKind::Command,
                e.node().cloned(),
                e.to_string(),
            ));
        }
        result
    }

    /// Hand the terminal to the session until the user detaches.
    pub async fn attach(&self, identity: &SessionIdentity) -> Result<(), CommandError> {
        self.require_active(identity)?;
        let result = self.control.attach(identity).await;
        // Whatever happened inside the session may have changed the node.
        self.force_refresh();
        self.log_command_failure(result)
    }

    pub async fn shell(&self, node: &NodeId) -> Result<(), CommandError> {
        let result = self.control.shell(node).await;
        self.force_refresh();
        self.log_command_failure(result)
    }

    pub async fn create(&self, node: &NodeId, name: &str) -> Result<(), CommandError> {
        let result = self.control.create(node, name).await;
        if result.is_ok() {
            self.force_refresh();
        }
        self.log_command_failure(result)
    }

    /// Kill a live session. Its note, if any, stays with the identity.
    pub async fn kill(&self, identity: &SessionIdentity) -> Result<(), CommandError> {
        self.require_active(identity)?;
        let result = self.control.kill(identity).await;
        if result.is_ok() {
            self.force_refresh();
        }
        self.log_command_failure(result)
    }

    /// Capture a live session's recent output now and store it as the
    /// session's snapshot.
    pub async fn capture(&self, identity: &SessionIdentity) -> Result<String, EngineError> {
        self.require_active(identity)?;
        let deadline = self.coordinator.options().deadline;
        let captured = match tokio::time::timeout(
            deadline,
            self.coordinator
                .probe()
                .capture(&identity.node, &identity.name, self.capture_lines),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ProbeError::new(
                &identity.node,
                ProbeFailure::Timeout(deadline),
            )),
        };
        let text = match captured {
            Ok(text) => text,
            Err(e) => {
                self.store.record_error(ErrorRecord::new(
                    ErrorKind::Capture,
                    Some(identity.node.clone()),
                    format!("{}: {}", identity.name, e.cause),
                ));
                return Err(e.into());
            }
        };
        self.store.record_snapshot(identity, &text, Utc::now())?;
        Ok(text)
    }
}
