use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::watch;

use crate::persist::{Persistence, PersistenceError};
use crate::scan::ScanResult;

use super::types::{
    CapturedOutput, ErrorKind, ErrorRecord, InventorySnapshot, LiveStatus, NodeSummary, NoteMap,
    SessionIdentity, SessionRecord, SnapshotMap,
};

/// Default number of error records kept for display.
pub const DEFAULT_ERROR_LOG_CAPACITY: usize = 200;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("session not found: {0}")]
    NotFound(SessionIdentity),
    #[error("session is active: {0}")]
    SessionActive(SessionIdentity),
    /// The in-memory change was applied; only the durable save failed.
    #[error("change kept in memory but not saved: {0}")]
    Persistence(#[from] PersistenceError),
}

struct StoreInner {
    records: BTreeMap<SessionIdentity, SessionRecord>,
    nodes: Vec<NodeSummary>,
    errors: VecDeque<ErrorRecord>,
    error_capacity: usize,
    scanned_at: Option<DateTime<Utc>>,
}

impl StoreInner {
    fn push_error(&mut self, record: ErrorRecord) {
        if self.error_capacity == 0 {
            return;
        }
        while self.errors.len() >= self.error_capacity {
            self.errors.pop_front();
        }
        self.errors.push_back(record);
    }

    fn persisted_maps(&self) -> (NoteMap, SnapshotMap) {
        let mut notes = NoteMap::new();
        let mut snapshots = SnapshotMap::new();
        for (id, record) in &self.records {
            if let Some(note) = record.note.as_ref().filter(|n| !n.is_empty()) {
                notes.insert(id.clone(), note.clone());
            }
            if let Some(snap) = &record.snapshot {
                snapshots.insert(id.clone(), snap.clone());
            }
        }
        (notes, snapshots)
    }

    fn build_snapshot(&self) -> InventorySnapshot {
        // BTreeMap iteration already yields (node, name) order.
        let mut active = Vec::new();
        let mut stale = Vec::new();
        for record in self.records.values() {
            match record.status {
                LiveStatus::Active => active.push(record.clone()),
                LiveStatus::Stale => stale.push(record.clone()),
            }
        }
        // Most recently seen first; records never seen by a scan go last.
        stale.sort_by(|a, b| {
            b.last_seen
                .cmp(&a.last_seen)
                .then_with(|| a.identity.cmp(&b.identity))
        });
        active.extend(stale);

        InventorySnapshot {
            records: active,
            nodes: self.nodes.clone(),
            errors: self.errors.iter().cloned().collect(),
            scanned_at: self.scanned_at,
        }
    }
}

/// Thread-safe inventory of sessions, notes and captured output.
///
/// Every operation takes the single store lock for its whole duration, so
/// merges and user commands are serialized: a command lands entirely before
/// or entirely after any given merge. Readers never take the lock; they
/// read the last published snapshot from a watch channel.
#[derive(Clone)]
pub struct InventoryStore {
    inner: Arc<Mutex<StoreInner>>,
    published: Arc<watch::Sender<Arc<InventorySnapshot>>>,
    persistence: Arc<dyn Persistence>,
}

impl InventoryStore {
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self::with_error_capacity(persistence, DEFAULT_ERROR_LOG_CAPACITY)
    }

    pub fn with_error_capacity(persistence: Arc<dyn Persistence>, error_capacity: usize) -> Self {
        let (published, _) = watch::channel(Arc::new(InventorySnapshot::default()));
        Self {
            inner: Arc::new(Mutex::new(StoreInner {
                records: BTreeMap::new(),
                nodes: Vec::new(),
                errors: VecDeque::new(),
                error_capacity,
                scanned_at: None,
            })),
            published: Arc::new(published),
            persistence,
        }
    }

    /// Seed the store from persisted notes and snapshots.
    ///
    /// Every persisted identity becomes a Stale record until a scan confirms
    /// it. A failed load leaves the store empty and logs a persistence error;
    /// it is never fatal.
    pub fn load(&self) -> Arc<InventorySnapshot> {
        let loaded = self.persistence.load();
        let mut inner = self.inner.lock();
        match loaded {
            Ok(state) => {
                for warning in state.warnings {
                    inner.push_error(ErrorRecord::new(ErrorKind::Persistence, None, warning));
                }
                for (id, note) in state.notes {
                    inner
                        .records
                        .entry(id.clone())
                        .or_insert_with(|| SessionRecord::remembered(id))
                        .note = Some(note);
                }
                for (id, snap) in state.snapshots {
                    inner
                        .records
                        .entry(id.clone())
                        .or_insert_with(|| SessionRecord::remembered(id))
                        .snapshot = Some(snap);
                }
                tracing::info!(records = inner.records.len(), "loaded inventory state");
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to load persisted state, starting empty");
                inner.push_error(ErrorRecord::new(ErrorKind::Persistence, None, e.to_string()));
            }
        }
        self.publish(&inner)
    }

    /// Merge one scan pass into the inventory and publish the result.
    ///
    /// For every node in `scan.probed`, the sessions it reported become the
    /// node's complete Active set; notes and snapshots carry over by
    /// identity. Anything previously known that this scan did not report
    /// (its session is gone, or its node failed or was not resolved) turns
    /// Stale if it carries a note or snapshot, and is dropped otherwise.
    pub fn merge(&self, scan: ScanResult) -> Arc<InventorySnapshot> {
        let at = scan.completed_at;
        let mut inner = self.inner.lock();
        let mut previous = std::mem::take(&mut inner.records);
        let mut next = BTreeMap::new();

        for (node, node_scan) in &scan.probed {
            for session in &node_scan.sessions {
                let identity = SessionIdentity::new(node.clone(), session.name.clone());
                let (note, snapshot) = previous
                    .remove(&identity)
                    .map(|prior| (prior.note, prior.snapshot))
                    .unwrap_or_default();
                next.insert(
                    identity.clone(),
                    SessionRecord {
                        identity,
                        created_at: session.created_at,
                        attached: session.attached,
                        status: LiveStatus::Active,
                        last_seen: Some(at),
                        note,
                        snapshot,
                    },
                );
            }
        }

        let mut dropped = 0usize;
        for (identity, mut record) in previous {
            record.status = LiveStatus::Stale;
            record.attached = false;
            if record.has_user_data() {
                next.insert(identity, record);
            } else {
                dropped += 1;
            }
        }

        let mut captured = 0usize;
        for (node, node_scan) in &scan.probed {
            for (name, text) in &node_scan.captures {
                let identity = SessionIdentity::new(node.clone(), name.clone());
                if let Some(record) = next.get_mut(&identity) {
                    record.snapshot = Some(CapturedOutput {
                        text: text.clone(),
                        captured_at: at,
                    });
                    captured += 1;
                }
            }
        }

        inner.records = next;
        inner.nodes = scan
            .nodes
            .iter()
            .map(|alloc| NodeSummary {
                node: alloc.node.clone(),
                time_left: alloc.time_left.clone(),
                active_sessions: scan
                    .probed
                    .get(&alloc.node)
                    .map_or(0, |n| n.sessions.len()),
            })
            .collect();
        for error in scan.errors {
            inner.push_error(error);
        }
        inner.scanned_at = Some(at);

        tracing::debug!(
            records = inner.records.len(),
            nodes = inner.nodes.len(),
            dropped,
            captured,
            "merged scan"
        );

        if captured > 0 {
            if let Err(e) = self.save(&mut inner) {
                tracing::warn!(error = %e, "failed to save captured snapshots");
            }
        }
        self.publish(&inner)
    }

    /// Attach or replace the note on a known session. Whitespace-only text
    /// clears the note, exactly like [`delete_note`](Self::delete_note).
    pub fn set_note(&self, identity: &SessionIdentity, text: &str) -> Result<(), StoreError> {
        let text = text.trim();
        if text.is_empty() {
            return self.delete_note(identity);
        }
        let mut inner = self.inner.lock();
        let record = inner
            .records
            .get_mut(identity)
            .ok_or_else(|| StoreError::NotFound(identity.clone()))?;
        record.note = Some(text.to_string());
        let saved = self.save(&mut inner);
        self.publish(&inner);
        saved
    }

    /// Clear a session's note. A Stale record with no snapshot left has no
    /// reason to exist and is removed outright.
    pub fn delete_note(&self, identity: &SessionIdentity) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let record = inner
            .records
            .get_mut(identity)
            .ok_or_else(|| StoreError::NotFound(identity.clone()))?;
        record.note = None;
        if !record.is_active() && !record.has_user_data() {
            inner.records.remove(identity);
        }
        let saved = self.save(&mut inner);
        self.publish(&inner);
        saved
    }

    /// Store captured output for a session.
    pub fn record_snapshot(
        &self,
        identity: &SessionIdentity,
        text: &str,
        captured_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let record = inner
            .records
            .get_mut(identity)
            .ok_or_else(|| StoreError::NotFound(identity.clone()))?;
        record.snapshot = Some(CapturedOutput {
            text: text.to_string(),
            captured_at,
        });
        let saved = self.save(&mut inner);
        self.publish(&inner);
        saved
    }

    /// Drop a Stale record together with its note and snapshot.
    pub fn forget(&self, identity: &SessionIdentity) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        match inner.records.get(identity) {
            None => return Err(StoreError::NotFound(identity.clone())),
            Some(record) if record.is_active() => {
                return Err(StoreError::SessionActive(identity.clone()))
            }
            Some(_) => {}
        }
        inner.records.remove(identity);
        let saved = self.save(&mut inner);
        self.publish(&inner);
        saved
    }

    /// Append to the error log and republish.
    pub fn record_error(&self, record: ErrorRecord) {
        let mut inner = self.inner.lock();
        inner.push_error(record);
        self.publish(&inner);
    }

    /// Write the current notes and snapshots through the gateway.
    pub fn flush(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let saved = self.save(&mut inner);
        if saved.is_err() {
            self.publish(&inner);
        }
        saved
    }

    /// The latest published view. Never blocks on an in-progress merge.
    pub fn current(&self) -> Arc<InventorySnapshot> {
        self.published.borrow().clone()
    }

    /// Receiver that is notified each time a new snapshot is published.
    pub fn subscribe(&self) -> watch::Receiver<Arc<InventorySnapshot>> {
        self.published.subscribe()
    }

    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.current().errors.clone()
    }

    /// Save while holding the lock, so saves land in mutation order. A
    /// failure is logged to the error log; memory stays authoritative.
    ///
    /// The gateway does blocking file I/O on the calling worker thread. The
    /// files hold one small entry per session, so each save is a few
    /// kilobytes; merges only save when a scan captured output.
    fn save(&self, inner: &mut StoreInner) -> Result<(), StoreError> {
        let (notes, snapshots) = inner.persisted_maps();
        if let Err(e) = self.persistence.save(&notes, &snapshots) {
            tracing::warn!(error = %e, "failed to persist inventory state");
            inner.push_error(ErrorRecord::new(ErrorKind::Persistence, None, e.to_string()));
            return Err(e.into());
        }
        Ok(())
    }

    fn publish(&self, inner: &StoreInner) -> Arc<InventorySnapshot> {
        let snapshot = Arc::new(inner.build_snapshot());
        self.published.send_replace(snapshot.clone());
        snapshot
    }
}
