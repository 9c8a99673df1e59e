#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use nodemux::engine::{EngineParts, EngineSettings};
use nodemux::inventory::{NodeId, NoteMap, SnapshotMap};
use nodemux::persist::{MemoryStore, PersistedState, Persistence, PersistenceError};
use nodemux::remote::{
    ProbeError, ProbeFailure, ProbedSession, RemoteShell, SessionControl, SessionProbe, SshOptions,
};
use nodemux::scan::ScanOptions;
use nodemux::slurm::{NodeAllocation, NodeResolver, ResolveError};

/// Default bound for polling helpers.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn session(name: &str) -> ProbedSession {
    ProbedSession {
        name: name.to_string(),
        created_at: DateTime::from_timestamp(1_700_000_000, 0),
        attached: false,
    }
}

pub fn allocations(nodes: &[&str]) -> Vec<NodeAllocation> {
    nodes
        .iter()
        .map(|n| NodeAllocation::new(*n, Some("1:00:00")))
        .collect()
}

/// Poll `cond` until it holds or `WAIT_TIMEOUT` passes.
pub async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

// ── Resolver ───────────────────────────────────────────────────────

/// Resolver whose answer the test sets between cycles.
pub struct ScriptedResolver {
    answer: Mutex<Result<Vec<NodeAllocation>, String>>,
    calls: AtomicUsize,
}

impl ScriptedResolver {
    pub fn new(nodes: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            answer: Mutex::new(Ok(allocations(nodes))),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set_nodes(&self, nodes: &[&str]) {
        *self.answer.lock() = Ok(allocations(nodes));
    }

    pub fn fail(&self, message: &str) {
        *self.answer.lock() = Err(message.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NodeResolver for ScriptedResolver {
    async fn resolve(&self) -> Result<Vec<NodeAllocation>, ResolveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answer
            .lock()
            .clone()
            .map_err(ResolveError::SchedulerUnavailable)
    }
}

// ── Probe ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum NodeBehavior {
    Sessions(Vec<ProbedSession>),
    Fail(String),
    /// Never answers; only a deadline gets the caller out.
    Hang,
}

/// In-memory probe. Unknown nodes report no sessions.
#[derive(Default)]
pub struct FakeProbe {
    nodes: Mutex<HashMap<NodeId, NodeBehavior>>,
    failing_captures: Mutex<Vec<(NodeId, String)>>,
    hanging_captures: Mutex<Vec<(NodeId, String)>>,
    /// When set, every `list_sessions` call waits for one permit.
    gate: Mutex<Option<Arc<Semaphore>>>,
    delay: Mutex<Option<Duration>>,
    list_calls: AtomicUsize,
    capture_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_sessions(&self, node: &str, names: &[&str]) {
        self.nodes.lock().insert(
            NodeId::from(node),
            NodeBehavior::Sessions(names.iter().map(|n| session(n)).collect()),
        );
    }

    pub fn set_behavior(&self, node: &str, behavior: NodeBehavior) {
        self.nodes.lock().insert(NodeId::from(node), behavior);
    }

    pub fn fail_capture(&self, node: &str, session: &str) {
        self.failing_captures
            .lock()
            .push((NodeId::from(node), session.to_string()));
    }

    pub fn hang_capture(&self, node: &str, session: &str) {
        self.hanging_captures
            .lock()
            .push((NodeId::from(node), session.to_string()));
    }

    /// Hold every listing until the test adds permits to the returned gate.
    pub fn close_gate(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock() = Some(gate.clone());
        gate
    }

    pub fn open_gate(&self) {
        if let Some(gate) = self.gate.lock().take() {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn capture_calls(&self) -> usize {
        self.capture_calls.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl SessionProbe for FakeProbe {
    async fn list_sessions(&self, node: &NodeId) -> Result<Vec<ProbedSession>, ProbeError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let behavior = self.nodes.lock().get(node).cloned();
        match behavior {
            None => Ok(Vec::new()),
            Some(NodeBehavior::Sessions(sessions)) => Ok(sessions),
            Some(NodeBehavior::Fail(message)) => {
                Err(ProbeError::new(node, ProbeFailure::Connect(message)))
            }
            Some(NodeBehavior::Hang) => std::future::pending().await,
        }
    }

    async fn capture(
        &self,
        node: &NodeId,
        session: &str,
        _lines: usize,
    ) -> Result<String, ProbeError> {
        self.capture_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let hangs = self
            .hanging_captures
            .lock()
            .iter()
            .any(|(n, s)| n == node && s == session);
        if hangs {
            return std::future::pending().await;
        }
        let fails = self
            .failing_captures
            .lock()
            .iter()
            .any(|(n, s)| n == node && s == session);
        if fails {
            return Err(ProbeError::new(
                node,
                ProbeFailure::Command {
                    status: Some(1),
                    stderr: "can't find pane".into(),
                },
            ));
        }
        Ok(format!("output of {session}"))
    }
}

// ── Persistence ────────────────────────────────────────────────────

/// Memory-backed persistence whose saves can be made to fail.
#[derive(Default)]
pub struct FlakyPersistence {
    inner: MemoryStore,
    failing: AtomicBool,
    saves: AtomicUsize,
}

impl FlakyPersistence {
    pub fn failing() -> Arc<Self> {
        let p = Self::default();
        p.failing.store(true, Ordering::SeqCst);
        Arc::new(p)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn notes(&self) -> NoteMap {
        self.inner.notes()
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl Persistence for FlakyPersistence {
    fn load(&self) -> Result<PersistedState, PersistenceError> {
        self.inner.load()
    }

    fn save(&self, notes: &NoteMap, snapshots: &SnapshotMap) -> Result<(), PersistenceError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(PersistenceError::Write {
                path: "/read-only/notes.json".into(),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
            });
        }
        self.inner.save(notes, snapshots)
    }
}

// ── Engine assembly ────────────────────────────────────────────────

/// Settings for tests: no periodic refresh within a test's lifetime, short
/// probe deadlines.
pub fn test_settings() -> EngineSettings {
    EngineSettings {
        refresh_interval: Duration::from_secs(3600),
        scan: ScanOptions {
            max_concurrent: 4,
            deadline: Duration::from_millis(500),
            capture_lines: None,
        },
        ..EngineSettings::default()
    }
}

/// Session control that can never reach a node.
pub fn unreachable_control() -> SessionControl {
    SessionControl::new(
        RemoteShell::new(SshOptions {
            program: "/nonexistent/ssh".into(),
            ..SshOptions::default()
        }),
        Duration::from_secs(1),
    )
}

pub fn engine_parts(
    resolver: Arc<ScriptedResolver>,
    probe: Arc<FakeProbe>,
    persistence: Arc<dyn Persistence>,
) -> EngineParts {
    EngineParts {
        resolver,
        probe,
        persistence,
        control: unreachable_control(),
        settings: test_settings(),
    }
}

pub fn now() -> DateTime<Utc> {
    Utc::now()
}
