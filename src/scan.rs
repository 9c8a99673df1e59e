//! Fan-out of session probes across nodes.
//!
//! One scan probes every resolved node with a fixed ceiling on probes in
//! flight. A failing node contributes an error record and no sessions; it
//! never aborts the scan. The scan returns once every probe has completed
//! or hit its deadline.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use crate::inventory::{ErrorKind, ErrorRecord, NodeId};
use crate::remote::{ProbeError, ProbeFailure, ProbedSession, SessionProbe, DEFAULT_PROBE_TIMEOUT};
use crate::slurm::NodeAllocation;

/// Default ceiling on concurrent probes.
pub const DEFAULT_MAX_CONCURRENT_PROBES: usize = 20;

/// Lines of pane history captured per session in snapshot mode.
pub const DEFAULT_CAPTURE_LINES: usize = 10;

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub max_concurrent: usize,
    /// Hard deadline per probe call, enforced here on top of whatever
    /// timeout the probe applies itself.
    pub deadline: Duration,
    /// Capture this many lines of every live session. `None` disables
    /// snapshot mode.
    pub capture_lines: Option<usize>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT_PROBES,
            deadline: DEFAULT_PROBE_TIMEOUT + Duration::from_secs(1),
            capture_lines: None,
        }
    }
}

/// What one node reported.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeScan {
    pub sessions: Vec<ProbedSession>,
    /// Captured pane text by session name (snapshot mode only).
    pub captures: BTreeMap<String, String>,
}

/// The aggregated outcome of one scan pass.
#[derive(Debug, Clone)]
pub struct ScanResult {
    /// Every node that was resolved for this pass, probed or not.
    pub nodes: Vec<NodeAllocation>,
    /// Nodes whose probe succeeded. A node missing here contributes no
    /// Active sessions.
    pub probed: BTreeMap<NodeId, NodeScan>,
    pub errors: Vec<ErrorRecord>,
    pub completed_at: DateTime<Utc>,
}

impl ScanResult {
    /// A pass that could not resolve any nodes.
    pub fn unresolved(error: ErrorRecord) -> Self {
        Self {
            nodes: Vec::new(),
            probed: BTreeMap::new(),
            errors: vec![error],
            completed_at: Utc::now(),
        }
    }
}

struct NodeOutcome {
    node: NodeId,
    result: Result<NodeScan, ProbeError>,
    capture_failures: Vec<(String, ProbeError)>,
}

#[derive(Clone)]
pub struct ScanCoordinator {
    probe: Arc<dyn SessionProbe>,
    options: ScanOptions,
}

impl ScanCoordinator {
    pub fn new(probe: Arc<dyn SessionProbe>, options: ScanOptions) -> Self {
        Self { probe, options }
    }

    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    pub fn probe(&self) -> &Arc<dyn SessionProbe> {
        &self.probe
    }

    /// List one node, then (in snapshot mode) capture its live sessions one
    /// at a time. Listing gets the full deadline; all captures on the node
    /// share a second deadline, so a node costs at most two deadlines and
    /// never holds more than one ssh connection at a time.
    async fn scan_node(&self, node: NodeId) -> NodeOutcome {
        let deadline = self.options.deadline;
        let listed = match tokio::time::timeout(deadline, self.probe.list_sessions(&node)).await {
            Ok(result) => result,
            Err(_) => Err(ProbeError::new(&node, ProbeFailure::Timeout(deadline))),
        };
        let sessions = match listed {
            Ok(sessions) => sessions,
            Err(e) => {
                tracing::warn!(node = %e.node, error = %e.cause, "probe failed");
                return NodeOutcome {
                    node,
                    result: Err(e),
                    capture_failures: Vec::new(),
                };
            }
        };

        let mut scan = NodeScan {
            sessions,
            captures: BTreeMap::new(),
        };
        let mut capture_failures = Vec::new();
        if let Some(lines) = self.options.capture_lines {
            let budget = tokio::time::Instant::now() + deadline;
            for session in &scan.sessions {
                if tokio::time::Instant::now() >= budget {
                    capture_failures.push((
                        session.name.clone(),
                        ProbeError::new(&node, ProbeFailure::Timeout(deadline)),
                    ));
                    continue;
                }
                let captured = tokio::time::timeout_at(
                    budget,
                    self.probe.capture(&node, &session.name, lines),
                )
                .await;
                match captured {
                    Ok(Ok(text)) => {
                        scan.captures.insert(session.name.clone(), text);
                    }
                    Ok(Err(e)) => capture_failures.push((session.name.clone(), e)),
                    Err(_) => capture_failures.push((
                        session.name.clone(),
                        ProbeError::new(&node, ProbeFailure::Timeout(deadline)),
                    )),
                }
            }
            for (session, e) in &capture_failures {
                tracing::debug!(node = %node, session = %session, error = %e.cause, "capture failed");
            }
        }

        NodeOutcome {
            node,
            result: Ok(scan),
            capture_failures,
        }
    }

    /// Probe every node in `nodes`.
    ///
    /// Each node is one bounded task: its listing and, in snapshot mode, the
    /// captures of its live sessions. Errors come back in the order of
    /// `nodes`; a node's capture failures follow in session order.
    pub async fn scan(&self, nodes: Vec<NodeAllocation>) -> ScanResult {
        let limit = self.options.max_concurrent.max(1);
        let ids: Vec<NodeId> = nodes.iter().map(|a| a.node.clone()).collect();
        let order: HashMap<NodeId, usize> = ids
            .iter()
            .enumerate()
            .map(|(i, node)| (node.clone(), i))
            .collect();

        let mut outcomes: Vec<NodeOutcome> = stream::iter(ids)
            .map(|node| self.scan_node(node))
            .buffer_unordered(limit)
            .collect()
            .await;
        outcomes.sort_by_key(|o| order.get(&o.node).copied().unwrap_or(usize::MAX));

        let mut probed = BTreeMap::new();
        let mut errors = Vec::new();
        for outcome in outcomes {
            match outcome.result {
                Ok(scan) => {
                    probed.insert(outcome.node.clone(), scan);
                }
                Err(e) => errors.push(ErrorRecord::new(
                    ErrorKind::Probe,
                    Some(e.node),
                    e.cause.to_string(),
                )),
            }
            errors.extend(outcome.capture_failures.into_iter().map(|(session, e)| {
                ErrorRecord::new(
                    ErrorKind::Capture,
                    Some(outcome.node.clone()),
                    format!("{session}: {}", e.cause),
                )
            }));
        }

        tracing::debug!(
            nodes = nodes.len(),
            probed = probed.len(),
            errors = errors.len(),
            "scan complete"
        );

        ScanResult {
            nodes,
            probed,
            errors,
            completed_at: Utc::now(),
        }
    }
}
