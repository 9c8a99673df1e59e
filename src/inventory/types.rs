use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A compute node as named by the scheduler. Also the ssh target.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Validate a node name before it is handed to ssh as a destination.
///
/// Accepts hostname characters plus underscores (some sites use them in
/// node names). A leading hyphen is rejected so the name can never be
/// parsed as an ssh option.
pub fn validate_node_id(node: &str) -> Result<(), String> {
    if node.is_empty() {
        return Err("node name must not be empty".into());
    }
    if node.len() > 253 {
        return Err(format!("node name exceeds 253 characters (got {})", node.len()));
    }
    if node.starts_with('-') {
        return Err(format!("node name must not start with a hyphen: {node}"));
    }
    if !node
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(format!("node name contains invalid characters: {node}"));
    }
    Ok(())
}

/// Validate a name for a session we are about to create.
///
/// Names must be 1-64 chars, alphanumeric/hyphens/underscores. tmux itself
/// forbids `:` and `.` in session names.
pub fn validate_session_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("session name must not be empty".into());
    }
    if name.len() > 64 {
        return Err(format!("session name too long ({} chars, max 64)", name.len()));
    }
    if !name.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_') {
        return Err(format!(
            "session name contains invalid characters: {}",
            &name[..name.len().min(64)]
        ));
    }
    Ok(())
}

/// The inventory key: a session name scoped to its node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub node: NodeId,
    pub name: String,
}

impl SessionIdentity {
    pub fn new(node: impl Into<NodeId>, name: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            name: name.into(),
        }
    }

    /// Flat `node:session` form used as the key in the notes file.
    pub fn key(&self) -> String {
        format!("{}:{}", self.node, self.name)
    }

    /// Parse a `node:session` key. Node names never contain `:`, so the
    /// first colon is the separator and the session part may contain more.
    pub fn from_key(key: &str) -> Option<Self> {
        let (node, name) = key.split_once(':')?;
        if node.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self::new(node, name))
    }
}

impl fmt::Display for SessionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiveStatus {
    /// Reported by the most recent successful probe of its node.
    Active,
    /// Known from a note, a snapshot or an earlier scan, but not confirmed now.
    Stale,
}

/// Tail of a session's pane, as last captured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedOutput {
    pub text: String,
    pub captured_at: DateTime<Utc>,
}

/// One discovered or remembered session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionRecord {
    pub identity: SessionIdentity,
    pub created_at: Option<DateTime<Utc>>,
    pub attached: bool,
    pub status: LiveStatus,
    /// When a scan last reported this session. `None` for records that
    /// only exist because of persisted state.
    pub last_seen: Option<DateTime<Utc>>,
    pub note: Option<String>,
    pub snapshot: Option<CapturedOutput>,
}

impl SessionRecord {
    /// A record rebuilt from persisted state, before any scan has seen it.
    pub fn remembered(identity: SessionIdentity) -> Self {
        Self {
            identity,
            created_at: None,
            attached: false,
            status: LiveStatus::Stale,
            last_seen: None,
            note: None,
            snapshot: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == LiveStatus::Active
    }

    /// Whether the record carries anything the user would lose if it vanished.
    pub fn has_user_data(&self) -> bool {
        self.note.as_deref().is_some_and(|n| !n.is_empty())
            || self.snapshot.as_ref().is_some_and(|s| !s.text.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Scheduler,
    Probe,
    Capture,
    Persistence,
    Command,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Scheduler => "scheduler",
            Self::Probe => "probe",
            Self::Capture => "capture",
            Self::Persistence => "persistence",
            Self::Command => "command",
        };
        f.write_str(s)
    }
}

/// A recoverable failure kept for display. Never fatal to a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    /// The node involved, if the failure is attributable to one.
    pub node: Option<NodeId>,
    pub at: DateTime<Utc>,
    pub message: String,
}

impl ErrorRecord {
    pub fn new(kind: ErrorKind, node: Option<NodeId>, message: impl Into<String>) -> Self {
        Self {
            kind,
            node,
            at: Utc::now(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let at = self.at.format("%H:%M:%S");
        match &self.node {
            Some(node) => write!(f, "[{at}] {} {node}: {}", self.kind, self.message),
            None => write!(f, "[{at}] {}: {}", self.kind, self.message),
        }
    }
}

/// A node from the last resolution, with what we know about it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeSummary {
    pub node: NodeId,
    /// Remaining allocation time as printed by the scheduler.
    pub time_left: Option<String>,
    pub active_sessions: usize,
}

/// Immutable point-in-time view of the whole inventory.
///
/// Records are ordered Active first (by node, then name), then Stale (most
/// recently seen first, then node and name).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InventorySnapshot {
    pub records: Vec<SessionRecord>,
    pub nodes: Vec<NodeSummary>,
    pub errors: Vec<ErrorRecord>,
    /// Completion time of the scan merged into this view, if any.
    pub scanned_at: Option<DateTime<Utc>>,
}

impl InventorySnapshot {
    pub fn get(&self, identity: &SessionIdentity) -> Option<&SessionRecord> {
        self.records.iter().find(|r| &r.identity == identity)
    }

    pub fn active(&self) -> impl Iterator<Item = &SessionRecord> {
        self.records.iter().filter(|r| r.is_active())
    }

    pub fn stale(&self) -> impl Iterator<Item = &SessionRecord> {
        self.records.iter().filter(|r| !r.is_active())
    }

    /// Time left on a node's allocation, if the node is currently resolved.
    pub fn time_left(&self, node: &NodeId) -> Option<&str> {
        self.nodes
            .iter()
            .find(|n| &n.node == node)
            .and_then(|n| n.time_left.as_deref())
    }

    /// Case-insensitive substring match over node, session name and note.
    /// Ordering is preserved; an empty query keeps everything.
    pub fn filter(&self, query: &str) -> Vec<&SessionRecord> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return self.records.iter().collect();
        }
        self.records
            .iter()
            .filter(|r| {
                r.identity.node.as_str().to_lowercase().contains(&needle)
                    || r.identity.name.to_lowercase().contains(&needle)
                    || r
                        .note
                        .as_deref()
                        .is_some_and(|n| n.to_lowercase().contains(&needle))
            })
            .collect()
    }
}

/// Map type used for persisted notes and snapshots.
pub type NoteMap = BTreeMap<SessionIdentity, String>;
pub type SnapshotMap = BTreeMap<SessionIdentity, CapturedOutput>;
