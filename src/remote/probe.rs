use async_trait::async_trait;
use std::time::Duration;

use crate::inventory::NodeId;

use super::ssh::{RemoteError, RemoteOutput, RemoteShell};
use super::tmux::{self, ProbedSession};

/// Default bound on a single probe, connection included.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a probe of one node failed.
#[derive(Debug, thiserror::Error)]
pub enum ProbeFailure {
    #[error("invalid node name: {0}")]
    InvalidNode(String),
    #[error("failed to run ssh: {0}")]
    Spawn(std::io::Error),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("remote command failed (status {status:?}): {stderr}")]
    Command { status: Option<i32>, stderr: String },
    #[error("unparsable output {line:?}: {reason}")]
    Parse { line: String, reason: String },
}

impl From<RemoteError> for ProbeFailure {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::InvalidNode(n) => Self::InvalidNode(n),
            RemoteError::Spawn(e) => Self::Spawn(e),
            RemoteError::Timeout(t) => Self::Timeout(t),
        }
    }
}

impl From<&RemoteOutput> for ProbeFailure {
    fn from(out: &RemoteOutput) -> Self {
        let stderr = out.stderr.trim().to_string();
        if out.is_connection_failure() {
            Self::Connect(stderr)
        } else {
            Self::Command {
                status: out.status,
                stderr,
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{node}: {cause}")]
pub struct ProbeError {
    pub node: NodeId,
    #[source]
    pub cause: ProbeFailure,
}

impl ProbeError {
    pub fn new(node: &NodeId, cause: impl Into<ProbeFailure>) -> Self {
        Self {
            node: node.clone(),
            cause: cause.into(),
        }
    }
}

/// Lists (and optionally captures) tmux sessions on one node.
///
/// Implementations must bound their own latency; the scan coordinator
/// relies on every call returning within a fixed time.
#[async_trait]
pub trait SessionProbe: Send + Sync {
    async fn list_sessions(&self, node: &NodeId) -> Result<Vec<ProbedSession>, ProbeError>;

    async fn capture(
        &self,
        node: &NodeId,
        session: &str,
        lines: usize,
    ) -> Result<String, ProbeError>;
}

/// [`SessionProbe`] over ssh.
#[derive(Debug, Clone)]
pub struct SshProbe {
    shell: RemoteShell,
    timeout: Duration,
}

impl SshProbe {
    pub fn new(shell: RemoteShell, timeout: Duration) -> Self {
        Self { shell, timeout }
    }
}

#[async_trait]
impl SessionProbe for SshProbe {
    async fn list_sessions(&self, node: &NodeId) -> Result<Vec<ProbedSession>, ProbeError> {
        let out = self
            .shell
            .run(node, &tmux::list_sessions_command(), self.timeout)
            .await
            .map_err(|e| ProbeError::new(node, e))?;

        if out.success() {
            let sessions = tmux::parse_session_list(&out.stdout).map_err(|(line, reason)| {
                ProbeError::new(node, ProbeFailure::Parse { line, reason })
            })?;
            tracing::trace!(node = %node, count = sessions.len(), "listed sessions");
            return Ok(sessions);
        }
        if !out.is_connection_failure() && tmux::is_no_sessions(&out.stderr) {
            tracing::trace!(node = %node, "no tmux server");
            return Ok(Vec::new());
        }
        Err(ProbeError::new(node, &out))
    }

    async fn capture(
        &self,
        node: &NodeId,
        session: &str,
        lines: usize,
    ) -> Result<String, ProbeError> {
        let out = self
            .shell
            .run(node, &tmux::capture_command(session, lines), self.timeout)
            .await
            .map_err(|e| ProbeError::new(node, e))?;
        if out.success() {
            Ok(tmux::clean_capture(&out.stdout))
        } else {
            Err(ProbeError::new(node, &out))
        }
    }
}
