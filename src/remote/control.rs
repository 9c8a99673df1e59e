use std::time::Duration;

use crate::inventory::{validate_session_name, NodeId, SessionIdentity};

use super::ssh::{RemoteError, RemoteShell};
use super::tmux;

/// A user command against a node that did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("invalid session name: {0}")]
    InvalidName(String),
    #[error("session is offline: {0}")]
    SessionOffline(SessionIdentity),
    #[error("{node}: {source}")]
    Remote {
        node: NodeId,
        #[source]
        source: RemoteError,
    },
    #[error("{node}: remote command failed (status {status:?}): {stderr}")]
    Failed {
        node: NodeId,
        status: Option<i32>,
        stderr: String,
    },
}

impl CommandError {
    /// The node the command targeted, if it got that far.
    pub fn node(&self) -> Option<&NodeId> {
        match self {
            Self::InvalidName(_) => None,
            Self::SessionOffline(id) => Some(&id.node),
            Self::Remote { node, .. } | Self::Failed { node, .. } => Some(node),
        }
    }
}

/// Create, kill and interactive entry into sessions.
///
/// Attach and shell hand the caller's terminal to ssh and block until the
/// remote side exits. The caller is responsible for suspending and restoring
/// its own terminal state around them.
#[derive(Debug, Clone)]
pub struct SessionControl {
    shell: RemoteShell,
    timeout: Duration,
}

impl SessionControl {
    pub fn new(shell: RemoteShell, timeout: Duration) -> Self {
        Self { shell, timeout }
    }

    async fn run_checked(&self, node: &NodeId, remote_cmd: &str) -> Result<(), CommandError> {
        let out = self
            .shell
            .run(node, remote_cmd, self.timeout)
            .await
            .map_err(|source| CommandError::Remote {
                node: node.clone(),
                source,
            })?;
        if out.success() {
            Ok(())
        } else {
            Err(CommandError::Failed {
                node: node.clone(),
                status: out.status,
                stderr: out.stderr.trim().to_string(),
            })
        }
    }

    /// Start a detached session named `name` on `node`.
    pub async fn create(&self, node: &NodeId, name: &str) -> Result<(), CommandError> {
        validate_session_name(name).map_err(CommandError::InvalidName)?;
        tracing::info!(node = %node, session = name, "creating session");
        self.run_checked(node, &tmux::new_session_command(name)).await
    }

    pub async fn kill(&self, identity: &SessionIdentity) -> Result<(), CommandError> {
        tracing::info!(node = %identity.node, session = %identity.name, "killing session");
        self.run_checked(&identity.node, &tmux::kill_session_command(&identity.name))
            .await
    }

    /// Attach interactively. Returns once the user detaches or the session ends.
    pub async fn attach(&self, identity: &SessionIdentity) -> Result<(), CommandError> {
        let node = &identity.node;
        let status = self
            .shell
            .interactive(node, Some(&tmux::attach_command(&identity.name)))
            .await
            .map_err(|source| CommandError::Remote {
                node: node.clone(),
                source,
            })?;
        if !status.success() {
            tracing::debug!(node = %node, ?status, "attach ended with failure status");
            return Err(CommandError::Failed {
                node: node.clone(),
                status: status.code(),
                stderr: String::new(),
            });
        }
        Ok(())
    }

    /// Open a plain login shell on a node.
    pub async fn shell(&self, node: &NodeId) -> Result<(), CommandError> {
        let status = self
            .shell
            .interactive(node, None)
            .await
            .map_err(|source| CommandError::Remote {
                node: node.clone(),
                source,
            })?;
        // A shell's exit status is whatever the user's last command returned;
        // only ssh's own failure code is worth reporting.
        if status.code() == Some(255) {
            return Err(CommandError::Failed {
                node: node.clone(),
                status: status.code(),
                stderr: String::new(),
            });
        }
        Ok(())
    }
}
