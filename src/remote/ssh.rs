use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::Command;

use crate::inventory::{validate_node_id, NodeId};

/// Default ssh `ConnectTimeout`, in seconds.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct SshOptions {
    /// ssh binary to invoke.
    pub program: String,
    pub connect_timeout: Duration,
    /// Extra `-o` style arguments inserted before the destination.
    pub extra_options: Vec<String>,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            program: "ssh".to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            extra_options: Vec::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("invalid node name: {0}")]
    InvalidNode(String),
    #[error("failed to run ssh: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Captured result of a non-interactive remote command.
#[derive(Debug, Clone)]
pub struct RemoteOutput {
    /// Exit code; `None` if ssh was killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl RemoteOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// ssh reserves exit status 255 for its own failures (resolve, connect,
    /// auth), so anything else came from the remote command.
    pub fn is_connection_failure(&self) -> bool {
        self.status == Some(255)
    }
}

/// Quote a string for a POSIX shell on the remote side.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Runs commands on nodes over ssh.
#[derive(Debug, Clone, Default)]
pub struct RemoteShell {
    options: SshOptions,
}

impl RemoteShell {
    pub fn new(options: SshOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &SshOptions {
        &self.options
    }

    fn command(&self, node: &NodeId, tty: bool) -> Result<Command, RemoteError> {
        validate_node_id(node.as_str()).map_err(RemoteError::InvalidNode)?;
        let mut cmd = Command::new(&self.options.program);
        if tty {
            cmd.arg("-t");
        } else {
            // Never prompt: a password or host-key question would hang the probe.
            cmd.args(["-o", "BatchMode=yes"]);
        }
        cmd.args(["-o", "StrictHostKeyChecking=no"]);
        cmd.arg("-o").arg(format!(
            "ConnectTimeout={}",
            self.options.connect_timeout.as_secs().max(1)
        ));
        cmd.args(&self.options.extra_options);
        cmd.arg("--").arg(node.as_str());
        Ok(cmd)
    }

    /// Run `remote_cmd` on `node` with captured output, bounded by `timeout`.
    ///
    /// The ssh child is killed if the timeout fires.
    pub async fn run(
        &self,
        node: &NodeId,
        remote_cmd: &str,
        timeout: Duration,
    ) -> Result<RemoteOutput, RemoteError> {
        let mut cmd = self.command(node, false)?;
        cmd.arg(remote_cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn()?;
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| RemoteError::Timeout(timeout))??;

        Ok(RemoteOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Hand the local terminal to an interactive ssh session and wait for it
    /// to end. With no `remote_cmd` this is a login shell.
    pub async fn interactive(
        &self,
        node: &NodeId,
        remote_cmd: Option<&str>,
    ) -> Result<ExitStatus, RemoteError> {
        let mut cmd = self.command(node, true)?;
        if let Some(remote_cmd) = remote_cmd {
            cmd.arg(remote_cmd);
        }
        cmd.stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        tracing::debug!(node = %node, ?remote_cmd, "starting interactive ssh");
        Ok(cmd.status().await?)
    }
}
