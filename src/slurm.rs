//! Node resolution through Slurm.
//!
//! `squeue` lists the invoking user's jobs with their node lists and time
//! left; compressed node lists (`gpu[01-03]`) are expanded with `scontrol
//! show hostnames`.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashSet;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::inventory::NodeId;

/// Default bound on each scheduler command.
pub const DEFAULT_SCHEDULER_TIMEOUT: Duration = Duration::from_secs(10);

/// A node currently allocated to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeAllocation {
    pub node: NodeId,
    /// Remaining wall time as `squeue` prints it (`1-02:03:04`, `UNLIMITED`).
    pub time_left: Option<String>,
}

impl NodeAllocation {
    pub fn new(node: impl Into<NodeId>, time_left: Option<&str>) -> Self {
        Self {
            node: node.into(),
            time_left: time_left.map(str::to_string),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("scheduler unavailable: {0}")]
    SchedulerUnavailable(String),
}

/// Produces the set of nodes to scan. An empty set is a valid answer.
#[async_trait]
pub trait NodeResolver: Send + Sync {
    async fn resolve(&self) -> Result<Vec<NodeAllocation>, ResolveError>;
}

#[derive(Debug, Clone)]
pub struct SlurmOptions {
    /// User whose jobs are listed. Falls back to `$USER`.
    pub user: Option<String>,
    pub squeue: String,
    pub scontrol: String,
    pub timeout: Duration,
}

impl Default for SlurmOptions {
    fn default() -> Self {
        Self {
            user: None,
            squeue: "squeue".to_string(),
            scontrol: "scontrol".to_string(),
            timeout: DEFAULT_SCHEDULER_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SlurmResolver {
    options: SlurmOptions,
}

/// One `squeue` row: a (possibly compressed) node list and its time left.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRow {
    pub nodelist: String,
    pub time_left: String,
}

/// Parse `squeue -h -o "%N|%L"` output.
///
/// Pending jobs have an empty node list and are skipped. Lines that are not
/// `nodelist|time` are skipped with a warning, unless nothing else parsed,
/// in which case the output as a whole is considered malformed.
pub fn parse_squeue(stdout: &str) -> Result<Vec<JobRow>, ResolveError> {
    let mut rows = Vec::new();
    let mut malformed = Vec::new();
    let mut seen_valid = false;
    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split('|').collect();
        if parts.len() != 2 {
            malformed.push(line);
            continue;
        }
        seen_valid = true;
        let nodelist = parts[0].trim();
        if nodelist.is_empty() || nodelist == "(null)" {
            continue;
        }
        rows.push(JobRow {
            nodelist: nodelist.to_string(),
            time_left: parts[1].trim().to_string(),
        });
    }
    if !seen_valid && !malformed.is_empty() {
        return Err(ResolveError::SchedulerUnavailable(format!(
            "malformed squeue output: {:?}",
            malformed[0]
        )));
    }
    for line in malformed {
        tracing::warn!(line, "skipping malformed squeue line");
    }
    Ok(rows)
}

/// Whether a node list needs `scontrol show hostnames` to expand.
pub fn is_compressed(nodelist: &str) -> bool {
    nodelist.contains('[') || nodelist.contains(',')
}

/// Collapse repeats (a node shared by several job steps), keeping the first
/// occurrence and its time left.
pub fn dedup_allocations(allocations: Vec<NodeAllocation>) -> Vec<NodeAllocation> {
    let mut seen = HashSet::new();
    allocations
        .into_iter()
        .filter(|a| seen.insert(a.node.clone()))
        .collect()
}

impl SlurmResolver {
    pub fn new(options: SlurmOptions) -> Self {
        Self { options }
    }

    fn user(&self) -> Result<String, ResolveError> {
        self.options
            .user
            .clone()
            .filter(|u| !u.is_empty())
            .or_else(|| std::env::var("USER").ok().filter(|u| !u.is_empty()))
            .ok_or_else(|| {
                ResolveError::SchedulerUnavailable("USER is not set and no user configured".into())
            })
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<String, ResolveError> {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ResolveError::SchedulerUnavailable(format!("{program}: {e}")))?;
        let output = tokio::time::timeout(self.options.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                ResolveError::SchedulerUnavailable(format!(
                    "{program} timed out after {:?}",
                    self.options.timeout
                ))
            })?
            .map_err(|e| ResolveError::SchedulerUnavailable(format!("{program}: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ResolveError::SchedulerUnavailable(format!(
                "{program} exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Expand a compressed node list. If `scontrol` fails the list is kept
    /// as a single entry; its probe will then fail and be reported.
    async fn expand(&self, nodelist: &str) -> Vec<String> {
        match self
            .run(&self.options.scontrol, &["show", "hostnames", nodelist])
            .await
        {
            Ok(out) => {
                let hosts: Vec<String> = out
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect();
                if hosts.is_empty() {
                    vec![nodelist.to_string()]
                } else {
                    hosts
                }
            }
            Err(e) => {
                tracing::warn!(nodelist, error = %e, "failed to expand node list");
                vec![nodelist.to_string()]
            }
        }
    }
}

#[async_trait]
impl NodeResolver for SlurmResolver {
    async fn resolve(&self) -> Result<Vec<NodeAllocation>, ResolveError> {
        let user = self.user()?;
        let stdout = self
            .run(&self.options.squeue, &["-u", user.as_str(), "-h", "-o", "%N|%L"])
            .await?;

        let mut allocations = Vec::new();
        for row in parse_squeue(&stdout)? {
            let hosts = if is_compressed(&row.nodelist) {
                self.expand(&row.nodelist).await
            } else {
                vec![row.nodelist.clone()]
            };
            for host in hosts {
                allocations.push(NodeAllocation::new(host, Some(row.time_left.as_str())));
            }
        }
        let allocations = dedup_allocations(allocations);
        tracing::debug!(user = %user, nodes = allocations.len(), "resolved nodes");
        Ok(allocations)
    }
}
