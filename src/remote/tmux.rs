//! tmux command lines and output parsing.
//!
//! Everything here is pure string work so it can be tested without a node.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::ssh::shell_quote;

/// `list-sessions` format. Fields are read from the right because session
/// names may themselves contain `|`.
pub const LIST_FORMAT: &str = "#{session_name}|#{session_created}|#{session_attached}";

/// One session as reported by `tmux list-sessions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbedSession {
    pub name: String,
    pub created_at: Option<DateTime<Utc>>,
    pub attached: bool,
}

pub fn list_sessions_command() -> String {
    format!("tmux list-sessions -F {}", shell_quote(LIST_FORMAT))
}

/// Exact-match session target (`=name`), so `train` never resolves to
/// `train-old` by prefix.
fn session_target(name: &str) -> String {
    shell_quote(&format!("={name}"))
}

pub fn capture_command(name: &str, lines: usize) -> String {
    format!(
        "tmux capture-pane -p -t {} -S -{}",
        shell_quote(&format!("={name}:")),
        lines.max(1)
    )
}

pub fn new_session_command(name: &str) -> String {
    format!("tmux new-session -d -s {}", shell_quote(name))
}

pub fn kill_session_command(name: &str) -> String {
    format!("tmux kill-session -t {}", session_target(name))
}

pub fn attach_command(name: &str) -> String {
    format!("tmux attach-session -t {}", session_target(name))
}

/// Whether a failed `list-sessions` just means there is nothing to list.
///
/// tmux exits non-zero when no server is running, which is the normal state
/// of a node with no sessions.
pub fn is_no_sessions(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    stderr.contains("no server running")
        || stderr.contains("no sessions")
        || stderr.contains("failed to connect to server")
        || stderr.contains("error connecting to")
}

/// Parse `list-sessions` output produced with [`LIST_FORMAT`].
///
/// Blank lines are skipped. Any other line that does not parse fails the
/// whole listing with the offending line.
pub fn parse_session_list(stdout: &str) -> Result<Vec<ProbedSession>, (String, String)> {
    let mut sessions = Vec::new();
    for line in stdout.lines() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        let session = parse_session_line(line).map_err(|reason| (line.to_string(), reason))?;
        sessions.push(session);
    }
    Ok(sessions)
}

fn parse_session_line(line: &str) -> Result<ProbedSession, String> {
    let mut fields = line.rsplitn(3, '|');
    let attached = fields.next().ok_or("missing attached field")?;
    let created = fields.next().ok_or("missing created field")?;
    let name = fields.next().ok_or("missing session name")?;
    if name.is_empty() {
        return Err("empty session name".into());
    }

    let attached: u32 = attached
        .trim()
        .parse()
        .map_err(|_| format!("bad attached count {attached:?}"))?;
    let created_at = match created.trim() {
        "" => None,
        secs => {
            let secs: i64 = secs
                .parse()
                .map_err(|_| format!("bad creation time {created:?}"))?;
            Some(
                DateTime::from_timestamp(secs, 0)
                    .ok_or_else(|| format!("creation time out of range {secs}"))?,
            )
        }
    };

    Ok(ProbedSession {
        name: name.to_string(),
        created_at,
        attached: attached > 0,
    })
}

/// Trim the blank rows `capture-pane` pads the visible area with.
pub fn clean_capture(stdout: &str) -> String {
    stdout.trim_end().to_string()
}
