//! Talking to nodes: ssh invocation, tmux command lines and the per-node
//! session probe.

pub mod control;
pub mod probe;
pub mod ssh;
pub mod tmux;

pub use control::{CommandError, SessionControl};
pub use probe::{ProbeError, ProbeFailure, SessionProbe, SshProbe, DEFAULT_PROBE_TIMEOUT};
pub use ssh::{shell_quote, RemoteError, RemoteOutput, RemoteShell, SshOptions};
pub use tmux::ProbedSession;
