//! nodemux - tmux sessions across scheduler-allocated nodes
//!
//! Discovers the compute nodes a batch scheduler has allocated to the
//! current user, probes each one over ssh for tmux sessions, and keeps a
//! merged inventory of live sessions alongside user notes and captured
//! output that survive the session (or the node) going away.

pub mod config;
pub mod engine;
pub mod inventory;
pub mod persist;
pub mod refresh;
pub mod remote;
pub mod scan;
pub mod slurm;
