//! nodemux - tmux sessions across your Slurm allocations
//!
//! Resolves the nodes the scheduler has given you, lists the tmux sessions
//! on each, and keeps notes and captured output for them even after a
//! session or its node goes away.
//!
//! With no subcommand, prints the current inventory (same as `list`).

use clap::{Parser as ClapParser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio_stream::{wrappers::WatchStream, StreamExt};
use tracing_subscriber::{
    layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry,
};
use nodemux::{
    config::{self, Config, ConfigError},
    engine::{Engine, EngineError, EngineParts},
    inventory::{InventorySnapshot, NodeId, SessionIdentity, SessionRecord, StoreError},
    remote::CommandError,
};

/// How long `stop` waits for an in-flight scan before abandoning it.
const STOP_GRACE: Duration = Duration::from_secs(3);

/// nodemux - tmux sessions across your Slurm allocations
#[derive(ClapParser, Debug)]
#[command(name = "nodemux", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file (default: $XDG_CONFIG_HOME/nodemux/config.toml)
    #[arg(long, global = true, env = "NODEMUX_CONFIG")]
    config: Option<PathBuf>,

    /// Keep notes and snapshots in memory only; never read or write them on disk
    #[arg(long, global = true)]
    ephemeral: bool,

    /// Seconds between background refreshes
    #[arg(long, global = true, env = "NODEMUX_INTERVAL")]
    interval: Option<u64>,

    /// Capture recent output of every live session on each scan
    #[arg(long, global = true)]
    snapshot: bool,

    /// Scheduler user whose jobs are listed (default: $USER)
    #[arg(long, global = true, env = "NODEMUX_USER")]
    user: Option<String>,

    /// Maximum probes in flight at once
    #[arg(long, global = true)]
    max_concurrent: Option<usize>,

    /// Per-probe timeout in seconds
    #[arg(long, global = true)]
    probe_timeout: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the inventory once
    List {
        /// Only show sessions whose node, name or note contains this text
        #[arg(long)]
        filter: Option<String>,

        /// Print the whole snapshot as JSON
        #[arg(long)]
        json: bool,
    },

    /// Re-print the inventory every time it changes, until Ctrl+C
    Watch {
        #[arg(long)]
        filter: Option<String>,
    },

    /// Show the error log
    Errors {
        #[arg(long)]
        json: bool,
    },

    /// Attach a note to a session (empty text clears it)
    Note {
        node: String,
        session: String,
        text: Vec<String>,
    },

    /// Remove a session's note
    Unnote { node: String, session: String },

    /// Drop a stale session together with its note and snapshot
    Forget { node: String, session: String },

    /// Attach to a live session
    Attach { node: String, session: String },

    /// Open a shell on a node
    Shell { node: String },

    /// Create a detached session on a node
    New { node: String, name: String },

    /// Kill a live session
    Kill {
        node: String,
        session: String,

        /// Confirm the kill
        #[arg(long)]
        yes: bool,
    },

    /// Capture a live session's recent output and store it
    Capture { node: String, session: String },
}

#[derive(Error, Debug)]
pub enum NodemuxError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    Command(#[from] CommandError),

    #[error("{0}")]
    Engine(#[from] EngineError),

    #[error("{0}")]
    Usage(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() {
    let logs = init_tracing();
    let cli = Cli::parse();

    if let Err(e) = run(cli, &logs).await {
        eprintln!("nodemux: {}", e);
        std::process::exit(1);
    }
}

/// Handle to the live log filter.
struct LogControl {
    handle: reload::Handle<EnvFilter, Registry>,
    directives: String,
}

impl LogControl {
    /// Silence logging until the guard drops. Background refreshes keep
    /// running while an interactive ssh owns the terminal, and their log
    /// lines must not land on the remote screen.
    fn quiet(&self) -> QuietLogs<'_> {
        if let Err(e) = self.handle.reload(EnvFilter::new("off")) {
            tracing::debug!(error = %e, "failed to silence logs");
        }
        QuietLogs(self)
    }
}

struct QuietLogs<'a>(&'a LogControl);

impl Drop for QuietLogs<'_> {
    fn drop(&mut self) {
        let _ = self.0.handle.reload(EnvFilter::new(&self.0.directives));
    }
}

/// Logs go to stderr so listings and `--json` output on stdout stay clean.
fn init_tracing() -> LogControl {
    let directives = std::env::var("RUST_LOG").unwrap_or_else(|_| "nodemux=info".into());
    let (filter, handle) = reload::Layer::new(EnvFilter::new(&directives));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
    LogControl { handle, directives }
}

fn load_config(cli: &Cli) -> Result<Config, NodemuxError> {
    let path = cli.config.clone().unwrap_or_else(config::default_config_path);
    let mut config = match Config::load(&path)? {
        Some(config) => {
            tracing::debug!(path = %path.display(), "loaded config");
            config
        }
        None => Config::default(),
    };

    if let Some(secs) = cli.interval {
        config.refresh_interval_secs = secs.max(1);
    }
    if cli.snapshot {
        config.snapshot_mode = true;
    }
    if let Some(user) = &cli.user {
        config.scheduler.user = Some(user.clone());
    }
    if let Some(n) = cli.max_concurrent {
        config.max_concurrent_probes = n.max(1);
    }
    if let Some(secs) = cli.probe_timeout {
        config.probe_timeout_secs = secs.max(1);
    }
    Ok(config)
}

async fn run(cli: Cli, logs: &LogControl) -> Result<(), NodemuxError> {
    let config = load_config(&cli)?;
    let command = cli.command.unwrap_or(Commands::List {
        filter: None,
        json: false,
    });

    // Refuse before touching any node.
    if let Commands::Kill { yes: false, node, session } = &command {
        return Err(NodemuxError::Usage(format!(
            "refusing to kill {node}:{session} without --yes"
        )));
    }

    let engine = Engine::start(EngineParts::from_config(&config, cli.ephemeral)).await;
    let result = dispatch(&engine, command, logs).await;
    if let Err(e) = engine.stop(STOP_GRACE).await {
        eprintln!("nodemux: warning: {}", e);
    }
    result
}

async fn dispatch(
    engine: &Engine,
    command: Commands,
    logs: &LogControl,
) -> Result<(), NodemuxError> {
    match command {
        Commands::List { filter, json } => {
            let snapshot = engine.snapshot();
            if json {
                println!("{}", serde_json::to_string_pretty(&*snapshot)?);
            } else {
                print_inventory(&snapshot, filter.as_deref().unwrap_or(""));
            }
            Ok(())
        }
        Commands::Watch { filter } => run_watch(engine, filter.unwrap_or_default()).await,
        Commands::Errors { json } => {
            let errors = engine.errors();
            if json {
                println!("{}", serde_json::to_string_pretty(&errors)?);
            } else if errors.is_empty() {
                println!("No errors.");
            } else {
                for e in &errors {
                    println!("{}", e);
                }
            }
            Ok(())
        }
        Commands::Note { node, session, text } => {
            let identity = SessionIdentity::new(node, session);
            let text = text.join(" ");
            engine.set_note(&identity, &text)?;
            if text.trim().is_empty() {
                println!("Note on '{}' removed.", identity);
            } else {
                println!("Note on '{}' saved.", identity);
            }
            Ok(())
        }
        Commands::Unnote { node, session } => {
            let identity = SessionIdentity::new(node, session);
            engine.delete_note(&identity)?;
            println!("Note on '{}' removed.", identity);
            Ok(())
        }
        Commands::Forget { node, session } => {
            let identity = SessionIdentity::new(node, session);
            engine.forget(&identity)?;
            println!("Forgot '{}'.", identity);
            Ok(())
        }
        Commands::Attach { node, session } => {
            let _quiet = logs.quiet();
            engine.attach(&SessionIdentity::new(node, session)).await?;
            Ok(())
        }
        Commands::Shell { node } => {
            let _quiet = logs.quiet();
            engine.shell(&NodeId::new(node)).await?;
            Ok(())
        }
        Commands::New { node, name } => {
            let node = NodeId::new(node);
            engine.create(&node, &name).await?;
            println!("Session '{}' created on {}.", name, node);
            Ok(())
        }
        Commands::Kill { node, session, .. } => {
            let identity = SessionIdentity::new(node, session);
            engine.kill(&identity).await?;
            println!("Session '{}' killed.", identity);
            Ok(())
        }
        Commands::Capture { node, session } => {
            let text = engine.capture(&SessionIdentity::new(node, session)).await?;
            println!("{}", text);
            Ok(())
        }
    }
}

async fn run_watch(engine: &Engine, filter: String) -> Result<(), NodemuxError> {
    let mut updates = WatchStream::new(engine.subscribe());
    let mut stdout = std::io::stdout();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            next = updates.next() => {
                let Some(snapshot) = next else { break };
                crossterm::execute!(
                    stdout,
                    crossterm::terminal::Clear(crossterm::terminal::ClearType::All),
                    crossterm::cursor::MoveTo(0, 0)
                )?;
                print_inventory(&snapshot, &filter);
                if let Some(at) = snapshot.scanned_at {
                    println!();
                    println!(
                        "Last scan {} · {} error(s) · Ctrl+C to quit",
                        at.with_timezone(&chrono::Local).format("%H:%M:%S"),
                        snapshot.errors.len()
                    );
                }
                stdout.flush()?;
            }
        }
    }
    Ok(())
}

fn print_inventory(snapshot: &InventorySnapshot, filter: &str) {
    let records = snapshot.filter(filter);
    if records.is_empty() {
        if snapshot.nodes.is_empty() {
            println!("No allocated nodes and no remembered sessions.");
        } else {
            println!("No sessions.");
        }
    } else {
        println!(
            "{:<12} {:<16} {:<24} {:<10} {}",
            "TIME LEFT", "NODE", "SESSION", "STATUS", "NOTES"
        );
        for record in records {
            println!(
                "{:<12} {:<16} {:<24} {:<10} {}",
                snapshot.time_left(&record.identity.node).unwrap_or("-"),
                record.identity.node,
                record.identity.name,
                status_label(record),
                record.note.as_deref().unwrap_or(""),
            );
        }
    }

    let idle: Vec<_> = snapshot
        .nodes
        .iter()
        .filter(|n| n.active_sessions == 0)
        .collect();
    if !idle.is_empty() && filter.is_empty() {
        println!();
        println!("Nodes without sessions:");
        for n in idle {
            println!("  {:<16} {}", n.node, n.time_left.as_deref().unwrap_or("-"));
        }
    }
}

fn status_label(record: &SessionRecord) -> &'static str {
    match (record.is_active(), record.attached) {
        (true, true) => "attached",
        (true, false) => "active",
        (false, _) => "stale",
    }
}
