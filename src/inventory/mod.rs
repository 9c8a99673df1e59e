//! The merged session inventory.
//!
//! [`InventoryStore`] is the only shared mutable state in the engine. The
//! background refresh merges scan results into it while the foreground
//! edits notes; both go through the store's methods, which serialize on one
//! lock and publish a fresh immutable [`InventorySnapshot`] after every
//! change.

pub mod store;
pub mod types;

pub use store::{InventoryStore, StoreError, DEFAULT_ERROR_LOG_CAPACITY};
pub use types::{
    validate_node_id, validate_session_name, CapturedOutput, ErrorKind, ErrorRecord,
    InventorySnapshot, LiveStatus, NodeId, NodeSummary, NoteMap, SessionIdentity, SessionRecord,
    SnapshotMap,
};
