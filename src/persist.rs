//! Durable storage for user notes and captured output.
//!
//! Notes live in a flat JSON object keyed by `node:session`, the same shape
//! hand-edited note files tend to have. Snapshots are kept in a second file
//! so that a large capture never puts the notes at risk.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::inventory::{CapturedOutput, NoteMap, SessionIdentity, SnapshotMap};

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The file could not be read at load time, so writing it now could
    /// destroy content that was never loaded.
    #[error("not overwriting {}: it could not be read at startup", .path.display())]
    Unreadable { path: PathBuf },
    #[error("failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Everything loaded at startup.
#[derive(Debug, Clone, Default)]
pub struct PersistedState {
    pub notes: NoteMap,
    pub snapshots: SnapshotMap,
    /// Non-fatal problems hit while loading (malformed files, bad keys).
    pub warnings: Vec<String>,
}

/// Load/save gateway for notes and snapshots.
///
/// Called synchronously, under the inventory lock, after every mutation of
/// a persisted field.
pub trait Persistence: Send + Sync {
    fn load(&self) -> Result<PersistedState, PersistenceError>;
    fn save(&self, notes: &NoteMap, snapshots: &SnapshotMap) -> Result<(), PersistenceError>;
}

/// JSON files on local disk.
///
/// A file that exists but cannot be read (permissions, a directory in its
/// place, I/O errors) is never written afterwards by this store.
#[derive(Debug)]
pub struct JsonFileStore {
    notes_path: PathBuf,
    snapshots_path: PathBuf,
    unreadable: Mutex<BTreeSet<PathBuf>>,
}

#[derive(Serialize, Deserialize)]
struct StoredSnapshot {
    text: String,
    captured_at: chrono::DateTime<chrono::Utc>,
}

impl JsonFileStore {
    pub fn new(notes_path: impl Into<PathBuf>, snapshots_path: impl Into<PathBuf>) -> Self {
        Self {
            notes_path: notes_path.into(),
            snapshots_path: snapshots_path.into(),
            unreadable: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn notes_path(&self) -> &Path {
        &self.notes_path
    }

    pub fn snapshots_path(&self) -> &Path {
        &self.snapshots_path
    }

    /// Read one file, remembering it as off-limits for saves if it exists
    /// but cannot be read.
    fn read_guarded<T: serde::de::DeserializeOwned>(
        &self,
        path: &Path,
        warnings: &mut Vec<String>,
    ) -> BTreeMap<String, T> {
        match read_object(path, warnings) {
            Ok(map) => {
                self.unreadable.lock().remove(path);
                map
            }
            Err(e) => {
                tracing::warn!(error = %e, "state file unreadable, it will not be overwritten");
                warnings.push(format!("{e}; leaving it untouched"));
                self.unreadable.lock().insert(path.to_path_buf());
                BTreeMap::new()
            }
        }
    }

    fn write_unless_unreadable(
        &self,
        path: &Path,
        contents: &str,
    ) -> Result<(), PersistenceError> {
        if self.unreadable.lock().contains(path) {
            return Err(PersistenceError::Unreadable {
                path: path.to_path_buf(),
            });
        }
        write_atomic(path, contents)
    }
}

/// Read a JSON object file. Missing is empty; malformed content is moved
/// aside to `<file>.corrupt` so the next save cannot clobber it. Any other
/// read failure is an error.
fn read_object<T: serde::de::DeserializeOwned>(
    path: &Path,
    warnings: &mut Vec<String>,
) -> Result<BTreeMap<String, T>, PersistenceError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(source) => {
            return Err(PersistenceError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    if contents.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    match serde_json::from_str(&contents) {
        Ok(map) => Ok(map),
        Err(e) => {
            let mut aside = path.as_os_str().to_owned();
            aside.push(".corrupt");
            let aside = PathBuf::from(aside);
            let moved = std::fs::rename(path, &aside).is_ok();
            tracing::warn!(
                path = %path.display(),
                error = %e,
                moved,
                "malformed state file, starting empty"
            );
            warnings.push(if moved {
                format!(
                    "{} is malformed ({e}); moved to {}",
                    path.display(),
                    aside.display()
                )
            } else {
                format!("{} is malformed ({e})", path.display())
            });
            Ok(BTreeMap::new())
        }
    }
}

/// Write through a sibling temp file and rename, so a crash mid-write leaves
/// the previous contents intact.
fn write_atomic(path: &Path, contents: &str) -> Result<(), PersistenceError> {
    let write_err = |source: std::io::Error| PersistenceError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, contents).map_err(write_err)?;
    std::fs::rename(&tmp, path).map_err(write_err)?;
    Ok(())
}

impl Persistence for JsonFileStore {
    fn load(&self) -> Result<PersistedState, PersistenceError> {
        let mut state = PersistedState::default();

        let notes: BTreeMap<String, String> =
            self.read_guarded(&self.notes_path, &mut state.warnings);
        for (key, note) in notes {
            match SessionIdentity::from_key(&key) {
                Some(id) if !note.is_empty() => {
                    state.notes.insert(id, note);
                }
                Some(_) => {}
                None => state.warnings.push(format!("ignoring note with bad key {key:?}")),
            }
        }

        let snapshots: BTreeMap<String, StoredSnapshot> =
            self.read_guarded(&self.snapshots_path, &mut state.warnings);
        for (key, snap) in snapshots {
            match SessionIdentity::from_key(&key) {
                Some(id) => {
                    state.snapshots.insert(
                        id,
                        CapturedOutput {
                            text: snap.text,
                            captured_at: snap.captured_at,
                        },
                    );
                }
                None => state
                    .warnings
                    .push(format!("ignoring snapshot with bad key {key:?}")),
            }
        }

        tracing::debug!(
            notes = state.notes.len(),
            snapshots = state.snapshots.len(),
            "loaded persisted state"
        );
        Ok(state)
    }

    /// Both files are attempted; the first failure is returned.
    fn save(&self, notes: &NoteMap, snapshots: &SnapshotMap) -> Result<(), PersistenceError> {
        let notes: BTreeMap<String, &String> =
            notes.iter().map(|(id, note)| (id.key(), note)).collect();
        let notes_saved =
            self.write_unless_unreadable(&self.notes_path, &serde_json::to_string_pretty(&notes)?);

        let snapshots: BTreeMap<String, StoredSnapshot> = snapshots
            .iter()
            .map(|(id, snap)| {
                (
                    id.key(),
                    StoredSnapshot {
                        text: snap.text.clone(),
                        captured_at: snap.captured_at,
                    },
                )
            })
            .collect();
        let snapshots_saved = self.write_unless_unreadable(
            &self.snapshots_path,
            &serde_json::to_string_pretty(&snapshots)?,
        );
        notes_saved.and(snapshots_saved)
    }
}

/// Process-local state only. Used when persistence is disabled and in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<(NoteMap, SnapshotMap)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_notes(notes: NoteMap) -> Self {
        Self {
            inner: Mutex::new((notes, SnapshotMap::new())),
        }
    }

    pub fn notes(&self) -> NoteMap {
        self.inner.lock().0.clone()
    }

    pub fn snapshots(&self) -> SnapshotMap {
        self.inner.lock().1.clone()
    }
}

impl Persistence for MemoryStore {
    fn load(&self) -> Result<PersistedState, PersistenceError> {
        let inner = self.inner.lock();
        Ok(PersistedState {
            notes: inner.0.clone(),
            snapshots: inner.1.clone(),
            warnings: Vec::new(),
        })
    }

    fn save(&self, notes: &NoteMap, snapshots: &SnapshotMap) -> Result<(), PersistenceError> {
        *self.inner.lock() = (notes.clone(), snapshots.clone());
        Ok(())
    }
}
