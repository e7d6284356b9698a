//! Local draft persistence with file locking.
//!
//! A single slot holds the JSON-serialized in-progress session. Every
//! mutation rewrites the whole slot, so concurrent writers simply race to
//! last-write-wins.

use crate::{Error, ExerciseSession, Result};
use fs2::FileExt;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;

/// Default file name of the draft slot inside the data directory
pub const DRAFT_FILE_NAME: &str = "exercise_session_in_progress.json";

/// Single-slot store for the in-progress session
pub trait DraftStore {
    /// Load the persisted draft, if any
    fn load(&self) -> Result<Option<ExerciseSession>>;

    /// Overwrite the slot with `session`
    fn save(&self, session: &ExerciseSession) -> Result<()>;

    /// Empty the slot. Clearing an empty slot is not an error.
    fn clear(&self) -> Result<()>;
}

/// Draft slot backed by one JSON file
pub struct FileDraftStore {
    path: PathBuf,
}

impl FileDraftStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DraftStore for FileDraftStore {
    /// Missing file is `None`. A file that cannot be read or parsed is
    /// logged and also treated as `None`.
    fn load(&self) -> Result<Option<ExerciseSession>> {
        let path = &self.path;
        if !path.exists() {
            tracing::debug!("No draft at {:?}", path);
            return Ok(None);
        }

        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!("Unable to open draft {:?}: {}. Ignoring it.", path, e);
                return Ok(None);
            }
        };

        if let Err(e) = file.lock_shared() {
            tracing::warn!("Unable to lock draft {:?}: {}. Ignoring it.", path, e);
            return Ok(None);
        }

        let mut contents = String::new();
        let mut reader = std::io::BufReader::new(&file);
        if let Err(e) = reader.read_to_string(&mut contents) {
            let _ = file.unlock();
            tracing::warn!("Failed to read draft {:?}: {}. Ignoring it.", path, e);
            return Ok(None);
        }

        file.unlock()?;

        match serde_json::from_str::<ExerciseSession>(&contents) {
            Ok(session) => {
                tracing::debug!("Loaded draft {} from {:?}", session.session_id, path);
                Ok(Some(session))
            }
            Err(e) => {
                tracing::warn!("Failed to parse draft {:?}: {}. Ignoring it.", path, e);
                Ok(None)
            }
        }
    }

    /// Atomically writes the draft: temp file, fsync, rename over the slot.
    fn save(&self, session: &ExerciseSession) -> Result<()> {
        let parent = self
            .path
            .parent()
            .ok_or_else(|| Error::Storage(format!("draft path {:?} has no parent", self.path)))?;
        std::fs::create_dir_all(parent)?;

        let temp = NamedTempFile::new_in(parent)?;
        temp.as_file().lock_exclusive()?;

        {
            let mut writer = std::io::BufWriter::new(temp.as_file());
            let contents = serde_json::to_string(session)?;
            writer.write_all(contents.as_bytes())?;
            writer.flush()?;
        }

        temp.as_file().sync_all()?;
        temp.as_file().unlock()?;

        temp.persist(&self.path).map_err(|e| Error::Io(e.error))?;

        tracing::debug!("Saved draft {} to {:?}", session.session_id, self.path);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::debug!("Cleared draft {:?}", self.path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory draft slot.
///
/// Clones share the same slot, so a test can keep a handle while the
/// manager owns another.
#[derive(Clone, Default)]
pub struct MemoryDraftStore {
    slot: Arc<Mutex<Option<String>>>,
}

impl MemoryDraftStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw JSON currently held in the slot
    pub fn raw(&self) -> Option<String> {
        self.slot.lock().ok().and_then(|slot| slot.clone())
    }

    /// Replace the raw slot contents
    pub fn put_raw(&self, contents: impl Into<String>) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Some(contents.into());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.raw().is_none()
    }
}

impl DraftStore for MemoryDraftStore {
    fn load(&self) -> Result<Option<ExerciseSession>> {
        let Some(contents) = self.raw() else {
            return Ok(None);
        };
        match serde_json::from_str(&contents) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                tracing::warn!("Failed to parse in-memory draft: {}. Ignoring it.", e);
                Ok(None)
            }
        }
    }

    fn save(&self, session: &ExerciseSession) -> Result<()> {
        let contents = serde_json::to_string(session)?;
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| Error::Storage("draft slot lock poisoned".into()))?;
        *slot = Some(contents);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| Error::Storage("draft slot lock poisoned".into()))?;
        *slot = None;
        Ok(())
    }
}
