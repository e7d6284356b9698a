//! Durable exercise log store.
//!
//! The session manager opens one log row per exercise and closes it as
//! completed or abandoned. Every call is best-effort: the manager logs and
//! swallows failures, so implementations are free to return errors.
//!
//! [`JsonlLogStore`] keeps the log as an append-only JSON Lines journal with
//! file locking, [`OfflineLogStore`] models a store that is never reachable.

use crate::{CompletionStatus, Error, ExerciseData, ExerciseType, LogId, Result, Stage};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Fields recorded when an exercise starts
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StartRecord {
    pub user_id: String,
    pub exercise_type: ExerciseType,
    pub exercise_name: String,
    pub module_context: Option<String>,
    pub module_screen: Option<String>,
    pub device_type: String,
}

/// Fields recorded when an exercise completes
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CompletionRecord {
    pub completed_at: DateTime<Utc>,
    pub duration_seconds: u64,
    pub post_rating: Option<i32>,
    pub completion_status: CompletionStatus,
    pub exercise_data: ExerciseData,
}

/// Fields recorded when an exercise is abandoned
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AbandonRecord {
    pub completion_status: CompletionStatus,
    pub duration_seconds: u64,
    pub abandoned_at_percentage: u32,
}

/// Intermediate snapshot pushed while the user edits within a stage
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProgressRecord {
    pub current_stage: Stage,
    pub percentage: u32,
    pub exercise_data: ExerciseData,
}

/// Remote log store contract
pub trait RemoteLogStore {
    /// Open a log row and return its id
    fn start_exercise(&mut self, record: &StartRecord) -> Result<LogId>;

    fn complete_exercise(&mut self, log_id: &LogId, record: &CompletionRecord) -> Result<()>;

    fn abandon_exercise(&mut self, log_id: &LogId, record: &AbandonRecord) -> Result<()>;

    /// Push an intermediate snapshot. Stores without progress tracking
    /// can keep the default no-op.
    fn sync_progress(&mut self, _log_id: &LogId, _record: &ProgressRecord) -> Result<()> {
        Ok(())
    }
}

/// One line of the journal
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LogEntry {
    Started {
        log_id: LogId,
        recorded_at: DateTime<Utc>,
        record: StartRecord,
    },
    Progress {
        log_id: LogId,
        recorded_at: DateTime<Utc>,
        record: ProgressRecord,
    },
    Completed {
        log_id: LogId,
        recorded_at: DateTime<Utc>,
        record: CompletionRecord,
    },
    Abandoned {
        log_id: LogId,
        recorded_at: DateTime<Utc>,
        record: AbandonRecord,
    },
}

impl LogEntry {
    pub fn log_id(&self) -> &LogId {
        match self {
            LogEntry::Started { log_id, .. }
            | LogEntry::Progress { log_id, .. }
            | LogEntry::Completed { log_id, .. }
            | LogEntry::Abandoned { log_id, .. } => log_id,
        }
    }

    pub fn recorded_at(&self) -> DateTime<Utc> {
        match self {
            LogEntry::Started { recorded_at, .. }
            | LogEntry::Progress { recorded_at, .. }
            | LogEntry::Completed { recorded_at, .. }
            | LogEntry::Abandoned { recorded_at, .. } => *recorded_at,
        }
    }
}

/// JSONL-backed log store with file locking
pub struct JsonlLogStore {
    path: PathBuf,
}

impl JsonlLogStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_parent_dir(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    fn append(&self, entry: &LogEntry) -> Result<()> {
        self.ensure_parent_dir()?;
        append_entries(&self.path, std::slice::from_ref(entry))
    }

    /// Reject calls for rows this journal never opened
    fn ensure_known(&self, log_id: &LogId) -> Result<()> {
        let known = read_entries(&self.path)?
            .iter()
            .any(|e| matches!(e, LogEntry::Started { log_id: id, .. } if id == log_id));
        if known {
            Ok(())
        } else {
            Err(Error::Remote(format!("unknown log id {}", log_id)))
        }
    }
}

impl RemoteLogStore for JsonlLogStore {
    fn start_exercise(&mut self, record: &StartRecord) -> Result<LogId> {
        let log_id = LogId(Uuid::new_v4().to_string());
        self.append(&LogEntry::Started {
            log_id: log_id.clone(),
            recorded_at: Utc::now(),
            record: record.clone(),
        })?;
        Ok(log_id)
    }

    fn complete_exercise(&mut self, log_id: &LogId, record: &CompletionRecord) -> Result<()> {
        self.ensure_known(log_id)?;
        self.append(&LogEntry::Completed {
            log_id: log_id.clone(),
            recorded_at: Utc::now(),
            record: record.clone(),
        })
    }

    fn abandon_exercise(&mut self, log_id: &LogId, record: &AbandonRecord) -> Result<()> {
        self.ensure_known(log_id)?;
        self.append(&LogEntry::Abandoned {
            log_id: log_id.clone(),
            recorded_at: Utc::now(),
            record: record.clone(),
        })
    }

    fn sync_progress(&mut self, log_id: &LogId, record: &ProgressRecord) -> Result<()> {
        self.append(&LogEntry::Progress {
            log_id: log_id.clone(),
            recorded_at: Utc::now(),
            record: record.clone(),
        })
    }
}

/// Log store that is never reachable
#[derive(Clone, Copy, Debug, Default)]
pub struct OfflineLogStore;

impl RemoteLogStore for OfflineLogStore {
    fn start_exercise(&mut self, _record: &StartRecord) -> Result<LogId> {
        Err(Error::Remote("log store offline".into()))
    }

    fn complete_exercise(&mut self, _log_id: &LogId, _record: &CompletionRecord) -> Result<()> {
        Err(Error::Remote("log store offline".into()))
    }

    fn abandon_exercise(&mut self, _log_id: &LogId, _record: &AbandonRecord) -> Result<()> {
        Err(Error::Remote("log store offline".into()))
    }

    fn sync_progress(&mut self, _log_id: &LogId, _record: &ProgressRecord) -> Result<()> {
        Err(Error::Remote("log store offline".into()))
    }
}

/// Append entries to a journal file under an exclusive lock
pub(crate) fn append_entries(path: &Path, entries: &[LogEntry]) -> Result<()> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;

    file.lock_exclusive()?;

    let mut writer = std::io::BufWriter::new(&file);
    for entry in entries {
        let line = serde_json::to_string(entry)?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    drop(writer);

    file.unlock()?;

    tracing::debug!("Appended {} entries to journal {:?}", entries.len(), path);
    Ok(())
}

/// Read all entries from a journal file
///
/// Lines that fail to parse are logged and skipped.
pub fn read_entries(path: &Path) -> Result<Vec<LogEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(path)?;
    file.lock_shared()?;

    let reader = BufReader::new(&file);
    let mut entries = Vec::new();

    for (line_num, line_result) in reader.lines().enumerate() {
        let line = line_result?;
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<LogEntry>(&line) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                tracing::warn!("Failed to parse journal entry at line {}: {}", line_num + 1, e);
            }
        }
    }

    file.unlock()?;
    tracing::debug!("Read {} entries from journal", entries.len());
    Ok(entries)
}
