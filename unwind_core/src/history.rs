//! Exercise history from the journal and the CSV archive.
//!
//! Journal entries are folded into one [`ExerciseSummary`] per log row.
//! Archived summaries live in a CSV written by [`crate::rollup`].

use crate::remote::{read_entries, LogEntry};
use crate::{CompletionStatus, Error, ExerciseType, Result};
use chrono::{DateTime, Duration, Utc};
use csv::ReaderBuilder;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// One exercise attempt as seen by the log store
#[derive(Clone, Debug, PartialEq)]
pub struct ExerciseSummary {
    pub log_id: String,
    pub user_id: String,
    pub exercise_type: ExerciseType,
    pub exercise_name: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: CompletionStatus,
    pub duration_seconds: Option<u64>,
    pub post_rating: Option<i32>,
    pub percentage_reached: Option<u32>,
}

/// CSV row format for archived summaries
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct CsvRow {
    log_id: String,
    user_id: String,
    exercise_type: String,
    exercise_name: String,
    started_at: String,
    ended_at: Option<String>,
    status: String,
    duration_seconds: Option<u64>,
    post_rating: Option<i32>,
    percentage_reached: Option<u32>,
}

impl From<&ExerciseSummary> for CsvRow {
    fn from(summary: &ExerciseSummary) -> Self {
        CsvRow {
            log_id: summary.log_id.clone(),
            user_id: summary.user_id.clone(),
            exercise_type: summary.exercise_type.as_str().to_string(),
            exercise_name: summary.exercise_name.clone(),
            started_at: summary.started_at.to_rfc3339(),
            ended_at: summary.ended_at.map(|t| t.to_rfc3339()),
            status: summary.status.as_str().to_string(),
            duration_seconds: summary.duration_seconds,
            post_rating: summary.post_rating,
            percentage_reached: summary.percentage_reached,
        }
    }
}

impl TryFrom<CsvRow> for ExerciseSummary {
    type Error = Error;

    fn try_from(row: CsvRow) -> Result<Self> {
        let started_at = DateTime::parse_from_rfc3339(&row.started_at)
            .map_err(|e| Error::Other(format!("Invalid date: {}", e)))?
            .with_timezone(&Utc);

        let ended_at = row
            .ended_at
            .as_ref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        let status = match row.status.as_str() {
            "in_progress" => CompletionStatus::InProgress,
            "completed" => CompletionStatus::Completed,
            "abandoned" => CompletionStatus::Abandoned,
            other => return Err(Error::Other(format!("Invalid status: {}", other))),
        };

        Ok(ExerciseSummary {
            log_id: row.log_id,
            user_id: row.user_id,
            exercise_type: row.exercise_type.parse()?,
            exercise_name: row.exercise_name,
            started_at,
            ended_at,
            status,
            duration_seconds: row.duration_seconds,
            post_rating: row.post_rating,
            percentage_reached: row.percentage_reached,
        })
    }
}

/// Fold journal entries into one summary per log row, in start order.
///
/// Entries whose row was never started in this journal are skipped.
pub fn summarize_entries(entries: &[LogEntry]) -> Vec<ExerciseSummary> {
    let mut order = Vec::new();
    let mut by_id: HashMap<String, ExerciseSummary> = HashMap::new();

    for entry in entries {
        let id = &entry.log_id().0;

        if let LogEntry::Started {
            recorded_at, record, ..
        } = entry
        {
            if !by_id.contains_key(id) {
                order.push(id.clone());
            }
            by_id.insert(
                id.clone(),
                ExerciseSummary {
                    log_id: id.clone(),
                    user_id: record.user_id.clone(),
                    exercise_type: record.exercise_type,
                    exercise_name: record.exercise_name.clone(),
                    started_at: *recorded_at,
                    ended_at: None,
                    status: CompletionStatus::InProgress,
                    duration_seconds: None,
                    post_rating: None,
                    percentage_reached: None,
                },
            );
            continue;
        }

        let Some(summary) = by_id.get_mut(id) else {
            tracing::warn!("Journal entry for unknown log row {}", id);
            continue;
        };

        match entry {
            LogEntry::Progress { record, .. } => {
                summary.percentage_reached = Some(record.percentage);
            }
            LogEntry::Completed { record, .. } => {
                summary.status = CompletionStatus::Completed;
                summary.ended_at = Some(record.completed_at);
                summary.duration_seconds = Some(record.duration_seconds);
                summary.post_rating = record.post_rating;
                summary.percentage_reached = Some(100);
            }
            LogEntry::Abandoned {
                recorded_at, record, ..
            } => {
                summary.status = CompletionStatus::Abandoned;
                summary.ended_at = Some(*recorded_at);
                summary.duration_seconds = Some(record.duration_seconds);
                summary.percentage_reached = Some(record.abandoned_at_percentage);
            }
            LogEntry::Started { .. } => {}
        }
    }

    order
        .into_iter()
        .filter_map(|id| by_id.remove(&id))
        .collect()
}

/// Load summaries started in the last N days from both journal and CSV
///
/// Returns summaries sorted by started_at (newest first), deduplicated by
/// log id with the journal taking precedence.
pub fn load_recent_summaries(
    journal_path: &Path,
    csv_path: &Path,
    days: i64,
) -> Result<Vec<ExerciseSummary>> {
    let cutoff = Duration::try_days(days)
        .and_then(|window| Utc::now().checked_sub_signed(window))
        .ok_or_else(|| Error::Other(format!("History window of {} days is out of range", days)))?;
    let mut summaries = Vec::new();
    let mut seen_ids = HashSet::new();

    if journal_path.exists() {
        let entries = read_entries(journal_path)?;
        for summary in summarize_entries(&entries) {
            if summary.started_at >= cutoff {
                seen_ids.insert(summary.log_id.clone());
                summaries.push(summary);
            }
        }
        tracing::debug!("Loaded {} summaries from journal", summaries.len());
    }

    if csv_path.exists() {
        let mut csv_count = 0;
        for summary in load_summaries_from_csv(csv_path)? {
            if summary.started_at >= cutoff && !seen_ids.contains(&summary.log_id) {
                seen_ids.insert(summary.log_id.clone());
                summaries.push(summary);
                csv_count += 1;
            }
        }
        tracing::debug!("Loaded {} summaries from CSV", csv_count);
    }

    summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));

    tracing::info!(
        "Loaded {} exercises from last {} days",
        summaries.len(),
        days
    );

    Ok(summaries)
}

/// Load all summaries from a CSV archive
pub fn load_summaries_from_csv(path: &Path) -> Result<Vec<ExerciseSummary>> {
    let mut reader = ReaderBuilder::new().has_headers(true).from_path(path)?;

    let mut summaries = Vec::new();
    for result in reader.deserialize::<CsvRow>() {
        match result {
            Ok(row) => match ExerciseSummary::try_from(row) {
                Ok(summary) => summaries.push(summary),
                Err(e) => tracing::warn!("Failed to parse CSV row: {}", e),
            },
            Err(e) => tracing::warn!("Failed to deserialize CSV row: {}", e),
        }
    }

    Ok(summaries)
}
