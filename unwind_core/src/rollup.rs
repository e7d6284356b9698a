//! Journal rollup into the CSV archive.
//!
//! Finished exercises are appended to the CSV and the journal is archived.
//! Entries for rows still in progress are carried over to a fresh journal so
//! their completion can still be recorded.

use crate::history::{summarize_entries, CsvRow};
use crate::remote::{append_entries, read_entries};
use crate::Result;
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::path::Path;

/// Roll up finished exercises into CSV and archive the journal
///
/// This function:
/// 1. Reads all entries from the journal
/// 2. Appends finished summaries to the CSV (headers only for a new file)
/// 3. Syncs the CSV to disk
/// 4. Renames the journal to `.processed`
/// 5. Re-creates the journal with entries of rows still in progress
///
/// Returns the number of exercises archived.
pub fn journal_to_csv_and_archive(journal_path: &Path, csv_path: &Path) -> Result<usize> {
    let entries = read_entries(journal_path)?;
    let summaries = summarize_entries(&entries);

    let (finished, open): (Vec<_>, Vec<_>) = summaries
        .into_iter()
        .partition(|s| s.status.is_terminal());

    if finished.is_empty() {
        tracing::info!("No finished exercises in journal to roll up");
        return Ok(0);
    }

    if let Some(parent) = csv_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(csv_path)?;

    let needs_headers = file.metadata()?.len() == 0;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(needs_headers)
        .from_writer(file);

    for summary in &finished {
        writer.serialize(CsvRow::from(summary))?;
    }

    writer.flush()?;
    let file = writer
        .into_inner()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
    file.sync_all()?;

    tracing::info!("Wrote {} exercises to CSV", finished.len());

    let processed_path = journal_path.with_extension("jsonl.processed");
    std::fs::rename(journal_path, &processed_path)?;
    tracing::info!("Archived journal to {:?}", processed_path);

    let open_ids: HashSet<&str> = open.iter().map(|s| s.log_id.as_str()).collect();
    let carried: Vec<_> = entries
        .into_iter()
        .filter(|e| open_ids.contains(e.log_id().0.as_str()))
        .collect();
    if !carried.is_empty() {
        append_entries(journal_path, &carried)?;
        tracing::info!("Carried {} open entries into new journal", carried.len());
    }

    Ok(finished.len())
}

/// Remove archived `.processed` journals in `dir`
pub fn cleanup_processed_journals(dir: &Path) -> Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }

    let mut count = 0;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();

        if path.extension().is_some_and(|ext| ext == "processed") {
            std::fs::remove_file(&path)?;
            tracing::debug!("Removed processed journal: {:?}", path);
            count += 1;
        }
    }

    if count > 0 {
        tracing::info!("Cleaned up {} processed journals", count);
    }

    Ok(count)
}
