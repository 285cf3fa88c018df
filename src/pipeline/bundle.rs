use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

use super::matcher::round_score;
use super::split::SplitOutcome;
use crate::model::{MatchResult, OutputDocument, RosterEntry, SegmentLogEntry};
use crate::util::{ensure_directory, json_pretty_bytes};

pub const BUNDLE_FILE_NAME: &str = "review_bundle.zip";
pub const SPLIT_DIR_NAME: &str = "split-documents";
pub const PRESENCE_TABLE_NAME: &str = "presence_table.csv";
pub const SEGMENT_LOG_NAME: &str = "segment_log.json";

#[derive(Debug, Clone)]
pub struct BundleReport {
    pub path: PathBuf,
    pub documents_packed: usize,
    pub skipped: Vec<String>,
}

pub fn segment_status(result: &MatchResult) -> &'static str {
    match (result.is_matched(), result.uncertain) {
        (true, false) => "matched",
        (true, true) => "uncertain",
        (false, _) => "unmatched",
    }
}

pub fn segment_log_entries(
    matches: &[MatchResult],
    roster: &[RosterEntry],
    split: &SplitOutcome,
) -> Vec<SegmentLogEntry> {
    matches
        .iter()
        .enumerate()
        .map(|(segment_index, result)| {
            let entry = result.matched_entry.and_then(|index| roster.get(index));
            SegmentLogEntry {
                segment_index,
                start_page: result.segment.start_page,
                end_page: result.segment.end_page,
                page_count: result.segment.page_count(),
                raw_name: result.identity.raw_name.clone(),
                raw_id: result.identity.raw_id.clone(),
                ocr_confidence: round_score(result.identity.confidence),
                ocr_backend: result.identity.backend.clone(),
                status: segment_status(result).to_string(),
                matched_id: entry.map(|entry| entry.external_id.clone()),
                matched_name: entry.map(|entry| entry.display_name.clone()),
                id_similarity: round_score(result.id_similarity),
                name_similarity: round_score(result.name_similarity),
                score: round_score(result.score),
                uncertain: result.uncertain,
                file_name: split
                    .document_for(segment_index)
                    .map(|document| document.file_name.clone()),
                split_error: split
                    .failure_for(segment_index)
                    .map(|failure| failure.error.clone()),
            }
        })
        .collect()
}

pub fn segment_log_json(entries: &[SegmentLogEntry]) -> Result<Vec<u8>> {
    json_pretty_bytes(&entries)
}

/// Writes the review archive. Entry order and timestamps are fixed so the
/// table and log entries are byte-identical across identical runs. A
/// document whose file has disappeared is skipped with a warning, and the
/// presence table entry is left out when no table was rendered.
pub fn build_review_bundle(
    destination: &Path,
    documents: &[OutputDocument],
    presence_csv: Option<&[u8]>,
    segment_log: &[u8],
) -> Result<BundleReport> {
    if let Some(parent) = destination.parent() {
        ensure_directory(parent)?;
    }

    let result = write_bundle(destination, documents, presence_csv, segment_log);
    if result.is_err() && destination.exists() {
        let _ = fs::remove_file(destination);
    }
    result
}

fn write_bundle(
    destination: &Path,
    documents: &[OutputDocument],
    presence_csv: Option<&[u8]>,
    segment_log: &[u8],
) -> Result<BundleReport> {
    let file = File::create(destination)
        .with_context(|| format!("failed to create {}", destination.display()))?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(DateTime::default())
        .unix_permissions(0o644);

    writer
        .add_directory(format!("{SPLIT_DIR_NAME}/"), options)
        .context("failed to add split-documents directory")?;

    let mut documents_packed = 0_usize;
    let mut skipped = Vec::<String>::new();
    for document in documents {
        let data = match fs::read(&document.path) {
            Ok(data) => data,
            Err(err) => {
                warn!(file = %document.path.display(), error = %err, "split document missing; not bundled");
                skipped.push(document.file_name.clone());
                continue;
            }
        };

        writer
            .start_file(format!("{SPLIT_DIR_NAME}/{}", document.file_name), options)
            .with_context(|| format!("failed to add {}", document.file_name))?;
        writer
            .write_all(&data)
            .with_context(|| format!("failed to write {}", document.file_name))?;
        documents_packed += 1;
    }

    if let Some(presence_csv) = presence_csv {
        writer
            .start_file(PRESENCE_TABLE_NAME, options)
            .context("failed to add presence table")?;
        writer
            .write_all(presence_csv)
            .context("failed to write presence table")?;
    }

    writer
        .start_file(SEGMENT_LOG_NAME, options)
        .context("failed to add segment log")?;
    writer
        .write_all(segment_log)
        .context("failed to write segment log")?;

    writer
        .finish()
        .with_context(|| format!("failed to finish {}", destination.display()))?;

    info!(
        bundle = %destination.display(),
        documents = documents_packed,
        skipped = skipped.len(),
        "review bundle written"
    );

    Ok(BundleReport {
        path: destination.to_path_buf(),
        documents_packed,
        skipped,
    })
}
