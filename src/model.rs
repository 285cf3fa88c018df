use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Running,
    Paused,
    Cancelled,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Cancelled => "CANCELLED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "RUNNING" => Some(Self::Running),
            "PAUSED" => Some(Self::Paused),
            "CANCELLED" => Some(Self::Cancelled),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    /// No control call may move a job out of a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub job_id: String,
    pub test_id: String,
    pub document_path: String,
    pub roster_path: String,
    pub state: JobState,
    pub created_at: String,
    pub updated_at: String,
    pub progress_percent: u8,
    pub eta_seconds: Option<u64>,
    pub error: Option<String>,
    pub presence_table_path: Option<String>,
    pub bundle_path: Option<String>,
    pub worker_pid: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatusReport {
    pub job_id: String,
    pub test_id: String,
    pub state: JobState,
    pub progress_percent: u8,
    pub eta_seconds: Option<u64>,
    pub error: Option<String>,
}

impl From<&Job> for JobStatusReport {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.job_id.clone(),
            test_id: job.test_id.clone(),
            state: job.state,
            progress_percent: job.progress_percent,
            eta_seconds: job.eta_seconds,
            error: job.error.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobResultPaths {
    pub job_id: String,
    pub presence_table_path: Option<String>,
    pub bundle_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub external_id: String,
    pub display_name: String,
    pub extra: Vec<(String, String)>,
}

impl RosterEntry {
    pub fn new(external_id: &str, display_name: &str) -> Self {
        Self {
            external_id: external_id.to_string(),
            display_name: display_name.to_string(),
            extra: Vec::new(),
        }
    }

    pub fn extra_value(&self, column: &str) -> Option<&str> {
        self.extra
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Roster {
    pub entries: Vec<RosterEntry>,
    /// Non-identity columns, in source order.
    pub extra_columns: Vec<String>,
}

/// Contiguous, end-inclusive, 0-based page range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Segment {
    pub start_page: usize,
    pub end_page: usize,
}

impl Segment {
    pub fn new(start_page: usize, end_page: usize) -> Self {
        Self {
            start_page,
            end_page,
        }
    }

    pub fn page_count(&self) -> usize {
        self.end_page - self.start_page + 1
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractedIdentity {
    pub raw_name: String,
    pub raw_id: String,
    pub confidence: f64,
    pub backend: Option<String>,
}

impl ExtractedIdentity {
    pub fn empty() -> Self {
        Self {
            raw_name: String::new(),
            raw_id: String::new(),
            confidence: 0.0,
            backend: None,
        }
    }

    pub fn is_blank(&self) -> bool {
        self.raw_name.trim().is_empty() && self.raw_id.trim().is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchResult {
    pub segment: Segment,
    pub identity: ExtractedIdentity,
    /// Index into the roster the match was computed against.
    pub matched_entry: Option<usize>,
    pub id_similarity: f64,
    pub name_similarity: f64,
    pub score: f64,
    pub uncertain: bool,
}

impl MatchResult {
    pub fn is_matched(&self) -> bool {
        self.matched_entry.is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OutputDocument {
    pub file_name: String,
    pub path: PathBuf,
    pub segment_index: usize,
    pub segment: Segment,
    pub page_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PresenceRow {
    pub entry: RosterEntry,
    pub present: bool,
    pub confidence: f64,
    pub segment: Option<Segment>,
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentLogEntry {
    pub segment_index: usize,
    pub start_page: usize,
    pub end_page: usize,
    pub page_count: usize,
    pub raw_name: String,
    pub raw_id: String,
    pub ocr_confidence: f64,
    pub ocr_backend: Option<String>,
    pub status: String,
    pub matched_id: Option<String>,
    pub matched_name: Option<String>,
    pub id_similarity: f64,
    pub name_similarity: f64,
    pub score: f64,
    pub uncertain: bool,
    pub file_name: Option<String>,
    pub split_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceHash {
    pub role: String,
    pub path: String,
    pub sha256: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunCounts {
    pub page_count: usize,
    pub segment_count: usize,
    pub matched_count: usize,
    pub uncertain_count: usize,
    pub unmatched_count: usize,
    pub documents_written: usize,
    pub split_failures: usize,
    pub present_count: usize,
    pub absent_count: usize,
    pub roster_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunPaths {
    pub document_path: String,
    pub roster_path: String,
    pub split_dir: String,
    pub presence_table_path: Option<String>,
    pub bundle_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunManifest {
    pub manifest_version: u32,
    pub job_id: String,
    pub test_id: String,
    pub status: String,
    pub started_at: String,
    pub updated_at: String,
    pub source_hashes: Vec<SourceHash>,
    pub counts: RunCounts,
    pub paths: RunPaths,
    pub warnings: Vec<String>,
}
