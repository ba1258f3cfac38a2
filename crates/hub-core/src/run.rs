use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::record::Cursor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    PartiallyFailed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Pending | RunStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::PartiallyFailed => "partially_failed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub batches: u64,
    pub fetched: u64,
    pub accepted: u64,
    pub repaired: u64,
    /// Includes extract failures.
    pub rejected: u64,
    pub extract_failures: u64,
    pub created: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub superseded: u64,
    pub conflicts: u64,
    pub committed: u64,
    pub partially_written: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    ExtractFailure,
    ValidationRejected,
    ValidationRepaired,
    MergeConflict,
    PartiallyWritten,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordIssue {
    pub fetch_sequence: u64,
    pub locator: String,
    pub kind: IssueKind,
    pub detail: String,
}

/// How execution of a run ended, before it is mapped onto a [`RunStatus`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEnd {
    Completed,
    Cancelled,
    SourceUnavailable(String),
    Fatal(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionRun {
    pub run_id: Uuid,
    pub source_id: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub start_cursor: Option<Cursor>,
    pub end_cursor: Option<Cursor>,
    pub counts: RunCounts,
    pub issues: Vec<RecordIssue>,
    pub error: Option<String>,
}

impl IngestionRun {
    pub fn new(source_id: &str) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            source_id: source_id.to_string(),
            status: RunStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            start_cursor: None,
            end_cursor: None,
            counts: RunCounts::default(),
            issues: Vec::new(),
            error: None,
        }
    }

    pub fn start(&mut self, cursor: Cursor) {
        self.status = RunStatus::Running;
        self.started_at = Some(Utc::now());
        self.start_cursor = Some(cursor);
        self.end_cursor = Some(cursor);
    }

    pub fn record_issue(&mut self, fetch_sequence: u64, locator: &str, kind: IssueKind, detail: String) {
        self.issues.push(RecordIssue {
            fetch_sequence,
            locator: locator.to_string(),
            kind,
            detail,
        });
    }

    /// Close the run. Source unavailability is only fatal when nothing was committed.
    pub fn close(&mut self, end: RunEnd) {
        self.status = match &end {
            RunEnd::Completed => {
                if self.counts.rejected > 0 || self.counts.partially_written > 0 {
                    RunStatus::PartiallyFailed
                } else {
                    RunStatus::Succeeded
                }
            }
            RunEnd::Cancelled => RunStatus::Cancelled,
            RunEnd::SourceUnavailable(_) if self.counts.batches > 0 => RunStatus::PartiallyFailed,
            RunEnd::SourceUnavailable(_) | RunEnd::Fatal(_) => RunStatus::Failed,
        };
        if let RunEnd::SourceUnavailable(reason) | RunEnd::Fatal(reason) = end {
            self.error = Some(reason);
        }
        self.finished_at = Some(Utc::now());
    }
}
