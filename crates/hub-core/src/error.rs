use thiserror::Error;
use uuid::Uuid;

/// Failures that cross the pipeline boundary. Per-record problems
/// (extract failures, rejections, conflicts, partial writes) are not errors
/// here; they are recorded on the [`crate::IngestionRun`].
#[derive(Debug, Error)]
pub enum HubError {
    #[error("source {source_id} unavailable: {reason}")]
    SourceUnavailable { source_id: String, reason: String },
    #[error("run {run_id} is already active for source {source_id}")]
    RunAlreadyActive { source_id: String, run_id: Uuid },
    #[error("unknown source {0}")]
    UnknownSource(String),
    #[error("unknown run {0}")]
    UnknownRun(Uuid),
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("storage error: {0}")]
    Storage(String),
}
