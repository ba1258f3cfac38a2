//! Core domain model for the Smart City Data Hub ingestion pipeline.
//!
//! Records move through the pipeline in one direction:
//! [`RawRecord`] -> [`IntermediateRecord`] -> [`ValidationOutcome`] -> [`CanonicalRecord`],
//! with every step accounted for on an [`IngestionRun`].

mod canonical;
mod error;
mod record;
mod run;

pub use canonical::{
    CanonicalDocument, CanonicalRecord, ColumnSpec, EntityKey, FilterOp, HistoryEntry,
    MergeConflict, RelationalRow, RowFilter, SinkKind, WriteState,
};
pub use error::HubError;
pub use record::{
    Cursor, ExtractFailure, FieldValue, IntermediateRecord, Provenance, RawPayload, RawRecord,
    RawRef, RuleViolation, ValidationOutcome, ValidationStatus, ValueKind,
};
pub use run::{IngestionRun, IssueKind, RecordIssue, RunCounts, RunEnd, RunStatus};

pub const CRATE_NAME: &str = "hub-core";

/// Which rule tables apply to a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceDomain {
    PropertyListing,
    CarbonIntensity,
}

impl SourceDomain {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceDomain::PropertyListing => "property_listing",
            SourceDomain::CarbonIntensity => "carbon_intensity",
        }
    }
}
