//! Validation, canonical merge, dual-sink writes and run orchestration.
//!
//! [`Pipeline`] owns the registered sources and drives each ingestion run:
//! fetch a batch, extract, validate, merge under a per-key lock, write both
//! projections, save the cursor.

mod config;
mod merge;
mod orchestrator;
mod query;
mod reports;
mod scheduler;
mod schema;
mod validate;
mod writer;

pub use config::{HubConfig, RetrySettings, SourceConfig, SourceRegistry};
pub use merge::{
    apply_observation, compute_entity_key, normalize_key_fragment, time_bucket, Applied,
    CanonicalStore, GroupReport, MergeOutcome, MergedObservation, Merger, Observation,
    ReconcileReport, ShardedLocks,
};
pub use orchestrator::{Pipeline, PipelineOptions, RegisteredSource, RunHandle};
pub use query::{
    distinct_values, is_fully_committed, summarize_rows, ColumnSummary, ProjectedRecord,
    Projection, QueryResult, RecordQuery, DEFAULT_QUERY_LIMIT,
};
pub use reports::{write_run_report, ParquetManifest, ParquetManifestFile, RunReport};
pub use scheduler::{ingest_all, maybe_build_scheduler};
pub use schema::{
    Band, Check, DomainSchema, KeyPart, Repair, Rule, RuleSet, Severity, CARBON_INTENSITY_MAX,
    INTENSITY_INDEXES,
};
pub use validate::Validator;
pub use writer::{DualSinkWriter, ReconciliationTask, WriteResult};

pub const CRATE_NAME: &str = "hub-pipeline";
