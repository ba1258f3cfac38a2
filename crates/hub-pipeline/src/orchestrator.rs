use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::Context;
use hub_adapters::{
    adapter_for_source, extraction_table_for, AdapterContext, AdapterError, ExtractionTable,
    SourceAdapter,
};
use hub_core::{
    CanonicalRecord, Cursor, EntityKey, FieldValue, HubError, IngestionRun, IssueKind, RawPayload,
    RawRecord, RunEnd, ValidationStatus, WriteState,
};
use hub_storage::{
    ArtifactStore, BackoffPolicy, CursorStore, DocumentSink, FsCursorStore, FsDocumentStore,
    HttpClientConfig, HttpFetcher, MemoryCursorStore, MemoryDocumentSink, MemoryRelationalSink,
    PgRelationalSink, RelationalSink,
};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{HubConfig, SourceConfig, SourceRegistry};
use crate::merge::{
    compute_entity_key, CanonicalStore, GroupReport, MergeOutcome, Merger, Observation,
    ReconcileReport,
};
use crate::query::{self, ColumnSummary, QueryResult, RecordQuery};
use crate::reports::write_run_report;
use crate::schema::{DomainSchema, RuleSet};
use crate::validate::Validator;
use crate::writer::ReconciliationTask;

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Retry policy applied to each side of a dual-sink write.
    pub write_backoff: BackoffPolicy,
    pub lock_shards: usize,
    /// Archive raw payloads of every fetched batch.
    pub artifacts: Option<ArtifactStore>,
    /// Write a report directory per finished run.
    pub reports_dir: Option<PathBuf>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            write_backoff: BackoffPolicy::default(),
            lock_shards: 64,
            artifacts: None,
            reports_dir: None,
        }
    }
}

/// A source wired up with its adapter, extraction table and validator.
pub struct RegisteredSource {
    pub adapter: Arc<dyn SourceAdapter>,
    pub schema: Arc<DomainSchema>,
    pub extraction: ExtractionTable,
    pub validator: Validator,
}

/// Handle on a spawned ingestion run.
pub struct RunHandle {
    run_id: Uuid,
    source_id: String,
    cancel: CancellationToken,
    task: JoinHandle<IngestionRun>,
}

impl RunHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Ask the run to stop at the next batch boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(self) -> Result<IngestionRun, HubError> {
        self.task
            .await
            .map_err(|e| HubError::InvariantViolation(format!("run {} task failed: {e}", self.run_id)))
    }
}

/// Releases the per-source run slot when the run task ends, however it ends.
struct ActiveSlot {
    inner: Arc<Inner>,
    source_id: String,
    run_id: Uuid,
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        let mut active = self.inner.active.lock().unwrap_or_else(|e| e.into_inner());
        if active.get(&self.source_id) == Some(&self.run_id) {
            active.remove(&self.source_id);
        }
    }
}

struct Inner {
    sources: RwLock<BTreeMap<String, Arc<RegisteredSource>>>,
    merger: Arc<Merger>,
    cursors: Arc<dyn CursorStore>,
    options: PipelineOptions,
    runs: RwLock<BTreeMap<Uuid, IngestionRun>>,
    active: Mutex<HashMap<String, Uuid>>,
    prepared: tokio::sync::Mutex<HashSet<String>>,
}

/// Entry point used by the CLI, the scheduler and any outer query layer.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

impl Pipeline {
    pub fn new(
        relational: Arc<dyn RelationalSink>,
        documents: Arc<dyn DocumentSink>,
        cursors: Arc<dyn CursorStore>,
        options: PipelineOptions,
    ) -> Self {
        let store = Arc::new(CanonicalStore::new(documents.clone()));
        let writer = Arc::new(crate::writer::DualSinkWriter::new(
            relational,
            documents,
            options.write_backoff,
        ));
        let merger = Arc::new(Merger::new(store, writer, options.lock_shards));
        Self {
            inner: Arc::new(Inner {
                sources: RwLock::new(BTreeMap::new()),
                merger,
                cursors,
                options,
                runs: RwLock::new(BTreeMap::new()),
                active: Mutex::new(HashMap::new()),
                prepared: tokio::sync::Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Everything in memory; nothing survives the process.
    pub fn in_memory(options: PipelineOptions) -> Self {
        Self::new(
            Arc::new(MemoryRelationalSink::new()),
            Arc::new(MemoryDocumentSink::new()),
            Arc::new(MemoryCursorStore::new()),
            options,
        )
    }

    /// Build sinks, stores and adapters from process configuration and register
    /// every enabled source of `sources.yaml`.
    pub async fn from_config(config: &HubConfig) -> anyhow::Result<Self> {
        let registry = SourceRegistry::load(&config.sources_path())?;
        let relational: Arc<dyn RelationalSink> = match &config.database_url {
            Some(url) => Arc::new(
                PgRelationalSink::connect(url)
                    .await
                    .context("connecting relational sink")?,
            ),
            None => {
                warn!("DATABASE_URL not set; relational projection kept in memory");
                Arc::new(MemoryRelationalSink::new())
            }
        };
        let http = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout(),
            user_agent: Some(config.user_agent.clone()),
            ..HttpClientConfig::default()
        })?);
        let options = PipelineOptions {
            artifacts: config
                .archive_raw
                .then(|| ArtifactStore::new(config.artifacts_dir())),
            reports_dir: config.reports_enabled.then(|| config.reports_dir()),
            ..PipelineOptions::default()
        };
        let pipeline = Self::new(
            relational,
            Arc::new(FsDocumentStore::new(config.documents_dir())),
            Arc::new(FsCursorStore::new(config.cursors_dir())),
            options,
        );
        for source in registry.enabled() {
            pipeline
                .register_configured(source, http.clone(), &config.workspace_root)
                .with_context(|| format!("registering source {}", source.source_id))?;
        }
        Ok(pipeline)
    }

    pub fn register_configured(
        &self,
        source: &SourceConfig,
        http: Arc<HttpFetcher>,
        workspace_root: &Path,
    ) -> anyhow::Result<()> {
        let adapter = adapter_for_source(
            &source.source_id,
            source.domain,
            source.mode,
            &source.connection,
            source.retry.policy(),
            http,
            workspace_root,
        )?;
        let rules = match &source.rules {
            Some(path) => RuleSet::load(&workspace_root.join(path))?,
            None => RuleSet::builtin(source.domain),
        };
        let extraction = extraction_table_for(source.domain, &source.connection);
        self.register_source(adapter, extraction, rules)?;
        Ok(())
    }

    pub fn register_source(
        &self,
        adapter: Arc<dyn SourceAdapter>,
        extraction: ExtractionTable,
        rules: RuleSet,
    ) -> Result<(), HubError> {
        let domain = adapter.domain();
        if extraction.domain != domain || rules.domain != domain {
            return Err(HubError::Config(format!(
                "source {}: extraction table and rule set must target {}",
                adapter.source_id(),
                domain.as_str()
            )));
        }
        let validator = Validator::new(&rules).map_err(|e| HubError::Config(format!("{e:#}")))?;
        let source_id = adapter.source_id().to_string();
        let registered = RegisteredSource {
            adapter,
            schema: Arc::new(DomainSchema::for_domain(domain)),
            extraction,
            validator,
        };
        let mut sources = self.inner.sources.write().unwrap_or_else(|e| e.into_inner());
        if sources.contains_key(&source_id) {
            return Err(HubError::Config(format!("source {source_id} registered twice")));
        }
        sources.insert(source_id, Arc::new(registered));
        Ok(())
    }

    pub fn source_ids(&self) -> Vec<String> {
        let sources = self.inner.sources.read().unwrap_or_else(|e| e.into_inner());
        sources.keys().cloned().collect()
    }

    /// Start a run for `source_id` and return immediately. At most one run per
    /// source is active; a second trigger fails without creating a run.
    /// Must be called from within a tokio runtime.
    pub fn ingest(&self, source_id: &str) -> Result<RunHandle, HubError> {
        let source = self.inner.source(source_id)?;
        let run = IngestionRun::new(source_id);
        let run_id = run.run_id;
        {
            let mut active = self.inner.active.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(existing) = active.get(source_id) {
                return Err(HubError::RunAlreadyActive {
                    source_id: source_id.to_string(),
                    run_id: *existing,
                });
            }
            active.insert(source_id.to_string(), run_id);
        }
        self.inner.update_run(&run);

        let slot = ActiveSlot {
            inner: self.inner.clone(),
            source_id: source_id.to_string(),
            run_id,
        };
        let cancel = CancellationToken::new();
        let inner = self.inner.clone();
        let token = cancel.clone();
        let span = info_span!("ingest_run", run_id = %run_id, source_id = %source_id);
        let task = tokio::spawn(
            async move {
                let _slot = slot;
                inner.execute(run, source, token).await
            }
            .instrument(span),
        );

        Ok(RunHandle {
            run_id,
            source_id: source_id.to_string(),
            cancel,
            task,
        })
    }

    pub fn run_status(&self, run_id: Uuid) -> Result<IngestionRun, HubError> {
        let runs = self.inner.runs.read().unwrap_or_else(|e| e.into_inner());
        runs.get(&run_id).cloned().ok_or(HubError::UnknownRun(run_id))
    }

    /// All runs of this process, oldest first.
    pub fn runs(&self) -> Vec<IngestionRun> {
        let runs = self.inner.runs.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<IngestionRun> = runs.values().cloned().collect();
        out.sort_by_key(|r| r.created_at);
        out
    }

    pub fn active_run(&self, source_id: &str) -> Option<Uuid> {
        let active = self.inner.active.lock().unwrap_or_else(|e| e.into_inner());
        active.get(source_id).copied()
    }

    pub fn pending_reconciliation(&self) -> Vec<ReconciliationTask> {
        self.inner.merger.writer().pending_tasks()
    }

    /// Re-drive every partially written record.
    pub async fn reconcile(&self) -> ReconcileReport {
        let report = self.inner.merger.reconcile().await;
        info!(
            attempted = report.attempted,
            committed = report.committed,
            pending = report.still_pending.len(),
            "reconciliation pass finished"
        );
        report
    }

    pub fn record(&self, key: &EntityKey) -> Option<CanonicalRecord> {
        self.inner.merger.store().get(key)
    }

    pub async fn query(&self, query: &RecordQuery) -> Result<QueryResult, HubError> {
        let source = self.inner.source(&query.source_id)?;
        self.inner.ensure_prepared(&query.source_id, &source.schema).await?;
        query::execute(
            self.inner.merger.writer().relational().as_ref(),
            self.inner.merger.store(),
            &source.schema,
            query,
        )
        .await
    }

    /// count/min/max/mean of one column over fully committed records.
    pub async fn summarize(&self, source_id: &str, column: &str) -> Result<ColumnSummary, HubError> {
        let rows = self.committed_rows(source_id, column).await?;
        Ok(query::summarize_rows(column, &rows))
    }

    pub async fn distinct(&self, source_id: &str, column: &str) -> Result<Vec<FieldValue>, HubError> {
        let rows = self.committed_rows(source_id, column).await?;
        Ok(query::distinct_values(column, &rows))
    }

    async fn committed_rows(
        &self,
        source_id: &str,
        column: &str,
    ) -> Result<Vec<hub_core::RelationalRow>, HubError> {
        let source = self.inner.source(source_id)?;
        if source.schema.column(column).is_none() {
            return Err(HubError::InvalidQuery(format!(
                "unknown column {column} for source {source_id}"
            )));
        }
        self.inner.ensure_prepared(source_id, &source.schema).await?;
        let rows = query::matching_rows(
            self.inner.merger.writer().relational().as_ref(),
            self.inner.merger.store(),
            &source.schema,
            source_id,
            &[],
        )
        .await?;
        Ok(rows
            .into_iter()
            .filter(|(row, record)| query::is_fully_committed(row, record.as_ref()))
            .map(|(row, _)| row)
            .collect())
    }
}

impl Inner {
    fn source(&self, source_id: &str) -> Result<Arc<RegisteredSource>, HubError> {
        let sources = self.sources.read().unwrap_or_else(|e| e.into_inner());
        sources
            .get(source_id)
            .cloned()
            .ok_or_else(|| HubError::UnknownSource(source_id.to_string()))
    }

    fn update_run(&self, run: &IngestionRun) {
        let mut runs = self.runs.write().unwrap_or_else(|e| e.into_inner());
        runs.insert(run.run_id, run.clone());
    }

    /// Create the relational table once per process. A relational sink that does
    /// not persist is rebuilt from the stored documents.
    async fn ensure_prepared(&self, source_id: &str, schema: &DomainSchema) -> Result<(), HubError> {
        let mut prepared = self.prepared.lock().await;
        if prepared.contains(source_id) {
            return Ok(());
        }
        let writer = self.merger.writer();
        writer
            .prepare(source_id, &schema.columns)
            .await
            .map_err(|e| HubError::Storage(format!("preparing {source_id}: {e}")))?;
        if !writer.relational().is_persistent() {
            let store = self.merger.store();
            store
                .hydrate_source(source_id, &schema.columns)
                .await
                .map_err(|e| HubError::Storage(format!("loading documents of {source_id}: {e}")))?;
            let records = store.records(source_id);
            for record in records.iter().filter(|r| r.write_state.is_committed()) {
                writer
                    .relational()
                    .upsert_row(&record.relational)
                    .await
                    .map_err(|e| HubError::Storage(format!("restoring {}: {e}", record.entity_key())))?;
            }
            if !records.is_empty() {
                info!(source_id, rows = records.len(), "relational projection rebuilt from documents");
            }
        }
        prepared.insert(source_id.to_string());
        Ok(())
    }

    async fn execute(
        self: Arc<Self>,
        mut run: IngestionRun,
        source: Arc<RegisteredSource>,
        cancel: CancellationToken,
    ) -> IngestionRun {
        let end = self.drive(&mut run, &source, &cancel).await;
        run.close(end);
        let c = &run.counts;
        info!(
            status = run.status.as_str(),
            batches = c.batches,
            fetched = c.fetched,
            accepted = c.accepted,
            repaired = c.repaired,
            rejected = c.rejected,
            conflicts = c.conflicts,
            partially_written = c.partially_written,
            error = run.error.as_deref().unwrap_or(""),
            "ingestion run finished"
        );

        if let Some(reports_dir) = &self.options.reports_dir {
            let committed: Vec<CanonicalRecord> = self
                .merger
                .store()
                .records(&run.source_id)
                .into_iter()
                .filter(|r| r.write_state.is_committed())
                .collect();
            match write_run_report(reports_dir, &run, &source.schema.columns, &committed).await {
                Ok(report) => info!(dir = %report.dir.display(), "run report written"),
                Err(err) => warn!(error = %format!("{err:#}"), "writing run report failed"),
            }
        }

        self.update_run(&run);
        run
    }

    async fn drive(
        &self,
        run: &mut IngestionRun,
        source: &RegisteredSource,
        cancel: &CancellationToken,
    ) -> RunEnd {
        let source_id = run.source_id.clone();
        if let Err(err) = self.ensure_prepared(&source_id, &source.schema).await {
            return RunEnd::Fatal(err.to_string());
        }
        let mut cursor = match self.cursors.load(&source_id).await {
            Ok(cursor) => cursor.unwrap_or_else(Cursor::start),
            Err(err) => return RunEnd::Fatal(format!("loading cursor: {err:#}")),
        };
        run.start(cursor);
        self.update_run(run);
        info!(pass = cursor.pass, position = cursor.position, next_sequence = cursor.next_sequence, "run started");

        let ctx = AdapterContext { run_id: run.run_id };
        loop {
            if cancel.is_cancelled() {
                info!(position = cursor.position, "run cancelled at batch boundary");
                return RunEnd::Cancelled;
            }
            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(position = cursor.position, "run cancelled while fetching");
                    return RunEnd::Cancelled;
                }
                fetched = source.adapter.next_batch(&ctx, cursor) => fetched,
            };
            let batch = match fetched {
                Ok(Some(batch)) => batch,
                Ok(None) => {
                    let next = cursor.next_pass();
                    if let Err(err) = self.cursors.save(&source_id, next).await {
                        return RunEnd::Fatal(format!("saving cursor: {err:#}"));
                    }
                    run.end_cursor = Some(next);
                    return RunEnd::Completed;
                }
                Err(AdapterError::SourceUnavailable { reason, .. }) => {
                    warn!(%reason, batches = run.counts.batches, "source unavailable");
                    return RunEnd::SourceUnavailable(reason);
                }
                Err(err) => return RunEnd::Fatal(err.to_string()),
            };

            if let Err(end) = self.process_batch(run, source, &batch.records).await {
                return end;
            }
            cursor = batch.next_cursor;
            if let Err(err) = self.cursors.save(&source_id, cursor).await {
                return RunEnd::Fatal(format!("saving cursor: {err:#}"));
            }
            run.counts.batches += 1;
            run.end_cursor = Some(cursor);
            self.update_run(run);
        }
    }

    async fn archive(&self, records: &[RawRecord]) {
        let Some(artifacts) = &self.options.artifacts else {
            return;
        };
        for raw in records {
            if matches!(raw.payload, RawPayload::Unavailable { .. }) {
                continue;
            }
            if let Err(err) = artifacts
                .store_bytes(
                    raw.fetched_at,
                    &raw.source_id,
                    raw.payload.extension(),
                    &raw.payload.as_bytes(),
                )
                .await
            {
                warn!(locator = %raw.locator, error = %format!("{err:#}"), "raw archival failed");
            }
        }
    }

    /// Extract, validate and merge one batch. Returns the run end on a fatal
    /// error, after every started merge has finished.
    async fn process_batch(
        &self,
        run: &mut IngestionRun,
        source: &RegisteredSource,
        records: &[RawRecord],
    ) -> Result<(), RunEnd> {
        run.counts.fetched += records.len() as u64;
        self.archive(records).await;

        let schema = &source.schema;
        let mut groups: BTreeMap<EntityKey, Vec<Observation>> = BTreeMap::new();
        for raw in records {
            let mut intermediate = match source.extraction.extract(raw) {
                Ok(record) => record,
                Err(failure) => {
                    warn!(fetch_sequence = raw.fetch_sequence, locator = %raw.locator, reason = %failure.reason, "extract failure");
                    run.counts.extract_failures += 1;
                    run.counts.rejected += 1;
                    run.record_issue(
                        raw.fetch_sequence,
                        &raw.locator,
                        IssueKind::ExtractFailure,
                        failure.to_string(),
                    );
                    continue;
                }
            };

            let outcome = source.validator.validate(&mut intermediate);
            let detail = || {
                outcome
                    .violations
                    .iter()
                    .map(|v| format!("{}: {} ({})", v.field, v.rule, v.detail))
                    .collect::<Vec<_>>()
                    .join("; ")
            };
            match outcome.status {
                ValidationStatus::Rejected => {
                    warn!(fetch_sequence = raw.fetch_sequence, locator = %raw.locator, violations = %detail(), "record rejected");
                    run.counts.rejected += 1;
                    run.record_issue(raw.fetch_sequence, &raw.locator, IssueKind::ValidationRejected, detail());
                    continue;
                }
                ValidationStatus::Repaired => {
                    run.counts.repaired += 1;
                    run.record_issue(raw.fetch_sequence, &raw.locator, IssueKind::ValidationRepaired, detail());
                }
                ValidationStatus::Accepted => run.counts.accepted += 1,
            }

            let key = compute_entity_key(schema, &intermediate).map_err(|e| RunEnd::Fatal(e.to_string()))?;
            let observation =
                Observation::from_record(schema, key.clone(), run.run_id, &intermediate, outcome.status);
            groups.entry(key).or_default().push(observation);
        }

        let mut merges = JoinSet::new();
        for (key, observations) in groups {
            let merger = self.merger.clone();
            let schema = source.schema.clone();
            merges.spawn(async move { merger.merge_group(&schema, key, observations).await });
        }

        let mut reports: Vec<GroupReport> = Vec::new();
        let mut failure = None;
        while let Some(joined) = merges.join_next().await {
            match joined {
                Ok(Ok(report)) => reports.push(report),
                Ok(Err(err)) => {
                    failure.get_or_insert_with(|| format!("loading canonical state: {err}"));
                }
                Err(err) => {
                    failure.get_or_insert_with(|| format!("merge task failed: {err}"));
                }
            }
        }
        reports.sort_by(|a, b| a.entity_key.cmp(&b.entity_key));
        for report in reports {
            account(run, report);
        }

        match failure {
            Some(reason) => Err(RunEnd::Fatal(reason)),
            None => Ok(()),
        }
    }
}

fn account(run: &mut IngestionRun, report: GroupReport) {
    let counts = &mut run.counts;
    let mut conflicts = Vec::new();
    for merged in &report.observations {
        match &merged.outcome {
            MergeOutcome::Created => counts.created += 1,
            MergeOutcome::Updated => counts.updated += 1,
            MergeOutcome::Unchanged => counts.unchanged += 1,
            MergeOutcome::Superseded => counts.superseded += 1,
            MergeOutcome::Conflict(conflict) => {
                counts.conflicts += 1;
                conflicts.push((merged.fetch_sequence, merged.locator.clone(), conflict.to_string()));
            }
        }
    }
    for (seq, locator, detail) in conflicts {
        run.record_issue(seq, &locator, IssueKind::MergeConflict, detail);
    }

    let Some(write) = report.write else {
        return;
    };
    match &write.state {
        WriteState::Committed => run.counts.committed += 1,
        WriteState::PartiallyWritten { pending } => {
            run.counts.partially_written += 1;
            let (seq, locator) = report
                .observations
                .last()
                .map(|o| (o.fetch_sequence, o.locator.clone()))
                .unwrap_or_default();
            run.record_issue(
                seq,
                &locator,
                IssueKind::PartiallyWritten,
                format!(
                    "{} v{} pending {:?}: {}",
                    write.entity_key,
                    write.version,
                    pending,
                    write.errors.join("; ")
                ),
            );
        }
        WriteState::Pending => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_adapters::{FixtureAdapter, FixtureRecord};
    use hub_core::{RunStatus, SourceDomain};
    use serde_json::json;

    /// Half-hour window number `slot` of 2026-10-18, starting at noon.
    fn window(region: u32, slot: u32, forecast: i64) -> FixtureRecord {
        let stamp = |n: u32| {
            let minutes = 12 * 60 + n * 30;
            format!("2026-10-18T{:02}:{:02}Z", minutes / 60, minutes % 60)
        };
        FixtureRecord::json(
            &format!("fixture://carbon/{region}/{slot}"),
            json!({
                "regionid": region,
                "shortname": "London",
                "from": stamp(slot),
                "to": stamp(slot + 1),
                "intensity": {"forecast": forecast, "index": "low"}
            }),
        )
    }

    fn pipeline(records: Vec<FixtureRecord>) -> Pipeline {
        let pipeline = Pipeline::in_memory(PipelineOptions {
            write_backoff: BackoffPolicy::immediate(3),
            ..PipelineOptions::default()
        });
        let adapter = FixtureAdapter::from_records("carbon", SourceDomain::CarbonIntensity, records)
            .with_batch_size(2);
        pipeline
            .register_source(
                Arc::new(adapter),
                hub_adapters::carbon_intensity_table(),
                RuleSet::builtin(SourceDomain::CarbonIntensity),
            )
            .unwrap();
        pipeline
    }

    #[tokio::test]
    async fn unknown_source_is_refused() {
        let pipeline = pipeline(vec![]);
        assert!(matches!(pipeline.ingest("nope"), Err(HubError::UnknownSource(_))));
        assert!(matches!(
            pipeline.run_status(Uuid::new_v4()),
            Err(HubError::UnknownRun(_))
        ));
    }

    #[tokio::test]
    async fn clean_run_succeeds_and_rolls_the_cursor() {
        let pipeline = pipeline(vec![window(13, 0, 143), window(13, 1, 150), window(12, 0, 99)]);
        let handle = pipeline.ingest("carbon").unwrap();
        let run_id = handle.run_id();
        let run = handle.wait().await.unwrap();

        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.counts.batches, 2);
        assert_eq!(run.counts.created, 3);
        assert_eq!(run.counts.committed, 3);
        assert_eq!(run.end_cursor, Some(Cursor::start().advance(3, 3).next_pass()));
        assert_eq!(pipeline.run_status(run_id).unwrap(), run);
        assert!(pipeline.active_run("carbon").is_none());
    }

    #[tokio::test]
    async fn second_pass_re_observes_without_new_history() {
        let pipeline = pipeline(vec![window(13, 0, 143)]);
        pipeline.ingest("carbon").unwrap().wait().await.unwrap();
        let second = pipeline.ingest("carbon").unwrap().wait().await.unwrap();
        assert_eq!(second.status, RunStatus::Succeeded);
        assert_eq!(second.counts.unchanged, 1);

        let result = pipeline.query(&RecordQuery::new("carbon")).await.unwrap();
        assert_eq!(result.total, 1);
        let key = result.records[0].entity_key().clone();
        let record = pipeline.record(&key).unwrap();
        assert_eq!(record.document.history.len(), 1);
        assert_eq!(record.document.history[0].last_seen_sequence, 2);
        assert_eq!(pipeline.runs().len(), 2);
    }

    #[tokio::test]
    async fn registering_mismatched_rules_is_a_config_error() {
        let pipeline = pipeline(vec![]);
        let adapter = FixtureAdapter::from_records("homes", SourceDomain::PropertyListing, vec![]);
        let err = pipeline
            .register_source(
                Arc::new(adapter),
                hub_adapters::property_listing_table(),
                RuleSet::builtin(SourceDomain::CarbonIntensity),
            )
            .unwrap_err();
        assert!(matches!(err, HubError::Config(_)));
    }
}
