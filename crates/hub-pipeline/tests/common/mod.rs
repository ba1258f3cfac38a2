#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hub_adapters::{AdapterContext, AdapterError, FixtureAdapter, FixtureRecord, RawBatch, SourceAdapter};
use hub_core::{CanonicalDocument, Cursor, EntityKey, IngestionRun, RawPayload, RawRecord, SourceDomain};
use hub_pipeline::{Pipeline, PipelineOptions, RuleSet};
use hub_storage::{
    BackoffPolicy, DocumentSink, MemoryCursorStore, MemoryDocumentSink, MemoryRelationalSink,
    SinkError,
};
use serde_json::{json, Value as JsonValue};
use tokio::sync::Semaphore;
use uuid::Uuid;

pub const CARBON: &str = "carbon-intensity";

pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

pub fn observed_at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 18, 12, minute, 0).single().unwrap()
}

/// Regional carbon intensity payload for half-hour window `slot` after noon.
pub fn carbon_json(region: u32, slot: u32, forecast: i64) -> JsonValue {
    let stamp = |n: u32| {
        let minutes = 12 * 60 + n * 30;
        format!("2026-10-18T{:02}:{:02}Z", minutes / 60, minutes % 60)
    };
    json!({
        "regionid": region,
        "shortname": "London",
        "from": stamp(slot),
        "to": stamp(slot + 1),
        "intensity": {"forecast": forecast, "index": "moderate"}
    })
}

pub fn carbon_record(region: u32, slot: u32, forecast: i64) -> FixtureRecord {
    FixtureRecord::json(
        &format!("https://api.carbonintensity.org.uk/regional/regionid/{region}#{slot}"),
        carbon_json(region, slot, forecast),
    )
}

pub fn raw_carbon(fetch_sequence: u64, value: JsonValue) -> RawRecord {
    RawRecord {
        source_id: CARBON.to_string(),
        fetch_sequence,
        fetched_at: observed_at(fetch_sequence as u32),
        locator: format!("https://api.carbonintensity.org.uk/regional#{fetch_sequence}"),
        payload: RawPayload::Tree { value },
    }
}

/// Pipeline over the given sinks with immediate retries.
pub fn pipeline_with(documents: Arc<dyn DocumentSink>) -> Pipeline {
    Pipeline::new(
        Arc::new(MemoryRelationalSink::new()),
        documents,
        Arc::new(MemoryCursorStore::new()),
        PipelineOptions {
            write_backoff: BackoffPolicy::immediate(3),
            ..PipelineOptions::default()
        },
    )
}

pub fn register_carbon(pipeline: &Pipeline, adapter: impl SourceAdapter + 'static) {
    pipeline
        .register_source(
            Arc::new(adapter),
            hub_adapters::carbon_intensity_table(),
            RuleSet::builtin(SourceDomain::CarbonIntensity),
        )
        .expect("carbon source registers");
}

pub fn carbon_pipeline(records: Vec<FixtureRecord>, batch_size: usize) -> Pipeline {
    let pipeline = pipeline_with(Arc::new(MemoryDocumentSink::new()));
    register_carbon(
        &pipeline,
        FixtureAdapter::from_records(CARBON, SourceDomain::CarbonIntensity, records)
            .with_batch_size(batch_size),
    );
    pipeline
}

pub async fn run_to_end(pipeline: &Pipeline, source_id: &str) -> IngestionRun {
    pipeline
        .ingest(source_id)
        .expect("run starts")
        .wait()
        .await
        .expect("run task finishes")
}

/// Poll until the run has processed `batches` batches.
pub async fn wait_for_batches(pipeline: &Pipeline, run_id: Uuid, batches: u64) {
    for _ in 0..500 {
        if pipeline.run_status(run_id).expect("known run").counts.batches >= batches {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("run {run_id} never reached {batches} batches");
}

/// Serves pre-numbered batches, one per cursor position, regardless of pass.
pub struct ScriptedAdapter {
    pub source_id: String,
    pub batches: Vec<Vec<RawRecord>>,
}

impl ScriptedAdapter {
    pub fn carbon(batches: Vec<Vec<RawRecord>>) -> Self {
        Self {
            source_id: CARBON.to_string(),
            batches,
        }
    }
}

#[async_trait]
impl SourceAdapter for ScriptedAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn domain(&self) -> SourceDomain {
        SourceDomain::CarbonIntensity
    }

    async fn next_batch(
        &self,
        _ctx: &AdapterContext,
        cursor: Cursor,
    ) -> Result<Option<RawBatch>, AdapterError> {
        let Some(records) = self.batches.get(cursor.position as usize) else {
            return Ok(None);
        };
        Ok(Some(RawBatch {
            records: records.clone(),
            next_cursor: cursor.advance(1, records.len() as u64),
        }))
    }
}

/// Wraps an adapter so each batch needs a permit from `gate`.
pub struct GatedAdapter {
    pub inner: FixtureAdapter,
    pub gate: Arc<Semaphore>,
}

impl GatedAdapter {
    pub fn new(inner: FixtureAdapter) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        (
            Self {
                inner,
                gate: gate.clone(),
            },
            gate,
        )
    }
}

#[async_trait]
impl SourceAdapter for GatedAdapter {
    fn source_id(&self) -> &str {
        self.inner.source_id()
    }

    fn domain(&self) -> SourceDomain {
        self.inner.domain()
    }

    async fn next_batch(
        &self,
        ctx: &AdapterContext,
        cursor: Cursor,
    ) -> Result<Option<RawBatch>, AdapterError> {
        self.gate
            .acquire()
            .await
            .map_err(|e| AdapterError::Message(e.to_string()))?
            .forget();
        self.inner.next_batch(ctx, cursor).await
    }
}

/// Document sink whose writes fail while `failing` is set.
#[derive(Default)]
pub struct SwitchableDocuments {
    pub inner: MemoryDocumentSink,
    pub failing: AtomicBool,
    pub put_calls: AtomicUsize,
}

impl SwitchableDocuments {
    pub fn failing() -> Self {
        let sink = Self::default();
        sink.failing.store(true, Ordering::SeqCst);
        sink
    }

    pub fn recover(&self) {
        self.failing.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl DocumentSink for SwitchableDocuments {
    fn name(&self) -> &'static str {
        "switchable-documents"
    }

    async fn put_document(&self, document: &CanonicalDocument) -> Result<(), SinkError> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(SinkError::Unavailable {
                sink: "switchable-documents",
                reason: "document store offline".into(),
            });
        }
        self.inner.put_document(document).await
    }

    async fn get_document(&self, key: &EntityKey) -> Result<Option<CanonicalDocument>, SinkError> {
        self.inner.get_document(key).await
    }

    async fn list_documents(&self, source_id: &str) -> Result<Vec<CanonicalDocument>, SinkError> {
        self.inner.list_documents(source_id).await
    }
}
