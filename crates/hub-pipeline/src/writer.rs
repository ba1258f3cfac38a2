use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use hub_core::{CanonicalRecord, ColumnSpec, EntityKey, SinkKind, WriteState};
use hub_storage::{retry_async, BackoffPolicy, DocumentSink, Exhausted, RelationalSink, SinkError};
use serde::Serialize;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WriteResult {
    pub entity_key: EntityKey,
    pub version: u64,
    pub state: WriteState,
    pub errors: Vec<String>,
}

/// A canonical record version that one or both sinks still lack.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciliationTask {
    pub entity_key: EntityKey,
    pub source_id: String,
    pub version: u64,
    pub pending: Vec<SinkKind>,
    pub queued_at: DateTime<Utc>,
    pub last_error: String,
}

/// Writes both projections of a canonical record as one logical unit:
/// relational side, then document side, each retried on its own. A side that
/// still fails leaves the record `PartiallyWritten` with a queued
/// [`ReconciliationTask`]; nothing is rolled back.
pub struct DualSinkWriter {
    relational: Arc<dyn RelationalSink>,
    documents: Arc<dyn DocumentSink>,
    backoff: BackoffPolicy,
    tasks: Mutex<BTreeMap<EntityKey, ReconciliationTask>>,
}

impl DualSinkWriter {
    pub fn new(
        relational: Arc<dyn RelationalSink>,
        documents: Arc<dyn DocumentSink>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            relational,
            documents,
            backoff,
            tasks: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn relational(&self) -> &Arc<dyn RelationalSink> {
        &self.relational
    }

    pub fn documents(&self) -> &Arc<dyn DocumentSink> {
        &self.documents
    }

    pub async fn prepare(&self, source_id: &str, columns: &[ColumnSpec]) -> Result<(), SinkError> {
        let sink = &self.relational;
        retry_async(&self.backoff, "prepare relational table", move |_| {
            sink.prepare(source_id, columns)
        })
        .await
        .map_err(|e| e.last)
    }

    pub async fn commit(&self, record: &CanonicalRecord) -> WriteResult {
        self.write(record, &[SinkKind::Relational, SinkKind::Document])
            .await
    }

    /// Re-drive a queued task. A record that moved on to a newer version since
    /// the task was queued is written to both sides.
    pub async fn redrive(&self, record: &CanonicalRecord, task: &ReconciliationTask) -> WriteResult {
        if record.document.version != task.version {
            return self.commit(record).await;
        }
        self.write(record, &task.pending).await
    }

    pub fn pending_tasks(&self) -> Vec<ReconciliationTask> {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.values().cloned().collect()
    }

    async fn write(&self, record: &CanonicalRecord, sides: &[SinkKind]) -> WriteResult {
        let key = record.entity_key();
        let mut pending = Vec::new();
        let mut errors = Vec::new();

        for side in sides {
            if let Err(err) = self.write_side(*side, record).await {
                warn!(
                    entity_key = %key,
                    sink = ?side,
                    attempts = err.attempts,
                    error = %err.last,
                    "sink write failed after retries"
                );
                pending.push(*side);
                errors.push(err.to_string());
            }
        }

        let state = if pending.is_empty() {
            WriteState::Committed
        } else {
            WriteState::PartiallyWritten {
                pending: pending.clone(),
            }
        };
        self.track(record, &pending, &errors);

        WriteResult {
            entity_key: key.clone(),
            version: record.document.version,
            state,
            errors,
        }
    }

    async fn write_side(
        &self,
        side: SinkKind,
        record: &CanonicalRecord,
    ) -> Result<(), Exhausted<SinkError>> {
        match side {
            SinkKind::Relational => {
                let sink = &self.relational;
                let row = &record.relational;
                let label = format!("{} upsert {}", sink.name(), row.entity_key);
                retry_async(&self.backoff, &label, move |_| sink.upsert_row(row)).await
            }
            SinkKind::Document => {
                let sink = &self.documents;
                let document = &record.document;
                let label = format!("{} put {}", sink.name(), document.entity_key);
                retry_async(&self.backoff, &label, move |_| sink.put_document(document)).await
            }
        }
    }

    fn track(&self, record: &CanonicalRecord, pending: &[SinkKind], errors: &[String]) {
        let key = record.entity_key();
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if pending.is_empty() {
            if tasks.remove(key).is_some() {
                debug!(entity_key = %key, "reconciliation task cleared");
            }
            return;
        }
        tasks.insert(
            key.clone(),
            ReconciliationTask {
                entity_key: key.clone(),
                source_id: record.document.source_id.clone(),
                version: record.document.version,
                pending: pending.to_vec(),
                queued_at: Utc::now(),
                last_error: errors.last().cloned().unwrap_or_default(),
            },
        );
    }
}
