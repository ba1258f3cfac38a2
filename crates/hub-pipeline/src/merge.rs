//! Deduplication and merge of observations into canonical records.
//!
//! Observations of one entity are folded in with [`apply_observation`], a pure
//! function over the stored document. History is kept ordered by fetch
//! sequence with each entry spanning the sequences over which its values were
//! seen unchanged, so folding the same set of observations in any order yields
//! the same document, and folding an observation twice changes nothing.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, SecondsFormat, Utc};
use hub_core::{
    CanonicalDocument, CanonicalRecord, ColumnSpec, EntityKey, FieldValue, HistoryEntry, HubError,
    IntermediateRecord, MergeConflict, Provenance, ValidationStatus, WriteState,
};
use hub_storage::{DocumentSink, SinkError};
use serde::Serialize;
use strsim::jaro_winkler;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::schema::{DomainSchema, KeyPart};
use crate::writer::{DualSinkWriter, ReconciliationTask, WriteResult};

pub fn normalize_key_fragment(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Floor `ts` to the start of its `minutes`-wide bucket.
pub fn time_bucket(ts: DateTime<Utc>, minutes: i64) -> DateTime<Utc> {
    let width = minutes.max(1) * 60;
    let secs = ts.timestamp();
    DateTime::<Utc>::from_timestamp(secs - secs.rem_euclid(width), 0).unwrap_or(ts)
}

/// Derive the entity key from record fields. A key field that validation should
/// have guaranteed but is absent is an invariant violation.
pub fn compute_entity_key(
    schema: &DomainSchema,
    record: &IntermediateRecord,
) -> Result<EntityKey, HubError> {
    let components = schema
        .key
        .iter()
        .map(|part| key_component(*part, record))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(EntityKey::new(&record.raw.source_id, &components))
}

fn key_component(part: KeyPart, record: &IntermediateRecord) -> Result<String, HubError> {
    let missing = || {
        HubError::InvariantViolation(format!(
            "entity key field {} missing on {} #{}",
            part.field(),
            record.raw.locator,
            record.raw.fetch_sequence
        ))
    };
    match part {
        KeyPart::NormalizedText(field) => record
            .text(field)
            .map(normalize_key_fragment)
            .filter(|s| !s.is_empty())
            .ok_or_else(missing),
        KeyPart::CompactUpper(field) => Ok(record
            .text(field)
            .map(|t| t.split_whitespace().collect::<String>().to_uppercase())
            .unwrap_or_default()),
        KeyPart::Integer(field) => match record.get(field) {
            Some(FieldValue::Integer(v)) => Ok(v.to_string()),
            _ => Err(missing()),
        },
        KeyPart::TimeBucket(field, minutes) => record
            .get(field)
            .and_then(FieldValue::as_timestamp)
            .map(|ts| time_bucket(ts, minutes).to_rfc3339_opts(SecondsFormat::Secs, true))
            .ok_or_else(missing),
    }
}

/// One validated record, ready to merge.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub entity_key: EntityKey,
    pub source_id: String,
    pub fetch_sequence: u64,
    pub observed_at: DateTime<Utc>,
    pub run_id: Uuid,
    pub locator: String,
    pub identity: BTreeMap<String, FieldValue>,
    pub tracked: BTreeMap<String, FieldValue>,
    pub payload: BTreeMap<String, FieldValue>,
    /// Values this observation adds to each collected list field.
    pub collected: BTreeMap<String, Vec<String>>,
    pub provenance: BTreeMap<String, Provenance>,
    pub validation: ValidationStatus,
}

impl Observation {
    pub fn from_record(
        schema: &DomainSchema,
        entity_key: EntityKey,
        run_id: Uuid,
        record: &IntermediateRecord,
        validation: ValidationStatus,
    ) -> Self {
        let pick = |fields: &[&'static str]| {
            fields
                .iter()
                .filter_map(|f| record.get(f).map(|v| (f.to_string(), v.clone())))
                .collect::<BTreeMap<_, _>>()
        };
        Self {
            entity_key,
            source_id: record.raw.source_id.clone(),
            fetch_sequence: record.raw.fetch_sequence,
            observed_at: record.raw.fetched_at,
            run_id,
            locator: record.raw.locator.clone(),
            identity: pick(&schema.identity),
            tracked: pick(&schema.tracked),
            payload: record.fields.clone(),
            collected: schema
                .collected
                .iter()
                .map(|(field, list)| {
                    let values = record
                        .text(field)
                        .map(|v| v.trim().to_uppercase())
                        .filter(|v| !v.is_empty());
                    (list.to_string(), values.into_iter().collect())
                })
                .collect(),
            provenance: record.provenance.clone(),
            validation,
        }
    }

    /// Collected list fields as the union of `base` and this observation.
    fn collected_over(&self, base: &BTreeMap<String, FieldValue>) -> Vec<(String, FieldValue)> {
        self.collected
            .iter()
            .filter_map(|(list, values)| {
                let mut all: BTreeSet<String> = match base.get(list) {
                    Some(FieldValue::List(items)) => items.iter().cloned().collect(),
                    _ => BTreeSet::new(),
                };
                all.extend(values.iter().cloned());
                (!all.is_empty()).then(|| (list.clone(), FieldValue::List(all.into_iter().collect())))
            })
            .collect()
    }

    fn history_entry(&self) -> HistoryEntry {
        HistoryEntry {
            fetch_sequence: self.fetch_sequence,
            observed_at: self.observed_at,
            run_id: self.run_id,
            last_seen_sequence: self.fetch_sequence,
            last_seen_at: self.observed_at,
            values: self.tracked.clone(),
        }
    }

    fn first_document(&self) -> CanonicalDocument {
        let mut payload = self.payload.clone();
        payload.extend(self.collected_over(&BTreeMap::new()));
        CanonicalDocument {
            entity_key: self.entity_key.clone(),
            source_id: self.source_id.clone(),
            version: 1,
            identity: self.identity.clone(),
            payload,
            provenance: self.provenance.clone(),
            validation: self.validation,
            current_sequence: self.fetch_sequence,
            last_seen_sequence: self.fetch_sequence,
            history: vec![self.history_entry()],
            first_seen_at: self.observed_at,
            updated_at: self.observed_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MergeOutcome {
    Created,
    Updated,
    /// Nothing observable changed; a repeated observation lands here.
    Unchanged,
    /// Older than the current observation: history only.
    Superseded,
    Conflict(MergeConflict),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    pub outcome: MergeOutcome,
    /// The new document version, when anything changed.
    pub document: Option<CanonicalDocument>,
}

pub fn apply_observation(current: Option<&CanonicalDocument>, obs: &Observation) -> Applied {
    let Some(current) = current else {
        return Applied {
            outcome: MergeOutcome::Created,
            document: Some(obs.first_document()),
        };
    };
    if let Some(conflict) = identity_conflict(current, obs) {
        return Applied {
            outcome: MergeOutcome::Conflict(conflict),
            document: None,
        };
    }

    let mut next = current.clone();
    let mut changed = insert_history(&mut next.history, obs);
    for (field, value) in &obs.identity {
        if !next.identity.contains_key(field) {
            next.identity.insert(field.clone(), value.clone());
            changed = true;
        }
    }

    let collected = obs.collected_over(&current.payload);
    let mut tracked_changed = collected
        .iter()
        .any(|(list, value)| current.payload.get(list) != Some(value));
    if obs.fetch_sequence > current.current_sequence {
        tracked_changed |= current
            .history
            .iter()
            .find(|e| e.covers(current.current_sequence))
            .map_or(true, |e| e.values != obs.tracked);
        let mut payload = obs.payload.clone();
        payload.extend(collected);
        changed |= next.payload != payload
            || next.provenance != obs.provenance
            || next.validation != obs.validation;
        next.payload = payload;
        next.provenance = obs.provenance.clone();
        next.validation = obs.validation;
        next.current_sequence = obs.fetch_sequence;
    } else {
        for (list, value) in collected {
            if next.payload.get(&list) != Some(&value) {
                next.payload.insert(list, value);
                changed = true;
            }
        }
    }
    if obs.fetch_sequence > next.last_seen_sequence {
        next.last_seen_sequence = obs.fetch_sequence;
        changed = true;
    }

    if !changed {
        return Applied {
            outcome: MergeOutcome::Unchanged,
            document: None,
        };
    }
    let outcome = if obs.fetch_sequence < current.current_sequence {
        MergeOutcome::Superseded
    } else if tracked_changed {
        MergeOutcome::Updated
    } else {
        MergeOutcome::Unchanged
    };
    next.version += 1;
    next.updated_at = current.updated_at.max(obs.observed_at);
    Applied {
        outcome,
        document: Some(next),
    }
}

fn same_identity(a: &FieldValue, b: &FieldValue) -> bool {
    match (a, b) {
        (FieldValue::Text(a), FieldValue::Text(b)) => {
            normalize_key_fragment(a) == normalize_key_fragment(b)
        }
        _ => a == b,
    }
}

fn identity_conflict(current: &CanonicalDocument, obs: &Observation) -> Option<MergeConflict> {
    obs.identity.iter().find_map(|(field, incoming)| {
        let existing = current.identity.get(field)?;
        if same_identity(existing, incoming) {
            return None;
        }
        let similarity = jaro_winkler(
            &normalize_key_fragment(&existing.to_string()),
            &normalize_key_fragment(&incoming.to_string()),
        );
        Some(MergeConflict {
            entity_key: current.entity_key.clone(),
            field: field.clone(),
            existing: Some(existing.clone()),
            incoming: Some(incoming.clone()),
            fetch_sequence: obs.fetch_sequence,
            similarity,
        })
    })
}

/// Fold one sighting into the sequence-ordered history. Adjacent entries always
/// differ in values. Returns whether the history changed.
fn insert_history(history: &mut Vec<HistoryEntry>, obs: &Observation) -> bool {
    let seq = obs.fetch_sequence;

    if let Some(idx) = history.iter().position(|e| e.covers(seq)) {
        let entry = &history[idx];
        if entry.values == obs.tracked
            || seq == entry.fetch_sequence
            || seq == entry.last_seen_sequence
        {
            return false;
        }
        // A different value strictly inside a span splits it at the known endpoints.
        let mut right = entry.clone();
        right.fetch_sequence = entry.last_seen_sequence;
        right.observed_at = entry.last_seen_at;
        let left = &mut history[idx];
        left.last_seen_sequence = left.fetch_sequence;
        left.last_seen_at = left.observed_at;
        history.insert(idx + 1, obs.history_entry());
        history.insert(idx + 2, right);
        return true;
    }

    let idx = history.partition_point(|e| e.last_seen_sequence < seq);
    if idx > 0 && history[idx - 1].values == obs.tracked {
        let pred = &mut history[idx - 1];
        pred.last_seen_sequence = seq;
        pred.last_seen_at = obs.observed_at;
        return true;
    }
    if let Some(succ) = history.get_mut(idx).filter(|e| e.values == obs.tracked) {
        succ.fetch_sequence = seq;
        succ.observed_at = obs.observed_at;
        succ.run_id = obs.run_id;
        return true;
    }
    history.insert(idx, obs.history_entry());
    true
}

/// Current canonical records shared by all runs. Keys missing in memory are
/// hydrated from the document sink, which carries full history.
pub struct CanonicalStore {
    documents: Arc<dyn DocumentSink>,
    records: RwLock<HashMap<EntityKey, CanonicalRecord>>,
    hydrated: Mutex<HashSet<String>>,
}

impl CanonicalStore {
    pub fn new(documents: Arc<dyn DocumentSink>) -> Self {
        Self {
            documents,
            records: RwLock::new(HashMap::new()),
            hydrated: Mutex::new(HashSet::new()),
        }
    }

    pub fn get(&self, key: &EntityKey) -> Option<CanonicalRecord> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        records.get(key).cloned()
    }

    pub fn put(&self, record: CanonicalRecord) {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records.insert(record.entity_key().clone(), record);
    }

    pub async fn load(
        &self,
        key: &EntityKey,
        columns: &[ColumnSpec],
    ) -> Result<Option<CanonicalRecord>, SinkError> {
        if let Some(record) = self.get(key) {
            return Ok(Some(record));
        }
        let Some(document) = self.documents.get_document(key).await? else {
            return Ok(None);
        };
        debug!(entity_key = %key, version = document.version, "canonical record hydrated");
        let record = CanonicalRecord::from_document(document, columns);
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        Ok(Some(records.entry(key.clone()).or_insert(record).clone()))
    }

    /// Pull every stored document of a source into memory, once per process.
    pub async fn hydrate_source(&self, source_id: &str, columns: &[ColumnSpec]) -> Result<(), SinkError> {
        {
            let hydrated = self.hydrated.lock().unwrap_or_else(|e| e.into_inner());
            if hydrated.contains(source_id) {
                return Ok(());
            }
        }
        let documents = self.documents.list_documents(source_id).await?;
        {
            let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
            for document in documents {
                records
                    .entry(document.entity_key.clone())
                    .or_insert_with(|| CanonicalRecord::from_document(document, columns));
            }
        }
        let mut hydrated = self.hydrated.lock().unwrap_or_else(|e| e.into_inner());
        hydrated.insert(source_id.to_string());
        Ok(())
    }

    /// Records of one source ordered by entity key.
    pub fn records(&self, source_id: &str) -> Vec<CanonicalRecord> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<CanonicalRecord> = records
            .values()
            .filter(|r| r.document.source_id == source_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.entity_key().cmp(b.entity_key()));
        out
    }
}

/// Fixed set of async mutexes; a key always maps to the same shard, so merges
/// of one key are serialized while unrelated keys mostly proceed in parallel.
pub struct ShardedLocks {
    shards: Vec<Arc<AsyncMutex<()>>>,
}

impl ShardedLocks {
    pub fn new(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1))
                .map(|_| Arc::new(AsyncMutex::new(())))
                .collect(),
        }
    }

    pub fn shard_of(&self, key: &EntityKey) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    pub async fn lock(&self, key: &EntityKey) -> OwnedMutexGuard<()> {
        self.shards[self.shard_of(key)].clone().lock_owned().await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergedObservation {
    pub fetch_sequence: u64,
    pub locator: String,
    pub outcome: MergeOutcome,
}

/// Result of merging all observations of one key within a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupReport {
    pub entity_key: EntityKey,
    pub observations: Vec<MergedObservation>,
    pub write: Option<WriteResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub attempted: usize,
    pub committed: usize,
    pub still_pending: Vec<ReconciliationTask>,
}

/// Single writer per entity key: load, fold, commit and publish happen under
/// the key's shard lock.
pub struct Merger {
    store: Arc<CanonicalStore>,
    locks: ShardedLocks,
    writer: Arc<DualSinkWriter>,
}

impl Merger {
    pub fn new(store: Arc<CanonicalStore>, writer: Arc<DualSinkWriter>, shards: usize) -> Self {
        Self {
            store,
            locks: ShardedLocks::new(shards),
            writer,
        }
    }

    pub fn store(&self) -> &Arc<CanonicalStore> {
        &self.store
    }

    pub fn writer(&self) -> &Arc<DualSinkWriter> {
        &self.writer
    }

    pub async fn merge_group(
        &self,
        schema: &DomainSchema,
        entity_key: EntityKey,
        mut observations: Vec<Observation>,
    ) -> Result<GroupReport, SinkError> {
        observations.sort_by_key(|o| o.fetch_sequence);
        let _guard = self.locks.lock(&entity_key).await;

        let existing = self.store.load(&entity_key, &schema.columns).await?;
        let mut document = existing.as_ref().map(|r| r.document.clone());
        let mut changed = false;
        let mut merged = Vec::with_capacity(observations.len());

        for obs in &observations {
            let applied = apply_observation(document.as_ref(), obs);
            match &applied.outcome {
                MergeOutcome::Conflict(conflict) => {
                    warn!(entity_key = %entity_key, %conflict, "identity conflict; record left untouched")
                }
                MergeOutcome::Unchanged if applied.document.is_none() => {
                    debug!(entity_key = %entity_key, fetch_sequence = obs.fetch_sequence, "observation already applied")
                }
                _ => {}
            }
            if let Some(next) = applied.document {
                document = Some(next);
                changed = true;
            }
            merged.push(MergedObservation {
                fetch_sequence: obs.fetch_sequence,
                locator: obs.locator.clone(),
                outcome: applied.outcome,
            });
        }

        let write = match document.filter(|_| changed) {
            Some(document) => {
                let mut record = CanonicalRecord::from_document(document, &schema.columns);
                record.write_state = WriteState::Pending;
                let result = self.writer.commit(&record).await;
                record.write_state = result.state.clone();
                self.store.put(record);
                Some(result)
            }
            None => None,
        };

        Ok(GroupReport {
            entity_key,
            observations: merged,
            write,
        })
    }

    /// Re-drive every queued reconciliation task under its key lock.
    pub async fn reconcile(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        for task in self.writer.pending_tasks() {
            let _guard = self.locks.lock(&task.entity_key).await;
            let Some(mut record) = self.store.get(&task.entity_key) else {
                warn!(entity_key = %task.entity_key, "reconciliation task without canonical record");
                report.still_pending.push(task);
                continue;
            };
            report.attempted += 1;
            let result = self.writer.redrive(&record, &task).await;
            record.write_state = result.state.clone();
            let committed = result.state.is_committed();
            self.store.put(record);
            if committed {
                report.committed += 1;
            }
        }
        report.still_pending.extend(self.writer.pending_tasks());
        report
    }
}
