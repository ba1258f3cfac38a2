use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, Float64Array, Int64Array, RecordBatch, StringArray, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use hub_core::{CanonicalRecord, ColumnSpec, FieldValue, IngestionRun, ValueKind};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub run_id: String,
    pub source_id: String,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub dir: PathBuf,
    pub manifest: PathBuf,
}

/// Write `reports/<run_id>/`: run.json, run_brief.md and Parquet snapshots of
/// the source's committed records with a sha256 manifest.
pub async fn write_run_report(
    reports_root: &Path,
    run: &IngestionRun,
    columns: &[ColumnSpec],
    committed: &[CanonicalRecord],
) -> Result<RunReport> {
    let dir = reports_root.join(run.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let run_json = serde_json::to_vec_pretty(run).context("serializing run record")?;
    fs::write(dir.join("run.json"), run_json)
        .await
        .context("writing run.json")?;
    fs::write(dir.join("run_brief.md"), run_brief(run, committed.len()))
        .await
        .context("writing run_brief.md")?;

    let snapshot_dir = dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;
    let records_path = snapshot_dir.join("records.parquet");
    let history_path = snapshot_dir.join("history.parquet");
    write_records_parquet(&records_path, columns, committed)?;
    let history_rows = write_history_parquet(&history_path, committed)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        run_id: run.run_id.to_string(),
        source_id: run.source_id.clone(),
        files: vec![
            manifest_entry("records", &dir, &records_path, committed.len())?,
            manifest_entry("history", &dir, &history_path, history_rows)?,
        ],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    Ok(RunReport {
        dir,
        manifest: manifest_path,
    })
}

fn run_brief(run: &IngestionRun, committed: usize) -> String {
    let c = &run.counts;
    let mut issue_counts: BTreeMap<String, usize> = BTreeMap::new();
    for issue in &run.issues {
        *issue_counts.entry(format!("{:?}", issue.kind)).or_default() += 1;
    }
    let issues = if issue_counts.is_empty() {
        "- none".to_string()
    } else {
        issue_counts
            .iter()
            .map(|(k, v)| format!("- {k}: {v}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    format!(
        "# Smart City Data Hub Run Brief\n\n- Run ID: `{}`\n- Source: {}\n- Status: {}\n- Started: {}\n- Finished: {}\n- Batches: {}\n- Fetched: {} (accepted {}, repaired {}, rejected {}, extract failures {})\n- Merge: created {}, updated {}, unchanged {}, superseded {}, conflicts {}\n- Writes: committed {}, partially written {}\n- Committed records for source: {}\n{}\n## Issues\n{}\n",
        run.run_id,
        run.source_id,
        run.status.as_str(),
        run.started_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
        run.finished_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
        c.batches,
        c.fetched,
        c.accepted,
        c.repaired,
        c.rejected,
        c.extract_failures,
        c.created,
        c.updated,
        c.unchanged,
        c.superseded,
        c.conflicts,
        c.committed,
        c.partially_written,
        committed,
        run.error
            .as_ref()
            .map(|e| format!("- Error: {e}\n"))
            .unwrap_or_default(),
        issues
    )
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn text_cell(value: Option<&FieldValue>) -> Option<String> {
    value.map(|v| match v {
        FieldValue::List(items) => items.join("; "),
        other => other.to_string(),
    })
}

fn column_array(column: &ColumnSpec, records: &[CanonicalRecord]) -> (DataType, ArrayRef) {
    let cells = records.iter().map(|r| r.relational.column(&column.name));
    match column.kind {
        ValueKind::Integer => (
            DataType::Int64,
            Arc::new(Int64Array::from(
                cells
                    .map(|v| match v {
                        Some(FieldValue::Integer(n)) => Some(*n),
                        _ => None,
                    })
                    .collect::<Vec<_>>(),
            )),
        ),
        ValueKind::Float => (
            DataType::Float64,
            Arc::new(Float64Array::from(
                cells.map(|v| v.and_then(FieldValue::as_f64)).collect::<Vec<_>>(),
            )),
        ),
        ValueKind::Text | ValueKind::Timestamp | ValueKind::List => (
            DataType::Utf8,
            Arc::new(StringArray::from(cells.map(text_cell).collect::<Vec<_>>())),
        ),
    }
}

fn write_records_parquet(
    path: &Path,
    columns: &[ColumnSpec],
    records: &[CanonicalRecord],
) -> Result<()> {
    let mut fields = vec![
        ArrowField::new("entity_key", DataType::Utf8, false),
        ArrowField::new("version", DataType::UInt64, false),
    ];
    let mut arrays: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(
            records
                .iter()
                .map(|r| Some(r.entity_key().as_str()))
                .collect::<Vec<_>>(),
        )),
        Arc::new(UInt64Array::from(
            records.iter().map(|r| r.document.version).collect::<Vec<_>>(),
        )),
    ];
    for column in columns {
        let (data_type, array) = column_array(column, records);
        fields.push(ArrowField::new(column.name.as_str(), data_type, true));
        arrays.push(array);
    }

    let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)
        .context("building records record batch")?;
    write_parquet(path, batch)
}

fn write_history_parquet(path: &Path, records: &[CanonicalRecord]) -> Result<usize> {
    let rows = records
        .iter()
        .flat_map(|r| r.document.history.iter().map(move |h| (r.entity_key(), h)))
        .collect::<Vec<_>>();

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("entity_key", DataType::Utf8, false),
        ArrowField::new("fetch_sequence", DataType::UInt64, false),
        ArrowField::new("last_seen_sequence", DataType::UInt64, false),
        ArrowField::new("observed_at", DataType::Utf8, false),
        ArrowField::new("values", DataType::Utf8, false),
    ]));
    let keys = StringArray::from(rows.iter().map(|(k, _)| Some(k.as_str())).collect::<Vec<_>>());
    let sequences = UInt64Array::from(rows.iter().map(|(_, h)| h.fetch_sequence).collect::<Vec<_>>());
    let last_seen = UInt64Array::from(
        rows.iter()
            .map(|(_, h)| h.last_seen_sequence)
            .collect::<Vec<_>>(),
    );
    let observed_at = StringArray::from(
        rows.iter()
            .map(|(_, h)| Some(h.observed_at.to_rfc3339()))
            .collect::<Vec<_>>(),
    );
    let values = StringArray::from(
        rows.iter()
            .map(|(_, h)| {
                let json: serde_json::Map<String, serde_json::Value> =
                    h.values.iter().map(|(k, v)| (k.clone(), v.to_json())).collect();
                Some(serde_json::Value::Object(json).to_string())
            })
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(keys),
            Arc::new(sequences),
            Arc::new(last_seen),
            Arc::new(observed_at),
            Arc::new(values),
        ],
    )
    .context("building history record batch")?;
    write_parquet(path, batch)?;
    Ok(rows.len())
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path, rows: usize) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
        rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use hub_core::{
        CanonicalDocument, Cursor, EntityKey, HistoryEntry, RunEnd, SourceDomain, ValidationStatus,
    };
    use uuid::Uuid;

    use crate::schema::DomainSchema;

    fn committed_record() -> CanonicalRecord {
        let at = Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).single().unwrap();
        let values: BTreeMap<String, FieldValue> =
            [("intensity_forecast".to_string(), FieldValue::Integer(143))].into();
        let mut payload = values.clone();
        payload.insert("region_id".into(), FieldValue::Integer(13));
        payload.insert("renewable_percentage".into(), FieldValue::Float(50.65));
        payload.insert("shortname".into(), FieldValue::Text("London".into()));
        let document = CanonicalDocument {
            entity_key: EntityKey::new("carbon-intensity", &["13".into(), "2026-10-18T12:00:00Z".into()]),
            source_id: "carbon-intensity".into(),
            version: 1,
            identity: BTreeMap::new(),
            payload,
            provenance: BTreeMap::new(),
            validation: ValidationStatus::Accepted,
            current_sequence: 1,
            last_seen_sequence: 1,
            history: vec![HistoryEntry {
                fetch_sequence: 1,
                observed_at: at,
                run_id: Uuid::nil(),
                last_seen_sequence: 1,
                last_seen_at: at,
                values,
            }],
            first_seen_at: at,
            updated_at: at,
        };
        CanonicalRecord::from_document(
            document,
            &DomainSchema::for_domain(SourceDomain::CarbonIntensity).columns,
        )
    }

    #[tokio::test]
    async fn run_report_writes_brief_snapshots_and_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        let mut run = IngestionRun::new("carbon-intensity");
        run.start(Cursor::start());
        run.counts.batches = 1;
        run.counts.fetched = 1;
        run.counts.accepted = 1;
        run.counts.created = 1;
        run.counts.committed = 1;
        run.close(RunEnd::Completed);

        let columns = DomainSchema::for_domain(SourceDomain::CarbonIntensity).columns;
        let report = write_run_report(tmp.path(), &run, &columns, &[committed_record()])
            .await
            .unwrap();

        let brief = std::fs::read_to_string(report.dir.join("run_brief.md")).unwrap();
        assert!(brief.contains("Status: succeeded"));
        assert!(brief.contains("- none"));

        let manifest: ParquetManifest =
            serde_json::from_slice(&std::fs::read(&report.manifest).unwrap()).unwrap();
        assert_eq!(manifest.files.len(), 2);
        assert_eq!(manifest.files[0].path, "snapshots/records.parquet");
        assert_eq!(manifest.files[0].rows, 1);
        assert_eq!(manifest.files[1].rows, 1);
        assert_eq!(manifest.files[0].sha256.len(), 64);
        assert!(report.dir.join("run.json").exists());
    }
}
