use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hub_core::{Cursor, RawPayload, SourceDomain};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{sequence_records, AdapterContext, AdapterError, RawBatch, SourceAdapter};

/// Recorded upstream responses for one source, replayed without network access.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub source_id: String,
    pub domain: SourceDomain,
    pub captured_from_url: String,
    pub fetched_at: DateTime<Utc>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    pub records: Vec<FixtureRecord>,
    pub notes: Option<String>,
}

fn default_batch_size() -> usize {
    10
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FixtureRecord {
    pub locator: String,
    pub content_type: Option<String>,
    /// Raw artifact next to the bundle, read into `inline_text` on load.
    pub path: Option<String>,
    pub inline_text: Option<String>,
    pub json: Option<JsonValue>,
    /// Recorded as retrieved-but-unreadable (e.g. a detail page that returned 500).
    pub unavailable: Option<String>,
}

impl FixtureRecord {
    pub fn html(locator: &str, html: &str) -> Self {
        Self {
            locator: locator.to_string(),
            content_type: Some("text/html".to_string()),
            inline_text: Some(html.to_string()),
            ..Self::default()
        }
    }

    pub fn json(locator: &str, value: JsonValue) -> Self {
        Self {
            locator: locator.to_string(),
            json: Some(value),
            ..Self::default()
        }
    }

    fn payload(&self) -> RawPayload {
        if let Some(reason) = &self.unavailable {
            return RawPayload::Unavailable {
                reason: reason.clone(),
            };
        }
        if let Some(value) = &self.json {
            return RawPayload::Tree {
                value: value.clone(),
            };
        }
        match &self.inline_text {
            Some(text) => RawPayload::Bytes {
                content_type: self
                    .content_type
                    .clone()
                    .unwrap_or_else(|| "text/html".to_string()),
                body: text.as_bytes().to_vec(),
            },
            None => RawPayload::Unavailable {
                reason: format!("fixture artifact {:?} missing", self.path),
            },
        }
    }
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut bundle: FixtureBundle =
        serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
    hydrate_artifacts(path, &mut bundle)?;
    Ok(bundle)
}

fn hydrate_artifacts(bundle_path: &Path, bundle: &mut FixtureBundle) -> Result<()> {
    let dir = bundle_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    for record in &mut bundle.records {
        if record.inline_text.is_some() || record.json.is_some() {
            continue;
        }
        let Some(rel_path) = &record.path else {
            continue;
        };
        let raw_path = dir.join(rel_path);
        if !raw_path.exists() {
            continue;
        }
        let raw = fs::read_to_string(&raw_path)
            .with_context(|| format!("reading fixture artifact {}", raw_path.display()))?;
        if rel_path.ends_with(".json") {
            record.json = Some(
                serde_json::from_str(&raw)
                    .with_context(|| format!("parsing fixture artifact {}", raw_path.display()))?,
            );
        } else {
            record.inline_text = Some(raw);
        }
    }
    Ok(())
}

/// Serves a bundle in fixed-size batches. The cursor position is the record index.
#[derive(Debug, Clone)]
pub struct FixtureAdapter {
    bundle: FixtureBundle,
    batch_size: usize,
    unavailable_from: Option<u64>,
}

impl FixtureAdapter {
    pub fn new(bundle: FixtureBundle) -> Self {
        let batch_size = bundle.batch_size.max(1);
        Self {
            bundle,
            batch_size,
            unavailable_from: None,
        }
    }

    pub fn from_records(source_id: &str, domain: SourceDomain, records: Vec<FixtureRecord>) -> Self {
        Self::new(FixtureBundle {
            source_id: source_id.to_string(),
            domain,
            captured_from_url: format!("fixture://{source_id}"),
            fetched_at: DateTime::<Utc>::default(),
            batch_size: default_batch_size(),
            records,
            notes: None,
        })
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Simulate the upstream going away once the cursor reaches `position`.
    pub fn unavailable_from(mut self, position: u64) -> Self {
        self.unavailable_from = Some(position);
        self
    }

    pub fn bundle(&self) -> &FixtureBundle {
        &self.bundle
    }
}

#[async_trait]
impl SourceAdapter for FixtureAdapter {
    fn source_id(&self) -> &str {
        &self.bundle.source_id
    }

    fn domain(&self) -> SourceDomain {
        self.bundle.domain
    }

    async fn next_batch(
        &self,
        _ctx: &AdapterContext,
        cursor: Cursor,
    ) -> Result<Option<RawBatch>, AdapterError> {
        if self.unavailable_from.is_some_and(|p| cursor.position >= p) {
            return Err(AdapterError::SourceUnavailable {
                source_id: self.bundle.source_id.clone(),
                reason: format!("fixture unavailable at position {}", cursor.position),
            });
        }
        let start = cursor.position as usize;
        if start >= self.bundle.records.len() {
            return Ok(None);
        }
        let end = (start + self.batch_size).min(self.bundle.records.len());
        let slice = &self.bundle.records[start..end];

        let records = sequence_records(
            &self.bundle.source_id,
            cursor,
            slice
                .iter()
                .map(|r| (self.bundle.fetched_at, r.locator.clone(), r.payload())),
        );
        let next_cursor = cursor.advance(slice.len() as u64, records.len() as u64);
        Ok(Some(RawBatch {
            records,
            next_cursor,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
    }

    fn ctx() -> AdapterContext {
        AdapterContext {
            run_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn checked_in_bundles_load_with_artifacts() {
        for source in ["london-property", "carbon-intensity"] {
            let path = workspace_root().join("fixtures").join(source).join("bundle.json");
            let bundle = load_fixture_bundle(&path).expect("bundle loads");
            assert_eq!(bundle.source_id, source);
            assert!(!bundle.records.is_empty());
            assert!(bundle
                .records
                .iter()
                .all(|r| r.inline_text.is_some() || r.json.is_some() || r.unavailable.is_some()));
        }
    }

    #[tokio::test]
    async fn batches_follow_the_cursor_and_number_records() {
        let records = (0..5)
            .map(|i| FixtureRecord::json(&format!("fixture://w/{i}"), json!({ "i": i })))
            .collect();
        let adapter =
            FixtureAdapter::from_records("w", SourceDomain::CarbonIntensity, records).with_batch_size(2);

        let first = adapter.next_batch(&ctx(), Cursor::start()).await.unwrap().unwrap();
        assert_eq!(
            first.records.iter().map(|r| r.fetch_sequence).collect::<Vec<_>>(),
            vec![1, 2]
        );
        let third = adapter
            .next_batch(&ctx(), first.next_cursor.advance(2, 2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(third.records.len(), 1);
        assert_eq!(third.records[0].fetch_sequence, 5);
        assert!(adapter
            .next_batch(&ctx(), third.next_cursor)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn same_cursor_replays_same_sequence_numbers() {
        let records = vec![FixtureRecord::html("fixture://p/1", "<address>x</address>")];
        let adapter = FixtureAdapter::from_records("p", SourceDomain::PropertyListing, records);
        let a = adapter.next_batch(&ctx(), Cursor::start()).await.unwrap();
        let b = adapter.next_batch(&ctx(), Cursor::start()).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn unavailable_position_reports_source_unavailable() {
        let adapter = FixtureAdapter::from_records("p", SourceDomain::PropertyListing, vec![])
            .unavailable_from(0);
        assert!(matches!(
            adapter.next_batch(&ctx(), Cursor::start()).await,
            Err(AdapterError::SourceUnavailable { .. })
        ));
    }
}
