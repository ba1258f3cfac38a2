use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::record::{FieldValue, Provenance, ValidationStatus, ValueKind};

/// Stable identity of a real-world entity, derived from record fields only.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityKey(String);

impl EntityKey {
    pub fn new(source_id: &str, components: &[String]) -> Self {
        Self(format!("{}:{}", source_id, components.join("|")))
    }

    /// Rebuild a key read back from storage.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn source_id(&self) -> &str {
        self.0.split(':').next().unwrap_or_default()
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One distinct observation of an entity's mutable attributes, covering the
/// fetch sequences from `fetch_sequence` through `last_seen_sequence` over
/// which the values were seen unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub fetch_sequence: u64,
    pub observed_at: DateTime<Utc>,
    pub run_id: Uuid,
    pub last_seen_sequence: u64,
    pub last_seen_at: DateTime<Utc>,
    pub values: BTreeMap<String, FieldValue>,
}

impl HistoryEntry {
    pub fn covers(&self, fetch_sequence: u64) -> bool {
        (self.fetch_sequence..=self.last_seen_sequence).contains(&fetch_sequence)
    }
}

/// Document-store projection: the full normalized payload plus history.
/// Carries everything needed to rebuild merge state after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalDocument {
    pub entity_key: EntityKey,
    pub source_id: String,
    pub version: u64,
    pub identity: BTreeMap<String, FieldValue>,
    pub payload: BTreeMap<String, FieldValue>,
    pub provenance: BTreeMap<String, Provenance>,
    pub validation: ValidationStatus,
    pub current_sequence: u64,
    pub last_seen_sequence: u64,
    pub history: Vec<HistoryEntry>,
    pub first_seen_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CanonicalDocument {
    pub fn payload_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.payload
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }
}

/// A relational column projected from a canonical payload field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub field: String,
    pub kind: ValueKind,
}

impl ColumnSpec {
    pub fn new(name: &str, kind: ValueKind) -> Self {
        Self {
            name: name.to_string(),
            field: name.to_string(),
            kind,
        }
    }
}

/// Relational projection: typed columns keyed by the entity key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationalRow {
    pub entity_key: EntityKey,
    pub source_id: String,
    pub version: u64,
    pub columns: BTreeMap<String, Option<FieldValue>>,
}

impl RelationalRow {
    pub fn project(document: &CanonicalDocument, columns: &[ColumnSpec]) -> Self {
        Self {
            entity_key: document.entity_key.clone(),
            source_id: document.source_id.clone(),
            version: document.version,
            columns: columns
                .iter()
                .map(|c| {
                    let value = document
                        .payload
                        .get(&c.field)
                        .filter(|v| column_accepts(c.kind, v))
                        .cloned();
                    (c.name.clone(), value)
                })
                .collect(),
        }
    }

    pub fn column(&self, name: &str) -> Option<&FieldValue> {
        self.columns.get(name).and_then(Option::as_ref)
    }
}

fn column_accepts(kind: ValueKind, value: &FieldValue) -> bool {
    matches!(
        (kind, value),
        (ValueKind::Text, FieldValue::Text(_))
            | (ValueKind::Integer, FieldValue::Integer(_))
            | (ValueKind::Float, FieldValue::Float(_))
            | (ValueKind::Float, FieldValue::Integer(_))
            | (ValueKind::Timestamp, FieldValue::Timestamp(_))
            | (ValueKind::List, FieldValue::List(_))
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    Relational,
    Document,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WriteState {
    Pending,
    Committed,
    /// At least one sink still lacks the current version.
    PartiallyWritten { pending: Vec<SinkKind> },
}

impl WriteState {
    pub fn is_committed(&self) -> bool {
        matches!(self, WriteState::Committed)
    }
}

/// Merged current-best representation of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub document: CanonicalDocument,
    pub relational: RelationalRow,
    pub write_state: WriteState,
}

impl CanonicalRecord {
    pub fn from_document(document: CanonicalDocument, columns: &[ColumnSpec]) -> Self {
        let relational = RelationalRow::project(&document, columns);
        Self {
            document,
            relational,
            write_state: WriteState::Committed,
        }
    }

    pub fn entity_key(&self) -> &EntityKey {
        &self.document.entity_key
    }

    pub fn reproject(&mut self, columns: &[ColumnSpec]) {
        self.relational = RelationalRow::project(&self.document, columns);
    }
}

/// Identity-attribute mismatch between a stored entity and an incoming observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeConflict {
    pub entity_key: EntityKey,
    pub field: String,
    pub existing: Option<FieldValue>,
    pub incoming: Option<FieldValue>,
    pub fetch_sequence: u64,
    /// Jaro-Winkler similarity of the rendered values, to help manual review.
    pub similarity: f64,
}

impl fmt::Display for MergeConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let render = |v: &Option<FieldValue>| v.as_ref().map(ToString::to_string).unwrap_or_default();
        write!(
            f,
            "{} field {}: existing={:?} incoming={:?} (similarity {:.2})",
            self.entity_key,
            self.field,
            render(&self.existing),
            render(&self.incoming),
            self.similarity
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Gte,
    Lte,
    Contains,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowFilter {
    pub column: String,
    pub op: FilterOp,
    pub value: FieldValue,
}

impl RowFilter {
    pub fn new(column: &str, op: FilterOp, value: FieldValue) -> Self {
        Self {
            column: column.to_string(),
            op,
            value,
        }
    }

    /// Parse `column<op>value` where op is one of `>=`, `<=`, `~` (contains) or `=`.
    pub fn parse(expr: &str) -> Option<Self> {
        let ops = [
            (">=", FilterOp::Gte),
            ("<=", FilterOp::Lte),
            ("~", FilterOp::Contains),
            ("=", FilterOp::Eq),
        ];
        let (column, op, raw) = ops
            .iter()
            .find_map(|(token, op)| {
                expr.split_once(token)
                    .map(|(column, value)| (column.trim(), *op, value.trim()))
            })?;
        if column.is_empty() {
            return None;
        }
        let value = if let Ok(v) = raw.parse::<i64>() {
            FieldValue::Integer(v)
        } else if let Ok(v) = raw.parse::<f64>() {
            FieldValue::Float(v)
        } else {
            FieldValue::Text(raw.to_string())
        };
        Some(Self::new(column, op, value))
    }

    /// The filter value read as the column's type. Text against a timestamp
    /// column is parsed, matching the `::timestamptz` cast on Postgres.
    fn value_for(&self, actual: &FieldValue) -> Cow<'_, FieldValue> {
        match (actual, &self.value) {
            (FieldValue::Timestamp(_), FieldValue::Text(text)) => FieldValue::parse_timestamp(text)
                .map(|ts| Cow::Owned(FieldValue::Timestamp(ts)))
                .unwrap_or(Cow::Borrowed(&self.value)),
            _ => Cow::Borrowed(&self.value),
        }
    }

    pub fn matches(&self, row: &RelationalRow) -> bool {
        let Some(actual) = row.column(&self.column) else {
            return false;
        };
        let expected = self.value_for(actual);
        match self.op {
            FilterOp::Eq => match (actual, &*expected) {
                (FieldValue::Text(a), FieldValue::Text(b)) => a.eq_ignore_ascii_case(b),
                (FieldValue::List(items), FieldValue::Text(b)) => {
                    items.iter().any(|i| i.eq_ignore_ascii_case(b))
                }
                (_, expected) => actual.compare(expected) == Some(std::cmp::Ordering::Equal),
            },
            FilterOp::Gte => actual
                .compare(&expected)
                .is_some_and(|o| o != std::cmp::Ordering::Less),
            FilterOp::Lte => actual
                .compare(&expected)
                .is_some_and(|o| o != std::cmp::Ordering::Greater),
            FilterOp::Contains => {
                let needle = self.value.to_string().to_ascii_lowercase();
                match actual {
                    FieldValue::List(items) => items
                        .iter()
                        .any(|i| i.to_ascii_lowercase().contains(&needle)),
                    other => other.to_string().to_ascii_lowercase().contains(&needle),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn row(columns: &[(&str, FieldValue)]) -> RelationalRow {
        RelationalRow {
            entity_key: EntityKey::new("london-property", &["1 high st".into(), "E14AA".into()]),
            source_id: "london-property".into(),
            version: 1,
            columns: columns
                .iter()
                .map(|(k, v)| (k.to_string(), Some(v.clone())))
                .collect(),
        }
    }

    #[test]
    fn entity_key_is_namespaced_by_source() {
        let key = EntityKey::new("carbon-intensity", &["13".into(), "2026-10-18T12:00:00Z".into()]);
        assert_eq!(key.as_str(), "carbon-intensity:13|2026-10-18T12:00:00Z");
        assert_eq!(key.source_id(), "carbon-intensity");
    }

    #[test]
    fn filter_parse_infers_value_types() {
        let f = RowFilter::parse("price>=250000").unwrap();
        assert_eq!(f.op, FilterOp::Gte);
        assert_eq!(f.value, FieldValue::Integer(250000));

        let f = RowFilter::parse("postcode~E1").unwrap();
        assert_eq!(f.op, FilterOp::Contains);
        assert_eq!(f.value, FieldValue::Text("E1".into()));

        assert!(RowFilter::parse("=5").is_none());
        assert!(RowFilter::parse("price").is_none());
    }

    #[test]
    fn range_filters_are_inclusive() {
        let r = row(&[("price", FieldValue::Integer(300_000))]);
        assert!(RowFilter::new("price", FilterOp::Gte, FieldValue::Integer(300_000)).matches(&r));
        assert!(RowFilter::new("price", FilterOp::Lte, FieldValue::Float(300_000.0)).matches(&r));
        assert!(!RowFilter::new("price", FilterOp::Gte, FieldValue::Integer(300_001)).matches(&r));
        assert!(!RowFilter::new("bedrooms", FilterOp::Eq, FieldValue::Integer(2)).matches(&r));
    }

    #[test]
    fn text_filters_on_timestamp_columns_compare_as_instants() {
        let at = |h: u32| Utc.with_ymd_and_hms(2026, 10, 18, h, 0, 0).single().unwrap();
        let early = row(&[("from", FieldValue::Timestamp(at(12)))]);
        let late = row(&[("from", FieldValue::Timestamp(at(13)))]);

        let f = RowFilter::parse("from>=2026-10-18T12:30:00Z").unwrap();
        assert_eq!(f.value, FieldValue::Text("2026-10-18T12:30:00Z".into()));
        assert!(!f.matches(&early));
        assert!(f.matches(&late));

        let exact = RowFilter::parse("from=2026-10-18T13:00Z").unwrap();
        assert!(exact.matches(&late));
        assert!(RowFilter::parse("from<=2026-10-18").unwrap().matches(&row(&[(
            "from",
            FieldValue::Timestamp(Utc.with_ymd_and_hms(2026, 10, 17, 23, 30, 0).single().unwrap())
        )])));
        assert!(!RowFilter::parse("from>=not a time").unwrap().matches(&late));
    }

    #[test]
    fn contains_is_case_insensitive_and_searches_lists() {
        let r = row(&[
            ("address", FieldValue::Text("12 Brick Lane, London".into())),
            ("tags", FieldValue::List(vec!["Garden".into(), "Chain free".into()])),
        ]);
        assert!(RowFilter::new("address", FilterOp::Contains, FieldValue::Text("brick".into())).matches(&r));
        assert!(RowFilter::parse("tags=garden").unwrap().matches(&r));
        assert!(!RowFilter::parse("tags=chain").unwrap().matches(&r));
        assert!(RowFilter::new("tags", FilterOp::Contains, FieldValue::Text("chain".into())).matches(&r));
    }
}
