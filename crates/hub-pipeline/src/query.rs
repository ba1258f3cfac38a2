use std::cmp::Ordering;

use hub_core::{CanonicalDocument, CanonicalRecord, FieldValue, HubError, RelationalRow, RowFilter};
use hub_storage::RelationalSink;
use serde::{Deserialize, Serialize};

use crate::merge::CanonicalStore;
use crate::schema::DomainSchema;

pub const DEFAULT_QUERY_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Projection {
    #[default]
    Relational,
    Document,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordQuery {
    pub source_id: String,
    #[serde(default)]
    pub filters: Vec<RowFilter>,
    #[serde(default)]
    pub projection: Projection,
    /// Also return records one of whose sinks lags behind.
    #[serde(default)]
    pub include_partial: bool,
    #[serde(default)]
    pub offset: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    DEFAULT_QUERY_LIMIT
}

impl RecordQuery {
    pub fn new(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            filters: Vec::new(),
            projection: Projection::Relational,
            include_partial: false,
            offset: 0,
            limit: DEFAULT_QUERY_LIMIT,
        }
    }

    pub fn filter(mut self, filter: RowFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn projection(mut self, projection: Projection) -> Self {
        self.projection = projection;
        self
    }

    pub fn include_partial(mut self, include: bool) -> Self {
        self.include_partial = include;
        self
    }

    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = limit;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "projection", rename_all = "snake_case")]
pub enum ProjectedRecord {
    Relational(RelationalRow),
    Document(CanonicalDocument),
}

impl ProjectedRecord {
    pub fn entity_key(&self) -> &hub_core::EntityKey {
        match self {
            ProjectedRecord::Relational(row) => &row.entity_key,
            ProjectedRecord::Document(doc) => &doc.entity_key,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub records: Vec<ProjectedRecord>,
    /// Matches before paging.
    pub total: usize,
    pub excluded_partial: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnSummary {
    pub column: String,
    pub count: usize,
    pub min: Option<FieldValue>,
    pub max: Option<FieldValue>,
    pub mean: Option<f64>,
}

/// A row is fully committed when its canonical record is committed at exactly
/// the row's version; anything else means one sink still lags.
pub fn is_fully_committed(row: &RelationalRow, record: Option<&CanonicalRecord>) -> bool {
    record.is_some_and(|r| r.write_state.is_committed() && r.document.version == row.version)
}

pub(crate) fn check_columns(schema: &DomainSchema, query: &RecordQuery) -> Result<(), HubError> {
    for filter in &query.filters {
        if schema.column(&filter.column).is_none() {
            return Err(HubError::InvalidQuery(format!(
                "unknown column {} for source {}",
                filter.column, query.source_id
            )));
        }
    }
    if query.limit == 0 {
        return Err(HubError::InvalidQuery("limit must be positive".to_string()));
    }
    Ok(())
}

/// Matching rows paired with their canonical record, ordered by entity key.
pub(crate) async fn matching_rows(
    relational: &dyn RelationalSink,
    store: &CanonicalStore,
    schema: &DomainSchema,
    source_id: &str,
    filters: &[RowFilter],
) -> Result<Vec<(RelationalRow, Option<CanonicalRecord>)>, HubError> {
    store
        .hydrate_source(source_id, &schema.columns)
        .await
        .map_err(|e| HubError::Storage(e.to_string()))?;
    let mut rows = relational
        .query_rows(source_id, filters)
        .await
        .map_err(|e| HubError::Storage(e.to_string()))?;
    rows.sort_by(|a, b| a.entity_key.cmp(&b.entity_key));
    Ok(rows
        .into_iter()
        .map(|row| {
            let record = store.get(&row.entity_key);
            (row, record)
        })
        .collect())
}

pub(crate) async fn execute(
    relational: &dyn RelationalSink,
    store: &CanonicalStore,
    schema: &DomainSchema,
    query: &RecordQuery,
) -> Result<QueryResult, HubError> {
    check_columns(schema, query)?;
    let rows = matching_rows(relational, store, schema, &query.source_id, &query.filters).await?;

    let mut excluded_partial = 0;
    let mut matched = Vec::with_capacity(rows.len());
    for (row, record) in rows {
        if !query.include_partial && !is_fully_committed(&row, record.as_ref()) {
            excluded_partial += 1;
            continue;
        }
        matched.push((row, record));
    }
    let total = matched.len();

    let records = matched
        .into_iter()
        .skip(query.offset)
        .take(query.limit)
        .filter_map(|(row, record)| match query.projection {
            Projection::Relational => Some(ProjectedRecord::Relational(row)),
            Projection::Document => record.map(|r| ProjectedRecord::Document(r.document)),
        })
        .collect();

    Ok(QueryResult {
        records,
        total,
        excluded_partial,
    })
}

pub fn summarize_rows(column: &str, rows: &[RelationalRow]) -> ColumnSummary {
    let values: Vec<&FieldValue> = rows.iter().filter_map(|r| r.column(column)).collect();
    let pick = |wanted: Ordering| {
        values
            .iter()
            .copied()
            .reduce(|best, v| if v.compare(best) == Some(wanted) { v } else { best })
            .cloned()
    };
    let numbers: Vec<f64> = values.iter().filter_map(|v| v.as_f64()).collect();
    let mean = (!numbers.is_empty()).then(|| numbers.iter().sum::<f64>() / numbers.len() as f64);

    ColumnSummary {
        column: column.to_string(),
        count: values.len(),
        min: pick(Ordering::Less),
        max: pick(Ordering::Greater),
        mean,
    }
}

/// Sorted distinct values of a column. List columns contribute their items.
pub fn distinct_values(column: &str, rows: &[RelationalRow]) -> Vec<FieldValue> {
    let mut values: Vec<FieldValue> = rows
        .iter()
        .filter_map(|r| r.column(column))
        .flat_map(|v| match v {
            FieldValue::List(items) => items.iter().cloned().map(FieldValue::Text).collect(),
            other => vec![other.clone()],
        })
        .collect();
    values.sort_by(distinct_order);
    values.dedup_by(|a, b| a.compare(b) == Some(Ordering::Equal));
    values
}

/// Total order for mixed kinds: numbers, then text, then timestamps.
fn distinct_order(a: &FieldValue, b: &FieldValue) -> Ordering {
    fn rank(v: &FieldValue) -> u8 {
        match v {
            FieldValue::Integer(_) | FieldValue::Float(_) => 0,
            FieldValue::Text(_) => 1,
            FieldValue::Timestamp(_) => 2,
            FieldValue::List(_) => 3,
        }
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        _ => rank(a)
            .cmp(&rank(b))
            .then_with(|| a.compare(b).unwrap_or(Ordering::Equal)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_core::{EntityKey, SourceDomain, WriteState};

    fn row(n: u64, fields: &[(&str, FieldValue)]) -> RelationalRow {
        RelationalRow {
            entity_key: EntityKey::new("carbon-intensity", &[n.to_string()]),
            source_id: "carbon-intensity".into(),
            version: 1,
            columns: fields
                .iter()
                .map(|(k, v)| (k.to_string(), Some(v.clone())))
                .collect(),
        }
    }

    #[test]
    fn summary_covers_present_values_only() {
        let rows = vec![
            row(1, &[("intensity_forecast", FieldValue::Integer(143))]),
            row(2, &[("intensity_forecast", FieldValue::Integer(0))]),
            row(3, &[]),
            row(4, &[("intensity_forecast", FieldValue::Integer(211))]),
        ];
        let summary = summarize_rows("intensity_forecast", &rows);
        assert_eq!(summary.count, 3);
        assert_eq!(summary.min, Some(FieldValue::Integer(0)));
        assert_eq!(summary.max, Some(FieldValue::Integer(211)));
        assert_eq!(summary.mean, Some(118.0));

        let empty = summarize_rows("intensity_actual", &rows);
        assert_eq!(empty.count, 0);
        assert!(empty.mean.is_none() && empty.min.is_none());
    }

    #[test]
    fn distinct_values_are_sorted_and_unique() {
        let rows = vec![
            row(1, &[("shortname", FieldValue::Text("London".into()))]),
            row(2, &[("shortname", FieldValue::Text("East England".into()))]),
            row(3, &[("shortname", FieldValue::Text("London".into()))]),
        ];
        assert_eq!(
            distinct_values("shortname", &rows),
            vec![
                FieldValue::Text("East England".into()),
                FieldValue::Text("London".into())
            ]
        );
    }

    #[test]
    fn distinct_merges_equal_numbers_and_orders_mixed_kinds() {
        let rows = vec![
            row(1, &[("v", FieldValue::Text("b".into()))]),
            row(2, &[("v", FieldValue::Float(1.0))]),
            row(3, &[("v", FieldValue::Integer(2))]),
            row(4, &[("v", FieldValue::Text("a".into()))]),
            row(5, &[("v", FieldValue::Integer(1))]),
            row(6, &[("v", FieldValue::Float(1.5))]),
        ];
        let distinct = distinct_values("v", &rows);
        assert_eq!(distinct.len(), 5);
        assert_eq!(distinct[0].as_f64(), Some(1.0));
        assert_eq!(
            distinct[1..],
            [
                FieldValue::Float(1.5),
                FieldValue::Integer(2),
                FieldValue::Text("a".into()),
                FieldValue::Text("b".into()),
            ]
        );
    }

    #[test]
    fn distinct_over_a_list_column_yields_items() {
        let rows = vec![
            row(1, &[("postcodes", FieldValue::List(vec!["E1".into(), "N1".into()]))]),
            row(2, &[("postcodes", FieldValue::List(vec!["EC1".into(), "N1".into()]))]),
        ];
        assert_eq!(
            distinct_values("postcodes", &rows),
            vec![
                FieldValue::Text("E1".into()),
                FieldValue::Text("EC1".into()),
                FieldValue::Text("N1".into()),
            ]
        );
    }

    #[test]
    fn partial_or_lagging_rows_are_not_fully_committed() {
        let r = row(1, &[]);
        assert!(!is_fully_committed(&r, None));

        let document = hub_core::CanonicalDocument {
            entity_key: r.entity_key.clone(),
            source_id: r.source_id.clone(),
            version: 1,
            identity: Default::default(),
            payload: Default::default(),
            provenance: Default::default(),
            validation: hub_core::ValidationStatus::Accepted,
            current_sequence: 1,
            last_seen_sequence: 1,
            history: Vec::new(),
            first_seen_at: chrono::DateTime::<chrono::Utc>::default(),
            updated_at: chrono::DateTime::<chrono::Utc>::default(),
        };
        let mut record = CanonicalRecord::from_document(document, &[]);
        assert!(is_fully_committed(&r, Some(&record)));

        record.write_state = WriteState::PartiallyWritten {
            pending: vec![hub_core::SinkKind::Document],
        };
        assert!(!is_fully_committed(&r, Some(&record)));

        record.write_state = WriteState::Committed;
        record.document.version = 2;
        assert!(!is_fully_committed(&r, Some(&record)));
    }

    #[test]
    fn unknown_filter_columns_are_refused() {
        let schema = DomainSchema::for_domain(SourceDomain::CarbonIntensity);
        let query = RecordQuery::new("carbon-intensity")
            .filter(RowFilter::parse("colour=blue").unwrap());
        assert!(matches!(
            check_columns(&schema, &query),
            Err(HubError::InvalidQuery(_))
        ));
        let ok = RecordQuery::new("carbon-intensity")
            .filter(RowFilter::parse("intensity_forecast>=100").unwrap());
        assert!(check_columns(&schema, &ok).is_ok());
    }
}
