use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hub_core::{ColumnSpec, EntityKey, FieldValue, FilterOp, RelationalRow, RowFilter, ValueKind};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::info;

use crate::sinks::{RelationalSink, SinkError};

/// One typed table per source (`hub_<source_id>`), keyed by entity key.
#[derive(Debug)]
pub struct PgRelationalSink {
    pool: PgPool,
    columns: RwLock<HashMap<String, Vec<ColumnSpec>>>,
}

impl PgRelationalSink {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            columns: RwLock::new(HashMap::new()),
        }
    }

    pub async fn connect(database_url: &str) -> Result<Self, SinkError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self::new(pool))
    }

    fn columns_for(&self, source_id: &str) -> Result<Vec<ColumnSpec>, SinkError> {
        let columns = self.columns.read().unwrap_or_else(|e| e.into_inner());
        columns
            .get(source_id)
            .cloned()
            .ok_or_else(|| SinkError::Unprepared(source_id.to_string()))
    }
}

pub(crate) fn table_name(source_id: &str) -> String {
    let sanitized: String = source_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("hub_{sanitized}")
}

fn quoted(ident: &str) -> Result<String, SinkError> {
    if ident.is_empty()
        || !ident
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(SinkError::Unavailable {
            sink: "postgres",
            reason: format!("refusing identifier {ident:?}"),
        });
    }
    Ok(format!("\"{ident}\""))
}

fn sql_type(kind: ValueKind) -> &'static str {
    match kind {
        ValueKind::Text => "TEXT",
        ValueKind::Integer => "BIGINT",
        ValueKind::Float => "DOUBLE PRECISION",
        ValueKind::Timestamp => "TIMESTAMPTZ",
        ValueKind::List => "TEXT[]",
    }
}

fn push_value(qb: &mut QueryBuilder<'_, Postgres>, kind: ValueKind, value: Option<&FieldValue>) {
    match kind {
        ValueKind::Text => {
            qb.push_bind(value.and_then(FieldValue::as_text).map(str::to_string));
        }
        ValueKind::Integer => {
            let v = match value {
                Some(FieldValue::Integer(v)) => Some(*v),
                _ => None,
            };
            qb.push_bind(v);
        }
        ValueKind::Float => {
            qb.push_bind(value.and_then(FieldValue::as_f64));
        }
        ValueKind::Timestamp => {
            qb.push_bind(value.and_then(FieldValue::as_timestamp));
        }
        ValueKind::List => {
            let v = match value {
                Some(FieldValue::List(items)) => Some(items.clone()),
                _ => None,
            };
            qb.push_bind(v);
        }
    }
}

fn read_value(row: &PgRow, column: &ColumnSpec) -> Result<Option<FieldValue>, sqlx::Error> {
    let name = column.name.as_str();
    Ok(match column.kind {
        ValueKind::Text => row.try_get::<Option<String>, _>(name)?.map(FieldValue::Text),
        ValueKind::Integer => row.try_get::<Option<i64>, _>(name)?.map(FieldValue::Integer),
        ValueKind::Float => row.try_get::<Option<f64>, _>(name)?.map(FieldValue::Float),
        ValueKind::Timestamp => row
            .try_get::<Option<DateTime<Utc>>, _>(name)?
            .map(FieldValue::Timestamp),
        ValueKind::List => row.try_get::<Option<Vec<String>>, _>(name)?.map(FieldValue::List),
    })
}

fn push_filter(
    qb: &mut QueryBuilder<'_, Postgres>,
    column: &ColumnSpec,
    filter: &RowFilter,
) -> Result<(), SinkError> {
    let ident = quoted(&column.name)?;
    match (filter.op, column.kind) {
        (FilterOp::Contains, ValueKind::List) => {
            qb.push(format!("EXISTS (SELECT 1 FROM unnest({ident}) AS item WHERE item ILIKE "));
            qb.push_bind(format!("%{}%", filter.value));
            qb.push(")");
        }
        (FilterOp::Contains, _) => {
            qb.push(format!("{ident}::text ILIKE "));
            qb.push_bind(format!("%{}%", filter.value));
        }
        (FilterOp::Eq, ValueKind::List) => {
            qb.push(format!("EXISTS (SELECT 1 FROM unnest({ident}) AS item WHERE lower(item) = lower("));
            qb.push_bind(filter.value.to_string());
            qb.push("))");
        }
        (FilterOp::Eq, ValueKind::Text) => {
            qb.push(format!("lower({ident}) = lower("));
            qb.push_bind(filter.value.to_string());
            qb.push(")");
        }
        (op, kind) => {
            let sql_op = match op {
                FilterOp::Gte => " >= ",
                FilterOp::Lte => " <= ",
                _ => " = ",
            };
            qb.push(ident).push(sql_op);
            match (&filter.value, kind) {
                (FieldValue::Timestamp(ts), _) => {
                    qb.push_bind(*ts);
                }
                (FieldValue::Text(text), ValueKind::Timestamp) => {
                    qb.push_bind(text.clone()).push("::timestamptz");
                }
                (FieldValue::Text(text), _) => {
                    qb.push_bind(text.clone());
                }
                (value, _) => {
                    qb.push_bind(value.as_f64());
                }
            }
        }
    }
    Ok(())
}

#[async_trait]
impl RelationalSink for PgRelationalSink {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn is_persistent(&self) -> bool {
        true
    }

    async fn prepare(&self, source_id: &str, columns: &[ColumnSpec]) -> Result<(), SinkError> {
        let table = quoted(&table_name(source_id))?;
        let mut ddl = format!(
            "CREATE TABLE IF NOT EXISTS {table} (entity_key TEXT PRIMARY KEY, version BIGINT NOT NULL"
        );
        for column in columns {
            ddl.push_str(&format!(", {} {}", quoted(&column.name)?, sql_type(column.kind)));
        }
        ddl.push(')');
        sqlx::query(&ddl).execute(&self.pool).await?;
        info!(source_id, table = %table, columns = columns.len(), "relational table ready");

        let mut cache = self.columns.write().unwrap_or_else(|e| e.into_inner());
        cache.insert(source_id.to_string(), columns.to_vec());
        Ok(())
    }

    async fn upsert_row(&self, row: &RelationalRow) -> Result<(), SinkError> {
        let columns = self.columns_for(&row.source_id)?;
        let table = quoted(&table_name(&row.source_id))?;

        let mut qb = QueryBuilder::<Postgres>::new(format!("INSERT INTO {table} (entity_key, version"));
        for column in &columns {
            qb.push(", ").push(quoted(&column.name)?);
        }
        qb.push(") VALUES (");
        qb.push_bind(row.entity_key.as_str().to_string());
        qb.push(", ");
        qb.push_bind(row.version as i64);
        for column in &columns {
            qb.push(", ");
            push_value(&mut qb, column.kind, row.column(&column.name));
        }
        qb.push(") ON CONFLICT (entity_key) DO UPDATE SET version = EXCLUDED.version");
        for column in &columns {
            let ident = quoted(&column.name)?;
            qb.push(format!(", {ident} = EXCLUDED.{ident}"));
        }
        qb.push(format!(" WHERE {table}.version <= EXCLUDED.version"));

        qb.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn query_rows(
        &self,
        source_id: &str,
        filters: &[RowFilter],
    ) -> Result<Vec<RelationalRow>, SinkError> {
        let columns = self.columns_for(source_id)?;
        let by_name: BTreeMap<&str, &ColumnSpec> =
            columns.iter().map(|c| (c.name.as_str(), c)).collect();
        let table = quoted(&table_name(source_id))?;

        let mut qb = QueryBuilder::<Postgres>::new("SELECT entity_key, version");
        for column in &columns {
            qb.push(", ").push(quoted(&column.name)?);
        }
        qb.push(format!(" FROM {table}"));
        for (i, filter) in filters.iter().enumerate() {
            let column = by_name
                .get(filter.column.as_str())
                .ok_or_else(|| SinkError::UnknownColumn {
                    source_id: source_id.to_string(),
                    column: filter.column.clone(),
                })?;
            qb.push(if i == 0 { " WHERE " } else { " AND " });
            push_filter(&mut qb, column, filter)?;
        }
        qb.push(" ORDER BY entity_key");

        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let key: String = row.try_get("entity_key")?;
            let version: i64 = row.try_get("version")?;
            let mut values = BTreeMap::new();
            for column in &columns {
                values.insert(column.name.clone(), read_value(&row, column)?);
            }
            out.push(RelationalRow {
                entity_key: EntityKey::from_raw(key),
                source_id: source_id.to_string(),
                version: version.max(0) as u64,
                columns: values,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_are_sanitized_per_source() {
        assert_eq!(table_name("london-property"), "hub_london_property");
        assert_eq!(table_name("Carbon.Intensity"), "hub_carbon_intensity");
    }

    #[test]
    fn identifiers_outside_the_safe_alphabet_are_refused() {
        assert!(quoted("price").is_ok());
        assert!(quoted("price\"; DROP TABLE x; --").is_err());
        assert!(quoted("").is_err());
    }

    fn where_clause(column: ColumnSpec, expr: &str) -> String {
        let mut qb = QueryBuilder::<Postgres>::new("");
        push_filter(&mut qb, &column, &RowFilter::parse(expr).unwrap()).unwrap();
        qb.sql().to_string()
    }

    #[test]
    fn list_equality_and_text_timestamps_are_typed_in_sql() {
        assert_eq!(
            where_clause(ColumnSpec::new("postcodes", ValueKind::List), "postcodes=e1"),
            "EXISTS (SELECT 1 FROM unnest(\"postcodes\") AS item WHERE lower(item) = lower($1))"
        );
        assert_eq!(
            where_clause(ColumnSpec::new("from", ValueKind::Timestamp), "from>=2026-10-18T12:30:00Z"),
            "\"from\" >= $1::timestamptz"
        );
    }

    #[test]
    fn list_columns_map_to_text_arrays() {
        assert_eq!(sql_type(ValueKind::List), "TEXT[]");
        assert_eq!(sql_type(ValueKind::Timestamp), "TIMESTAMPTZ");
    }
}
