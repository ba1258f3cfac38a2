use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::RwLock;

use async_trait::async_trait;
use hub_core::{CanonicalDocument, ColumnSpec, EntityKey, RelationalRow, RowFilter};
use thiserror::Error;
use tokio::fs;

use crate::{write_atomically, ArtifactStore};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("{sink} unavailable: {reason}")]
    Unavailable { sink: &'static str, reason: String },
    #[error("unknown column {column} for source {source_id}")]
    UnknownColumn { source_id: String, column: String },
    #[error("source {0} has no prepared table")]
    Unprepared(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Structured, queryable side of the dual write.
#[async_trait]
pub trait RelationalSink: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether rows survive a process restart.
    fn is_persistent(&self) -> bool;

    async fn prepare(&self, source_id: &str, columns: &[ColumnSpec]) -> Result<(), SinkError>;

    /// Insert or replace the row for `row.entity_key`; an older version never replaces a newer one.
    async fn upsert_row(&self, row: &RelationalRow) -> Result<(), SinkError>;

    async fn query_rows(
        &self,
        source_id: &str,
        filters: &[RowFilter],
    ) -> Result<Vec<RelationalRow>, SinkError>;
}

/// Flexible-payload side of the dual write.
#[async_trait]
pub trait DocumentSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn put_document(&self, document: &CanonicalDocument) -> Result<(), SinkError>;

    async fn get_document(&self, key: &EntityKey) -> Result<Option<CanonicalDocument>, SinkError>;

    async fn list_documents(&self, source_id: &str) -> Result<Vec<CanonicalDocument>, SinkError>;
}

#[derive(Debug, Default)]
pub struct MemoryRelationalSink {
    tables: RwLock<HashMap<String, BTreeMap<EntityKey, RelationalRow>>>,
}

impl MemoryRelationalSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn row(&self, key: &EntityKey) -> Option<RelationalRow> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        tables.get(key.source_id()).and_then(|t| t.get(key)).cloned()
    }

    pub fn len(&self, source_id: &str) -> usize {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        tables.get(source_id).map(BTreeMap::len).unwrap_or(0)
    }
}

#[async_trait]
impl RelationalSink for MemoryRelationalSink {
    fn name(&self) -> &'static str {
        "memory-relational"
    }

    fn is_persistent(&self) -> bool {
        false
    }

    async fn prepare(&self, source_id: &str, _columns: &[ColumnSpec]) -> Result<(), SinkError> {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        tables.entry(source_id.to_string()).or_default();
        Ok(())
    }

    async fn upsert_row(&self, row: &RelationalRow) -> Result<(), SinkError> {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        let table = tables
            .get_mut(&row.source_id)
            .ok_or_else(|| SinkError::Unprepared(row.source_id.clone()))?;
        match table.get(&row.entity_key) {
            Some(existing) if existing.version > row.version => {}
            _ => {
                table.insert(row.entity_key.clone(), row.clone());
            }
        }
        Ok(())
    }

    async fn query_rows(
        &self,
        source_id: &str,
        filters: &[RowFilter],
    ) -> Result<Vec<RelationalRow>, SinkError> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        let Some(table) = tables.get(source_id) else {
            return Ok(Vec::new());
        };
        Ok(table
            .values()
            .filter(|row| filters.iter().all(|f| f.matches(row)))
            .cloned()
            .collect())
    }
}

#[derive(Debug, Default)]
pub struct MemoryDocumentSink {
    documents: RwLock<BTreeMap<EntityKey, CanonicalDocument>>,
}

impl MemoryDocumentSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentSink for MemoryDocumentSink {
    fn name(&self) -> &'static str {
        "memory-document"
    }

    async fn put_document(&self, document: &CanonicalDocument) -> Result<(), SinkError> {
        let mut documents = self.documents.write().unwrap_or_else(|e| e.into_inner());
        match documents.get(&document.entity_key) {
            Some(existing) if existing.version > document.version => {}
            _ => {
                documents.insert(document.entity_key.clone(), document.clone());
            }
        }
        Ok(())
    }

    async fn get_document(&self, key: &EntityKey) -> Result<Option<CanonicalDocument>, SinkError> {
        let documents = self.documents.read().unwrap_or_else(|e| e.into_inner());
        Ok(documents.get(key).cloned())
    }

    async fn list_documents(&self, source_id: &str) -> Result<Vec<CanonicalDocument>, SinkError> {
        let documents = self.documents.read().unwrap_or_else(|e| e.into_inner());
        Ok(documents
            .values()
            .filter(|d| d.source_id == source_id)
            .cloned()
            .collect())
    }
}

/// One JSON file per entity under `<root>/<source_id>/<sha256(key)>.json`.
#[derive(Debug, Clone)]
pub struct FsDocumentStore {
    root: PathBuf,
}

impl FsDocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn document_path(&self, key: &EntityKey) -> PathBuf {
        self.root
            .join(key.source_id())
            .join(format!("{}.json", ArtifactStore::sha256_hex(key.as_str().as_bytes())))
    }
}

#[async_trait]
impl DocumentSink for FsDocumentStore {
    fn name(&self) -> &'static str {
        "fs-document"
    }

    async fn put_document(&self, document: &CanonicalDocument) -> Result<(), SinkError> {
        let bytes = serde_json::to_vec_pretty(document)?;
        write_atomically(&self.document_path(&document.entity_key), &bytes).await?;
        Ok(())
    }

    async fn get_document(&self, key: &EntityKey) -> Result<Option<CanonicalDocument>, SinkError> {
        let path = self.document_path(key);
        if !fs::try_exists(&path).await? {
            return Ok(None);
        }
        let bytes = fs::read(&path).await?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    async fn list_documents(&self, source_id: &str) -> Result<Vec<CanonicalDocument>, SinkError> {
        let dir = self.root.join(source_id);
        if !fs::try_exists(&dir).await? {
            return Ok(Vec::new());
        }
        let mut entries = fs::read_dir(&dir).await?;
        let mut documents = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path).await?;
            documents.push(serde_json::from_slice::<CanonicalDocument>(&bytes)?);
        }
        documents.sort_by(|a, b| a.entity_key.cmp(&b.entity_key));
        Ok(documents)
    }
}
