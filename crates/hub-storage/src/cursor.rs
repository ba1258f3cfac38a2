use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use anyhow::Context;
use async_trait::async_trait;
use hub_core::Cursor;
use tokio::fs;

use crate::write_atomically;

/// Durable resume points, one per source.
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn load(&self, source_id: &str) -> anyhow::Result<Option<Cursor>>;

    async fn save(&self, source_id: &str, cursor: Cursor) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    cursors: RwLock<HashMap<String, Cursor>>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn load(&self, source_id: &str) -> anyhow::Result<Option<Cursor>> {
        let cursors = self.cursors.read().unwrap_or_else(|e| e.into_inner());
        Ok(cursors.get(source_id).copied())
    }

    async fn save(&self, source_id: &str, cursor: Cursor) -> anyhow::Result<()> {
        let mut cursors = self.cursors.write().unwrap_or_else(|e| e.into_inner());
        cursors.insert(source_id.to_string(), cursor);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct FsCursorStore {
    root: PathBuf,
}

impl FsCursorStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, source_id: &str) -> PathBuf {
        self.root.join(format!("{source_id}.cursor.json"))
    }
}

#[async_trait]
impl CursorStore for FsCursorStore {
    async fn load(&self, source_id: &str) -> anyhow::Result<Option<Cursor>> {
        let path = self.path(source_id);
        if !fs::try_exists(&path).await? {
            return Ok(None);
        }
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("reading cursor {}", path.display()))?;
        let cursor = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing cursor {}", path.display()))?;
        Ok(Some(cursor))
    }

    async fn save(&self, source_id: &str, cursor: Cursor) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(&cursor)?;
        write_atomically(&self.path(source_id), &bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn fs_cursor_survives_a_new_store_instance() {
        let dir = tempdir().expect("tempdir");
        let cursor = Cursor::start().advance(2, 7);

        FsCursorStore::new(dir.path())
            .save("carbon-intensity", cursor)
            .await
            .expect("save");
        let reopened = FsCursorStore::new(dir.path());
        assert_eq!(reopened.load("carbon-intensity").await.unwrap(), Some(cursor));
        assert_eq!(reopened.load("london-property").await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_cursor_overwrites_previous_value() {
        let store = MemoryCursorStore::new();
        store.save("s", Cursor::start()).await.unwrap();
        store.save("s", Cursor::start().next_pass()).await.unwrap();
        assert_eq!(store.load("s").await.unwrap().map(|c| c.pass), Some(1));
    }
}
