use std::time::Instant;
use tokio::sync::RwLock;

use crate::domain::TableInfo;

/// Snapshot of the tables known to exist.
///
/// Written by the schema refresh once per scrape, read by both managers.
/// Readers always get their own copy.
#[derive(Debug, Default)]
pub struct TableInfoCache {
    inner: RwLock<CacheEntry>,
}

#[derive(Debug, Default)]
struct CacheEntry {
    tables: Vec<TableInfo>,
    updated_at: Option<Instant>,
}

impl TableInfoCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, tables: Vec<TableInfo>) {
        let mut entry = self.inner.write().await;
        entry.tables = tables;
        entry.updated_at = Some(Instant::now());
    }

    pub async fn get(&self) -> Vec<TableInfo> {
        self.inner.read().await.tables.clone()
    }

    /// When `set` was last called, if ever.
    pub async fn updated_at(&self) -> Option<Instant> {
        self.inner.read().await.updated_at
    }
}
