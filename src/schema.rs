//! Schema discovery: walks `INFO FOR ROOT` → `INFO FOR NS` → `INFO FOR DB`
//! and produces the table list that feeds the table cache.

use futures::future::join_all;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::domain::{TableIdentifier, TableInfo};
use crate::driver::{escape_ident, query_one};
use crate::error::{ExporterError, Result};
use crate::pool::SessionPool;

/// Everything found in one discovery pass, ordered by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaSnapshot {
    pub namespaces: BTreeMap<String, BTreeMap<String, Vec<TableInfo>>>,
}

impl SchemaSnapshot {
    pub fn tables(&self) -> Vec<TableInfo> {
        self.namespaces
            .values()
            .flat_map(|dbs| dbs.values().flatten().cloned())
            .collect()
    }

    pub fn database_count(&self) -> usize {
        self.namespaces.values().map(|dbs| dbs.len()).sum()
    }
}

pub struct SchemaReader {
    pool: Arc<dyn SessionPool>,
    timeout: Duration,
}

impl SchemaReader {
    pub fn new(pool: Arc<dyn SessionPool>, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    /// Walk every namespace and database in parallel.
    ///
    /// Failing to list namespaces is an error; a namespace or database that
    /// cannot be read is logged and left out.
    pub async fn discover(&self) -> Result<SchemaSnapshot> {
        let namespaces = self.with_timeout(self.namespaces()).await?;

        let databases = join_all(
            namespaces
                .iter()
                .map(|ns| async move { (ns, self.with_timeout(self.databases(ns)).await) }),
        )
        .await;

        let mut pairs = Vec::new();
        let mut snapshot = SchemaSnapshot::default();
        for (ns, result) in databases {
            match result {
                Ok(dbs) => {
                    snapshot.namespaces.insert(ns.clone(), BTreeMap::new());
                    pairs.extend(dbs.into_iter().map(|db| (ns.clone(), db)));
                }
                Err(e) => warn!(namespace = %ns, error = %e, "Failed to read namespace info"),
            }
        }

        let tables = join_all(
            pairs
                .iter()
                .map(|(ns, db)| async move { self.with_timeout(self.tables(ns, db)).await }),
        )
        .await;

        for ((ns, db), result) in pairs.into_iter().zip(tables) {
            match result {
                Ok(tables) => {
                    snapshot.namespaces.entry(ns).or_default().insert(db, tables);
                }
                Err(e) => warn!(namespace = %ns, database = %db, error = %e, "Failed to read database info"),
            }
        }

        debug!(
            namespaces = snapshot.namespaces.len(),
            databases = snapshot.database_count(),
            "Schema discovery complete"
        );
        Ok(snapshot)
    }

    /// Count the records of each table in parallel. Failed tables are skipped.
    pub async fn record_counts(&self, tables: &[TableIdentifier]) -> Vec<(TableIdentifier, u64)> {
        let counts = join_all(
            tables
                .iter()
                .map(|table| async move { self.with_timeout(self.record_count(table)).await }),
        )
        .await;

        tables
            .iter()
            .zip(counts)
            .filter_map(|(table, result)| match result {
                Ok(count) => Some((table.clone(), count)),
                Err(e) => {
                    warn!(table = %table, error = %e, "Failed to count records");
                    None
                }
            })
            .collect()
    }

    async fn namespaces(&self) -> Result<Vec<String>> {
        let session = self.pool.get("", "").await?;
        let info = query_one(&*session, "INFO FOR ROOT").await?;
        Ok(section_keys(&info, "namespaces"))
    }

    async fn databases(&self, namespace: &str) -> Result<Vec<String>> {
        let mut session = self.pool.get("", "").await?;
        let statement = format!("USE NS {}; INFO FOR NS;", escape_ident(namespace));
        let results = session.query(&statement).await;
        session.invalidate_scope();

        let info = results?
            .pop()
            .ok_or_else(|| ExporterError::Protocol(format!("no result for: {}", statement)))?
            .into_result(&statement)?;
        Ok(section_keys(&info, "databases"))
    }

    async fn tables(&self, namespace: &str, database: &str) -> Result<Vec<TableInfo>> {
        let session = self.pool.get(namespace, database).await?;
        let info = query_one(&*session, "INFO FOR DB").await?;

        let tables = match info.get("tables") {
            Some(Value::Object(tables)) => tables
                .iter()
                .map(|(name, definition)| TableInfo {
                    id: TableIdentifier::new(namespace, database, name.as_str()),
                    definition: definition.as_str().unwrap_or_default().to_string(),
                })
                .collect(),
            _ => Vec::new(),
        };
        Ok(tables)
    }

    async fn record_count(&self, table: &TableIdentifier) -> Result<u64> {
        let session = self.pool.get(&table.namespace, &table.database).await?;
        let statement = format!("SELECT count() FROM {} GROUP ALL", escape_ident(&table.table));
        let rows = query_one(&*session, &statement).await?;

        // An empty table returns no rows at all
        Ok(rows
            .get(0)
            .and_then(|row| row.get("count"))
            .and_then(Value::as_u64)
            .unwrap_or(0))
    }

    async fn with_timeout<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| ExporterError::Timeout(self.timeout))?
    }
}

/// Sorted keys of an `INFO FOR ...` section such as `namespaces` or `databases`.
fn section_keys(info: &Value, section: &str) -> Vec<String> {
    let mut keys: Vec<String> = info
        .get(section)
        .and_then(Value::as_object)
        .map(|m| m.keys().cloned().collect())
        .unwrap_or_default();
    keys.sort();
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::fake::FakeDb;
    use crate::pool::{build_pool, PoolingDiscipline};
    use serde_json::json;

    fn reader(db: &Arc<FakeDb>, discipline: PoolingDiscipline) -> SchemaReader {
        SchemaReader::new(build_pool(discipline, db.connector()), Duration::from_secs(1))
    }

    fn seed(db: &FakeDb) {
        db.respond(
            "INFO FOR ROOT",
            Ok(json!({"namespaces": {"shop": "DEFINE NAMESPACE shop", "crm": "DEFINE NAMESPACE crm"}, "users": {}})),
        );
        db.respond("USE NS shop", Ok(json!({"databases": {"main": "DEFINE DATABASE main"}})));
        db.respond("USE NS crm", Ok(json!({"databases": {}})));
        db.respond(
            "INFO FOR DB",
            Ok(json!({"tables": {
                "orders": "DEFINE TABLE orders TYPE NORMAL SCHEMALESS",
                "users": "DEFINE TABLE users TYPE NORMAL SCHEMALESS"
            }})),
        );
    }

    #[tokio::test]
    async fn test_discover_walks_hierarchy() {
        let db = FakeDb::new();
        seed(&db);

        let snapshot = reader(&db, PoolingDiscipline::Multi).discover().await.unwrap();

        assert_eq!(snapshot.namespaces.len(), 2);
        assert!(snapshot.namespaces["crm"].is_empty());
        assert_eq!(snapshot.database_count(), 1);

        let keys: Vec<String> = snapshot.tables().iter().map(|t| t.id.key()).collect();
        assert_eq!(keys, vec!["shop:main:orders", "shop:main:users"]);
        assert!(snapshot.tables()[0].definition.starts_with("DEFINE TABLE orders"));
        assert_eq!(db.uses(), vec![("shop".to_string(), "main".to_string())]);
    }

    #[tokio::test]
    async fn test_discover_single_session_rescopes_after_namespace_info() {
        let db = FakeDb::new();
        seed(&db);

        let snapshot = reader(&db, PoolingDiscipline::Single).discover().await.unwrap();
        assert_eq!(snapshot.tables().len(), 2);
        assert_eq!(db.connect_count(), 1);
        assert_eq!(db.uses().last(), Some(&("shop".to_string(), "main".to_string())));
    }

    #[tokio::test]
    async fn test_discover_fails_without_root_info() {
        let db = FakeDb::new();
        db.respond("INFO FOR ROOT", Err("IAM error: Not enough permissions".to_string()));

        assert!(reader(&db, PoolingDiscipline::Multi).discover().await.is_err());
    }

    #[tokio::test]
    async fn test_discover_skips_unreadable_namespace() {
        let db = FakeDb::new();
        seed(&db);
        db.respond("USE NS crm", Err("denied".to_string()));

        let snapshot = reader(&db, PoolingDiscipline::Multi).discover().await.unwrap();
        assert!(!snapshot.namespaces.contains_key("crm"));
        assert_eq!(snapshot.tables().len(), 2);
    }

    #[tokio::test]
    async fn test_record_counts() {
        let db = FakeDb::new();
        db.respond("FROM orders GROUP ALL", Ok(json!([{"count": 42}])));
        db.respond("FROM empty GROUP ALL", Ok(json!([])));
        db.respond("FROM broken GROUP ALL", Err("boom".to_string()));

        let tables = vec![
            TableIdentifier::new("ns", "db", "orders"),
            TableIdentifier::new("ns", "db", "empty"),
            TableIdentifier::new("ns", "db", "broken"),
        ];
        let counts = reader(&db, PoolingDiscipline::Multi).record_counts(&tables).await;

        assert_eq!(
            counts,
            vec![
                (TableIdentifier::new("ns", "db", "orders"), 42),
                (TableIdentifier::new("ns", "db", "empty"), 0),
            ]
        );
    }
}
