//! Side-table provisioning.
//!
//! Each monitored table gets a companion table (`<prefix><table>`) holding a
//! single `stats` record, plus three events on the monitored table that
//! classify every write and bump the matching counter. Scrapes read the
//! counters back.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::domain::{KindCounts, OperationAction, SideTableCounters, TableIdentifier};
use crate::driver::{escape_ident, query_one};
use crate::error::{ExporterError, Result};
use crate::pool::SessionPool;
use crate::reconcile::ReconcileQueue;

pub const DEFAULT_SIDE_TABLE_PREFIX: &str = "_stats_";

const STATS_RECORD_ID: &str = "stats";
const QUERY_TIMEOUT: Duration = Duration::from_secs(10);
const PROVISION_TIMEOUT: Duration = Duration::from_secs(30);
const REMOVE_TIMEOUT: Duration = Duration::from_secs(10);

const EVENTS: [(&str, OperationAction); 3] = [
    ("stats_create", OperationAction::Create),
    ("stats_update", OperationAction::Update),
    ("stats_delete", OperationAction::Delete),
];

#[derive(Debug, Clone)]
pub struct SideTableSettings {
    pub prefix: String,
    /// Remove events and counters of tables that left the monitored set
    pub remove_orphans: bool,
}

impl Default for SideTableSettings {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_SIDE_TABLE_PREFIX.to_string(),
            remove_orphans: false,
        }
    }
}

#[derive(Debug, Clone)]
struct ProvisionedTable {
    side_table: String,
    table: TableIdentifier,
}

pub struct SideTableManager {
    pool: Arc<dyn SessionPool>,
    settings: SideTableSettings,
    provisioned: Mutex<HashMap<String, ProvisionedTable>>,
    queue: ReconcileQueue,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl SideTableManager {
    pub fn new(pool: Arc<dyn SessionPool>, settings: SideTableSettings) -> Arc<Self> {
        Arc::new(Self {
            pool,
            settings,
            provisioned: Mutex::new(HashMap::new()),
            queue: ReconcileQueue::new(),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    pub fn side_table_name(&self, table: &TableIdentifier) -> String {
        format!("{}{}", self.settings.prefix, table.table)
    }

    /// True for the companion tables this manager creates.
    pub fn is_side_table(&self, table: &TableIdentifier) -> bool {
        table.table.starts_with(&self.settings.prefix)
    }

    /// Read the counters of every desired table in parallel, then schedule
    /// reconciliation. Per-table failures are logged and skipped; an error is
    /// returned only when every query failed.
    pub async fn get_metrics(
        self: &Arc<Self>,
        desired: Vec<TableIdentifier>,
    ) -> Result<Vec<SideTableCounters>> {
        let desired: Vec<TableIdentifier> = desired
            .into_iter()
            .filter(|t| !self.is_side_table(t))
            .collect();

        let results = join_all(desired.iter().map(|table| async move {
            match tokio::time::timeout(QUERY_TIMEOUT, self.query_counters(table)).await {
                Ok(result) => result,
                Err(_) => Err(ExporterError::Timeout(QUERY_TIMEOUT)),
            }
        }))
        .await;

        let mut counters = Vec::new();
        let mut last_error = None;
        let mut failures = 0;
        for (table, result) in desired.iter().zip(results) {
            match result {
                Ok(Some(c)) => counters.push(c),
                Ok(None) => debug!(table = %table, "Side table not provisioned yet"),
                Err(e) => {
                    warn!(table = %table, error = %e, "Failed to query side table");
                    failures += 1;
                    last_error = Some(e);
                }
            }
        }

        let all_failed = !desired.is_empty() && failures == desired.len();
        self.schedule_reconcile(desired).await;

        match last_error {
            Some(e) if all_failed => Err(e),
            _ => Ok(counters),
        }
    }

    /// Tables currently provisioned by this process, as `ns:db:table` keys.
    pub async fn provisioned_tables(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.provisioned.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn stop(&self) {
        info!("Stopping side table manager");
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }

    // ============================================================
    // Reconciliation
    // ============================================================

    async fn schedule_reconcile(self: &Arc<Self>, desired: Vec<TableIdentifier>) {
        if self.shutdown.is_cancelled() || !self.queue.submit(desired).await {
            return;
        }

        let manager = self.clone();
        self.tasks.spawn(async move {
            while let Some(desired) = manager.queue.next().await {
                tokio::select! {
                    _ = manager.shutdown.cancelled() => break,
                    _ = manager.reconcile(desired) => {}
                }
            }
        });
    }

    /// Provision side tables for new desired tables and, when orphan removal
    /// is enabled, remove those of tables no longer desired.
    pub async fn reconcile(&self, desired: Vec<TableIdentifier>) {
        let desired: HashMap<String, TableIdentifier> = desired
            .into_iter()
            .filter(|t| !self.is_side_table(t))
            .map(|t| (t.key(), t))
            .collect();

        let mut provisioned = self.provisioned.lock().await;

        if self.settings.remove_orphans {
            let orphans: Vec<ProvisionedTable> = provisioned
                .iter()
                .filter(|(key, _)| !desired.contains_key(*key))
                .map(|(_, p)| p.clone())
                .collect();

            let removals = join_all(orphans.iter().map(|orphan| async move {
                match tokio::time::timeout(REMOVE_TIMEOUT, self.remove(orphan)).await {
                    Ok(result) => result,
                    Err(_) => Err(ExporterError::Timeout(REMOVE_TIMEOUT)),
                }
            }))
            .await;

            for (orphan, result) in orphans.iter().zip(removals) {
                match result {
                    Ok(()) => {
                        info!(table = %orphan.table, side_table = %orphan.side_table, "Removed orphaned side table");
                        provisioned.remove(&orphan.table.key());
                    }
                    Err(e) => {
                        warn!(table = %orphan.table, error = %e, "Failed to remove orphaned side table");
                    }
                }
            }
        }

        let missing: Vec<&TableIdentifier> = desired
            .iter()
            .filter(|(key, _)| !provisioned.contains_key(*key))
            .map(|(_, t)| t)
            .collect();

        let created = join_all(missing.iter().map(|table| async move {
            match tokio::time::timeout(PROVISION_TIMEOUT, self.provision(table)).await {
                Ok(result) => result,
                Err(_) => Err(ExporterError::Timeout(PROVISION_TIMEOUT)),
            }
        }))
        .await;

        for (table, result) in missing.into_iter().zip(created) {
            match result {
                Ok(side_table) => {
                    info!(table = %table, side_table = %side_table, "Provisioned side table");
                    provisioned.insert(
                        table.key(),
                        ProvisionedTable {
                            side_table,
                            table: table.clone(),
                        },
                    );
                }
                Err(e) => warn!(table = %table, error = %e, "Failed to provision side table"),
            }
        }
    }

    // ============================================================
    // Database operations
    // ============================================================

    /// Create the counter record (if absent) and define the three events.
    /// Safe to call repeatedly.
    pub async fn provision(&self, table: &TableIdentifier) -> Result<String> {
        let side_table = self.side_table_name(table);
        let session = self.pool.get(&table.namespace, &table.database).await?;

        query_one(&*session, &create_record_statement(&side_table, table)).await?;

        for (event, action) in EVENTS {
            let statement = define_event_statement(event, action, &side_table, &table.table);
            match query_one(&*session, &statement).await {
                Ok(_) => {}
                Err(e) if e.is_already_exists() => {
                    debug!(table = %table, event, "Event already defined");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(side_table)
    }

    /// Drop the events from the monitored table, then delete the counters.
    async fn remove(&self, provisioned: &ProvisionedTable) -> Result<()> {
        let table = &provisioned.table;
        let session = self.pool.get(&table.namespace, &table.database).await?;

        for (event, _) in EVENTS {
            let statement = format!("REMOVE EVENT {} ON TABLE {}", event, escape_ident(&table.table));
            if let Err(e) = query_one(&*session, &statement).await {
                warn!(table = %table, event, error = %e, "Failed to remove event");
            }
        }

        query_one(&*session, &format!("DELETE {}", escape_ident(&provisioned.side_table))).await?;
        Ok(())
    }

    async fn query_counters(&self, table: &TableIdentifier) -> Result<Option<SideTableCounters>> {
        let side_table = self.side_table_name(table);
        let statement = format!("SELECT * FROM {} LIMIT 1", escape_ident(&side_table));

        let value = {
            let session = self.pool.get(&table.namespace, &table.database).await?;
            match query_one(&*session, &statement).await {
                Ok(value) => value,
                Err(ExporterError::Query { message, .. }) if message.contains("does not exist") => {
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        };

        let rows: Vec<SideTableRecord> = match value {
            serde_json::Value::Null => Vec::new(),
            other => serde_json::from_value(other)?,
        };
        Ok(rows
            .into_iter()
            .next()
            .map(|row| row.into_counters(table.clone(), side_table)))
    }
}

// ============================================================
// Record mapping
// ============================================================

#[derive(Debug, Deserialize)]
struct SideTableRecord {
    #[serde(default)]
    create_relational: u64,
    #[serde(default)]
    create_kv: u64,
    #[serde(default)]
    create_graph: u64,
    #[serde(default)]
    create_document: u64,
    #[serde(default)]
    update_relational: u64,
    #[serde(default)]
    update_kv: u64,
    #[serde(default)]
    update_graph: u64,
    #[serde(default)]
    update_document: u64,
    #[serde(default)]
    delete_relational: u64,
    #[serde(default)]
    delete_kv: u64,
    #[serde(default)]
    delete_graph: u64,
    #[serde(default)]
    delete_document: u64,
    #[serde(default)]
    last_update: Option<String>,
}

impl SideTableRecord {
    fn into_counters(self, table: TableIdentifier, side_table: String) -> SideTableCounters {
        SideTableCounters {
            table,
            side_table,
            create: KindCounts {
                relational: self.create_relational,
                key_value: self.create_kv,
                graph: self.create_graph,
                document: self.create_document,
            },
            update: KindCounts {
                relational: self.update_relational,
                key_value: self.update_kv,
                graph: self.update_graph,
                document: self.update_document,
            },
            delete: KindCounts {
                relational: self.delete_relational,
                key_value: self.delete_kv,
                graph: self.delete_graph,
                document: self.delete_document,
            },
            last_update: self
                .last_update
                .as_deref()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|d| d.with_timezone(&Utc)),
        }
    }
}

// ============================================================
// SurrealQL
// ============================================================

fn string_literal(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

fn counter_prefix(action: OperationAction) -> &'static str {
    match action {
        OperationAction::Create => "create",
        OperationAction::Update => "update",
        OperationAction::Delete | OperationAction::Unknown => "delete",
    }
}

fn create_record_statement(side_table: &str, table: &TableIdentifier) -> String {
    let record = format!("{}:{}", escape_ident(side_table), STATS_RECORD_ID);
    let counters: Vec<String> = OperationAction::COUNTED
        .iter()
        .flat_map(|action| {
            ["relational", "kv", "graph", "document"]
                .iter()
                .map(move |kind| format!("{}_{} = 0", counter_prefix(*action), kind))
        })
        .collect();

    format!(
        "IF !record::exists({record}) THEN \
         CREATE {record} SET target_namespace = {ns}, target_database = {db}, target_table = {tb}, \
         {counters}, last_update = time::now() END;",
        record = record,
        ns = string_literal(&table.namespace),
        db = string_literal(&table.database),
        tb = string_literal(&table.table),
        counters = counters.join(", "),
    )
}

/// Event that classifies the written record the same way the live-query
/// classifier does (graph, key-value, relational, document) and bumps the
/// matching counter on the side record.
fn define_event_statement(
    event: &str,
    action: OperationAction,
    side_table: &str,
    table: &str,
) -> String {
    let record_var = match action {
        OperationAction::Delete => "$before",
        _ => "$after",
    };
    let prefix = counter_prefix(action);
    let event_name = action.as_str().to_ascii_uppercase();

    format!(
        r#"DEFINE EVENT {event} ON TABLE {table} WHEN $event = "{event_name}" THEN {{
    LET $rec = {record_var};
    LET $fields = $rec.keys().filter(|$k| $k != "id");
    LET $nested = $fields.filter(|$k| type::is::object($rec[$k]) OR type::is::array($rec[$k])).len();
    LET $kind = IF $rec.keys() CONTAINSALL ["in", "out"] THEN "graph"
        ELSE IF $fields.len() > 0 AND $fields.len() <= 2 THEN "kv"
        ELSE IF $fields.len() - $nested >= 3 AND $nested <= 1 THEN "relational"
        ELSE "document" END;
    UPDATE {record} SET
        {prefix}_relational += IF $kind = "relational" THEN 1 ELSE 0 END,
        {prefix}_kv += IF $kind = "kv" THEN 1 ELSE 0 END,
        {prefix}_graph += IF $kind = "graph" THEN 1 ELSE 0 END,
        {prefix}_document += IF $kind = "document" THEN 1 ELSE 0 END,
        last_update = time::now();
}};"#,
        event = event,
        table = escape_ident(table),
        event_name = event_name,
        record_var = record_var,
        record = format!("{}:{}", escape_ident(side_table), STATS_RECORD_ID),
        prefix = prefix,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::fake::FakeDb;
    use crate::pool::{build_pool, PoolingDiscipline};
    use serde_json::json;

    fn id(s: &str) -> TableIdentifier {
        TableIdentifier::parse(s).unwrap()
    }

    const DISCIPLINES: [PoolingDiscipline; 2] = [PoolingDiscipline::Single, PoolingDiscipline::Multi];

    fn manager(db: &Arc<FakeDb>, remove_orphans: bool) -> Arc<SideTableManager> {
        manager_with(db, PoolingDiscipline::Multi, remove_orphans)
    }

    fn manager_with(
        db: &Arc<FakeDb>,
        discipline: PoolingDiscipline,
        remove_orphans: bool,
    ) -> Arc<SideTableManager> {
        let pool = build_pool(discipline, db.connector());
        SideTableManager::new(
            pool,
            SideTableSettings {
                remove_orphans,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_ident_quoting() {
        assert_eq!(escape_ident("orders"), "orders");
        assert_eq!(escape_ident("_stats_orders"), "_stats_orders");
        assert_eq!(escape_ident("order-items"), "`order-items`");
        assert_eq!(escape_ident("1st"), "`1st`");
    }

    #[test]
    fn test_create_statement_is_conditional() {
        let stmt = create_record_statement("_stats_orders", &id("ns1:db1:orders"));
        assert!(stmt.starts_with("IF !record::exists(_stats_orders:stats) THEN CREATE _stats_orders:stats SET"));
        assert!(stmt.contains(r#"target_table = "orders""#));
        assert!(stmt.contains("create_relational = 0"));
        assert!(stmt.contains("delete_document = 0"));
        assert_eq!(stmt.matches(" = 0").count(), 12);
    }

    #[test]
    fn test_delete_event_uses_before_image() {
        let stmt = define_event_statement("stats_delete", OperationAction::Delete, "_stats_orders", "orders");
        assert!(stmt.starts_with(r#"DEFINE EVENT stats_delete ON TABLE orders WHEN $event = "DELETE""#));
        assert!(stmt.contains("LET $rec = $before;"));
        assert!(stmt.contains("UPDATE _stats_orders:stats SET"));
        assert!(stmt.contains("delete_graph += IF"));

        let stmt = define_event_statement("stats_update", OperationAction::Update, "_stats_orders", "orders");
        assert!(stmt.contains("LET $rec = $after;"));
        assert!(stmt.contains("update_kv += IF"));
    }

    #[tokio::test]
    async fn test_provision_issues_create_and_three_events() {
        for discipline in DISCIPLINES {
            let db = FakeDb::new();
            let mgr = manager_with(&db, discipline, false);

            let side = mgr.provision(&id("ns1:db1:orders")).await.unwrap();
            assert_eq!(side, "_stats_orders", "{discipline}");
            assert_eq!(db.statements_matching("IF !record::exists").len(), 1, "{discipline}");
            assert_eq!(db.statements_matching("DEFINE EVENT").len(), 3, "{discipline}");
            assert_eq!(db.uses(), vec![("ns1".to_string(), "db1".to_string())], "{discipline}");
        }
    }

    #[tokio::test]
    async fn test_reconcile_across_scopes_switches_single_session() {
        let db = FakeDb::new();
        let mgr = manager_with(&db, PoolingDiscipline::Single, false);

        mgr.reconcile(vec![id("ns1:db1:a"), id("ns2:db2:b")]).await;

        assert_eq!(mgr.provisioned_tables().await, vec!["ns1:db1:a", "ns2:db2:b"]);
        assert_eq!(db.connect_count(), 1);
        let mut uses = db.uses();
        uses.sort();
        assert_eq!(
            uses,
            vec![
                ("ns1".to_string(), "db1".to_string()),
                ("ns2".to_string(), "db2".to_string()),
            ]
        );
        // Each table's statements run as one uninterrupted block
        let statements = db.statements();
        let first_b = statements.iter().position(|s| s.contains("ON TABLE b")).unwrap();
        let last_b = statements.iter().rposition(|s| s.contains("_stats_b")).unwrap();
        assert!(statements[first_b..=last_b].iter().all(|s| !s.contains("_stats_a")));
    }

    #[tokio::test]
    async fn test_provision_twice_tolerates_existing_events() {
        let db = FakeDb::new();
        let mgr = manager(&db, false);
        let orders = id("ns1:db1:orders");

        mgr.provision(&orders).await.unwrap();
        db.respond("DEFINE EVENT", Err("The event 'stats_create' already exists".to_string()));
        mgr.provision(&orders).await.unwrap();

        // The record create is conditional each time
        assert!(db
            .statements_matching("CREATE _stats_orders:stats")
            .iter()
            .all(|s| s.starts_with("IF !record::exists(_stats_orders:stats)")));
    }

    #[tokio::test]
    async fn test_provision_fails_on_other_errors() {
        let db = FakeDb::new();
        db.respond("DEFINE EVENT", Err("Permission denied".to_string()));
        let mgr = manager(&db, false);

        assert!(mgr.provision(&id("ns:db:t")).await.is_err());
    }

    #[tokio::test]
    async fn test_reconcile_provisions_new_tables_once() {
        let db = FakeDb::new();
        let mgr = manager(&db, false);

        mgr.reconcile(vec![id("ns:db:a"), id("ns:db:b")]).await;
        mgr.reconcile(vec![id("ns:db:a"), id("ns:db:b")]).await;

        assert_eq!(mgr.provisioned_tables().await, vec!["ns:db:a", "ns:db:b"]);
        assert_eq!(db.statements_matching("IF !record::exists").len(), 2);
    }

    #[tokio::test]
    async fn test_reconcile_skips_side_tables() {
        let db = FakeDb::new();
        let mgr = manager(&db, false);

        mgr.reconcile(vec![id("ns:db:a"), id("ns:db:_stats_a")]).await;
        assert_eq!(mgr.provisioned_tables().await, vec!["ns:db:a"]);
    }

    #[tokio::test]
    async fn test_orphans_kept_by_default() {
        let db = FakeDb::new();
        let mgr = manager(&db, false);

        mgr.reconcile(vec![id("ns:db:a")]).await;
        mgr.reconcile(vec![]).await;

        assert!(db.statements_matching("REMOVE EVENT").is_empty());
        assert_eq!(mgr.provisioned_tables().await, vec!["ns:db:a"]);
    }

    #[tokio::test]
    async fn test_orphans_removed_when_enabled() {
        for discipline in DISCIPLINES {
            let db = FakeDb::new();
            let mgr = manager_with(&db, discipline, true);

            mgr.reconcile(vec![id("ns:db:a"), id("ns:db:b")]).await;
            mgr.reconcile(vec![id("ns:db:b")]).await;

            assert_eq!(mgr.provisioned_tables().await, vec!["ns:db:b"], "{discipline}");
            let removes = db.statements_matching("REMOVE EVENT");
            assert_eq!(removes.len(), 3, "{discipline}");
            assert!(removes.iter().all(|s| s.ends_with("ON TABLE a")));

            let statements = db.statements();
            let last_remove = statements.iter().rposition(|s| s.starts_with("REMOVE EVENT")).unwrap();
            let delete = statements.iter().position(|s| s == "DELETE _stats_a").unwrap();
            assert!(delete > last_remove, "events are removed before the counters");
        }
    }

    #[tokio::test]
    async fn test_get_metrics_maps_counters() {
        let db = FakeDb::new();
        db.respond(
            "SELECT * FROM _stats_orders",
            Ok(json!([{
                "id": "_stats_orders:stats",
                "target_table": "orders",
                "create_relational": 5,
                "create_kv": 1,
                "update_document": 2,
                "delete_graph": 3,
                "last_update": "2024-05-01T10:00:00Z"
            }])),
        );
        let mgr = manager(&db, false);

        let counters = mgr
            .get_metrics(vec![id("ns1:db1:orders"), id("ns1:db1:users")])
            .await
            .unwrap();

        // users has no side table yet
        assert_eq!(counters.len(), 1);
        let c = &counters[0];
        assert_eq!(c.table, id("ns1:db1:orders"));
        assert_eq!(c.create.relational, 5);
        assert_eq!(c.create.key_value, 1);
        assert_eq!(c.update.document, 2);
        assert_eq!(c.delete.graph, 3);
        assert_eq!(c.last_update.unwrap().to_rfc3339(), "2024-05-01T10:00:00+00:00");
        mgr.stop().await;
    }

    #[tokio::test]
    async fn test_get_metrics_isolates_failures() {
        for discipline in DISCIPLINES {
            let db = FakeDb::new();
            db.respond("SELECT * FROM _stats_a", Err("boom".to_string()));
            db.respond("SELECT * FROM _stats_b", Ok(json!([{"create_kv": 1}])));
            let mgr = manager_with(&db, discipline, false);

            let counters = mgr
                .get_metrics(vec![id("ns:db:a"), id("ns1:db1:b")])
                .await
                .unwrap();
            assert_eq!(counters.len(), 1, "{discipline}");
            assert_eq!(counters[0].table, id("ns1:db1:b"));
            assert_eq!(counters[0].create.key_value, 1);
            mgr.stop().await;
        }
    }

    #[tokio::test]
    async fn test_get_metrics_total_failure_is_error() {
        let db = FakeDb::new();
        db.respond("SELECT * FROM", Err("boom".to_string()));
        let mgr = manager(&db, false);

        assert!(mgr.get_metrics(vec![id("ns:db:a"), id("ns:db:b")]).await.is_err());
        assert!(mgr.get_metrics(vec![]).await.unwrap().is_empty());
        mgr.stop().await;
    }

    #[tokio::test]
    async fn test_get_metrics_schedules_provisioning() {
        let db = FakeDb::new();
        let mgr = manager(&db, false);

        mgr.get_metrics(vec![id("ns:db:a")]).await.unwrap();
        for _ in 0..100 {
            if !mgr.provisioned_tables().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(mgr.provisioned_tables().await, vec!["ns:db:a"]);
        mgr.stop().await;
    }
}
