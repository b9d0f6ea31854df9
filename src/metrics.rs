use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

use crate::domain::{OperationAction, SideTableCounters, TableIdentifier, TableOperationMetrics};
use crate::schema::SchemaSnapshot;

/// Install the global Prometheus recorder and describe every metric.
pub fn init_metrics() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {}", e))?;

    init_metric_descriptions();

    Ok(handle)
}

/// Describe all metrics (can be called multiple times safely)
pub fn init_metric_descriptions() {
    describe_gauge!("surrealdb_up", "Whether the last schema discovery against SurrealDB succeeded");
    describe_gauge!(
        "surrealdb_scrape_collector_duration_seconds",
        "Duration of a collector scrape in seconds"
    );
    describe_gauge!(
        "surrealdb_scrape_collector_success",
        "Whether a collector succeeded during the last scrape"
    );
    describe_gauge!("surrealdb_info_namespaces_total", "Number of namespaces");
    describe_gauge!("surrealdb_info_databases_total", "Number of databases per namespace");
    describe_gauge!("surrealdb_info_tables_total", "Number of tables per database");
    describe_gauge!("surrealdb_table_record_count", "Number of records in a table");
    describe_counter!(
        "surrealdb_live_query_operations_total",
        "Operations observed through live queries, by operation and inferred type"
    );
    describe_counter!(
        "surrealdb_live_query_unknown_actions_total",
        "Live notifications with an unrecognised action"
    );
    describe_gauge!(
        "surrealdb_live_query_active_subscriptions",
        "Number of tables with a running live query worker"
    );
    describe_gauge!(
        "surrealdb_stats_table_operations",
        "Operations counted by side-table events, by operation and inferred type"
    );
    describe_gauge!(
        "surrealdb_stats_table_last_update_timestamp_seconds",
        "Unix time of the last side-table counter update"
    );
    describe_gauge!(
        "surrealdb_server_info",
        "SurrealDB server information, value 1 for the running version"
    );
    describe_gauge!(
        "surrealdb_exporter_build_info",
        "Exporter version and build information"
    );

    gauge!("surrealdb_exporter_build_info", "version" => env!("CARGO_PKG_VERSION")).set(1.0);
}

pub fn record_up(up: bool) {
    gauge!("surrealdb_up").set(if up { 1.0 } else { 0.0 });
}

/// Record how one collector did during a scrape
pub fn record_collector_scrape(collector: &'static str, duration: Duration, success: bool) {
    gauge!("surrealdb_scrape_collector_duration_seconds", "collector" => collector)
        .set(duration.as_secs_f64());
    gauge!("surrealdb_scrape_collector_success", "collector" => collector)
        .set(if success { 1.0 } else { 0.0 });
}

/// Mark `version` as the running server version. A replaced version drops to 0.
pub fn record_server_info(version: &str, previous: Option<&str>) {
    if let Some(previous) = previous.filter(|p| *p != version) {
        gauge!("surrealdb_server_info", "version" => previous.to_string()).set(0.0);
    }
    gauge!("surrealdb_server_info", "version" => version.to_string()).set(1.0);
}

pub fn record_schema(snapshot: &SchemaSnapshot) {
    gauge!("surrealdb_info_namespaces_total").set(snapshot.namespaces.len() as f64);
    for (namespace, databases) in &snapshot.namespaces {
        gauge!("surrealdb_info_databases_total", "namespace" => namespace.clone())
            .set(databases.len() as f64);
        for (database, tables) in databases {
            gauge!(
                "surrealdb_info_tables_total",
                "namespace" => namespace.clone(),
                "database" => database.clone(),
            )
            .set(tables.len() as f64);
        }
    }
}

pub fn record_table_record_count(table: &TableIdentifier, count: u64) {
    gauge!(
        "surrealdb_table_record_count",
        "namespace" => table.namespace.clone(),
        "database" => table.database.clone(),
        "table" => table.table.clone(),
    )
    .set(count as f64);
}

/// Add drained live-query counters. Zero values are skipped.
pub fn record_live_operations(metrics: &[TableOperationMetrics]) {
    for m in metrics {
        for action in OperationAction::COUNTED {
            let value = m.count(action);
            if value == 0 {
                continue;
            }
            counter!(
                "surrealdb_live_query_operations_total",
                "namespace" => m.table.namespace.clone(),
                "database" => m.table.database.clone(),
                "table" => m.table.table.clone(),
                "operation" => action.as_str(),
                "operation_type" => m.kind.as_str(),
            )
            .increment(value);
        }
    }
}

pub fn record_unknown_live_action(table: &TableIdentifier) {
    counter!(
        "surrealdb_live_query_unknown_actions_total",
        "namespace" => table.namespace.clone(),
        "database" => table.database.clone(),
        "table" => table.table.clone(),
    )
    .increment(1);
}

pub fn record_active_subscriptions(count: usize) {
    gauge!("surrealdb_live_query_active_subscriptions").set(count as f64);
}

/// Publish side-table counters as gauges
pub fn record_side_table_counters(counters: &[SideTableCounters]) {
    for c in counters {
        for (action, kind, value) in c.iter() {
            gauge!(
                "surrealdb_stats_table_operations",
                "namespace" => c.table.namespace.clone(),
                "database" => c.table.database.clone(),
                "table" => c.table.table.clone(),
                "operation" => action.as_str(),
                "operation_type" => kind.as_str(),
            )
            .set(value as f64);
        }
        if let Some(last_update) = c.last_update {
            gauge!(
                "surrealdb_stats_table_last_update_timestamp_seconds",
                "namespace" => c.table.namespace.clone(),
                "database" => c.table.database.clone(),
                "table" => c.table.table.clone(),
            )
            .set(last_update.timestamp() as f64);
        }
    }
}
