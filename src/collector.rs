//! Scrape orchestration.
//!
//! Every scrape refreshes the table cache from the schema, then runs the
//! enabled collectors concurrently against the filtered table list.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::cache::TableInfoCache;
use crate::domain::{TableIdentifier, TableInfo};
use crate::filter::TableFilter;
use crate::live::ChangeSubscriptionManager;
use crate::metrics;
use crate::pool::SessionPool;
use crate::schema::SchemaReader;
use crate::side_table::SideTableManager;
use crate::version::VersionReader;

pub const INFO_COLLECTOR: &str = "info";
pub const SERVER_INFO_COLLECTOR: &str = "server_info";
pub const RECORD_COUNT_COLLECTOR: &str = "record_count";
pub const LIVE_QUERY_COLLECTOR: &str = "live_query";
pub const STATS_TABLE_COLLECTOR: &str = "stats_table";

pub struct Collectors {
    schema: SchemaReader,
    cache: Arc<TableInfoCache>,
    side_table_prefix: String,
    server_info: Option<VersionReader>,
    // Version last published, so a change can retire the old series
    reported_version: Mutex<Option<String>>,
    record_count: Option<TableFilter>,
    live: Option<(Arc<ChangeSubscriptionManager>, TableFilter)>,
    side_tables: Option<(Arc<SideTableManager>, TableFilter)>,
}

impl Collectors {
    pub fn new(
        pool: Arc<dyn SessionPool>,
        cache: Arc<TableInfoCache>,
        timeout: Duration,
        side_table_prefix: impl Into<String>,
    ) -> Self {
        Self {
            schema: SchemaReader::new(pool, timeout),
            cache,
            side_table_prefix: side_table_prefix.into(),
            server_info: None,
            reported_version: Mutex::new(None),
            record_count: None,
            live: None,
            side_tables: None,
        }
    }

    pub fn with_server_info(mut self, reader: VersionReader) -> Self {
        self.server_info = Some(reader);
        self
    }

    pub fn with_record_count(mut self, filter: TableFilter) -> Self {
        self.record_count = Some(filter);
        self
    }

    pub fn with_live_queries(mut self, manager: Arc<ChangeSubscriptionManager>, filter: TableFilter) -> Self {
        self.live = Some((manager, filter));
        self
    }

    pub fn with_side_tables(mut self, manager: Arc<SideTableManager>, filter: TableFilter) -> Self {
        self.side_tables = Some((manager, filter));
        self
    }

    pub fn cache(&self) -> &Arc<TableInfoCache> {
        &self.cache
    }

    /// Run one scrape. Results land in the global metrics recorder.
    pub async fn collect(&self) {
        tokio::join!(
            timed(INFO_COLLECTOR, self.refresh_schema()),
            self.collect_server_info(),
        );

        let tables = self.cache.get().await;
        tokio::join!(
            self.collect_record_counts(&tables),
            self.collect_live_queries(&tables),
            self.collect_side_tables(&tables),
        );
    }

    /// Stop background work of both managers.
    pub async fn stop(&self) {
        if let Some((manager, _)) = &self.live {
            manager.stop().await;
        }
        if let Some((manager, _)) = &self.side_tables {
            manager.stop().await;
        }
    }

    async fn refresh_schema(&self) -> bool {
        match self.schema.discover().await {
            Ok(snapshot) => {
                metrics::record_schema(&snapshot);
                self.cache.set(snapshot.tables()).await;
                metrics::record_up(true);
                true
            }
            Err(e) => {
                // Keep serving the previous snapshot
                warn!(error = %e, "Schema discovery failed");
                metrics::record_up(false);
                false
            }
        }
    }

    async fn collect_server_info(&self) {
        let Some(reader) = &self.server_info else {
            return;
        };
        timed(SERVER_INFO_COLLECTOR, async {
            match reader.version().await {
                Ok(version) => {
                    let mut reported = self.reported_version.lock().await;
                    metrics::record_server_info(&version, reported.as_deref());
                    *reported = Some(version);
                    true
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read server version");
                    false
                }
            }
        })
        .await;
    }

    async fn collect_record_counts(&self, tables: &[TableInfo]) {
        let Some(filter) = &self.record_count else {
            return;
        };
        timed(RECORD_COUNT_COLLECTOR, async {
            let desired = self.desired(filter, tables);
            let counts = self.schema.record_counts(&desired).await;
            for (table, count) in &counts {
                metrics::record_table_record_count(table, *count);
            }
            // Every table failing means the collector failed
            desired.is_empty() || !counts.is_empty()
        })
        .await;
    }

    async fn collect_live_queries(&self, tables: &[TableInfo]) {
        let Some((manager, filter)) = &self.live else {
            return;
        };
        timed(LIVE_QUERY_COLLECTOR, async {
            match manager.get_metrics(self.desired(filter, tables)).await {
                Ok(drained) => {
                    debug!(entries = drained.len(), "Drained live query counters");
                    metrics::record_live_operations(&drained);
                    true
                }
                Err(e) => {
                    warn!(error = %e, "Live query collector failed");
                    false
                }
            }
        })
        .await;
    }

    async fn collect_side_tables(&self, tables: &[TableInfo]) {
        let Some((manager, filter)) = &self.side_tables else {
            return;
        };
        timed(STATS_TABLE_COLLECTOR, async {
            match manager.get_metrics(self.desired(filter, tables)).await {
                Ok(counters) => {
                    metrics::record_side_table_counters(&counters);
                    true
                }
                Err(e) => {
                    warn!(error = %e, "Side table collector failed");
                    false
                }
            }
        })
        .await;
    }

    /// Filtered tables, without the side tables this exporter creates.
    fn desired(&self, filter: &TableFilter, tables: &[TableInfo]) -> Vec<TableIdentifier> {
        filter
            .filter_tables(tables)
            .into_iter()
            .filter(|t| !t.table.starts_with(&self.side_table_prefix))
            .collect()
    }
}

async fn timed(collector: &'static str, fut: impl Future<Output = bool>) {
    let start = Instant::now();
    let success = fut.await;
    metrics::record_collector_scrape(collector, start.elapsed(), success);
}
