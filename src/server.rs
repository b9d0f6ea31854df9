use anyhow::Result;
use axum::{routing::get, Router};
use std::{net::SocketAddr, sync::Arc};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    cache::TableInfoCache,
    collector::Collectors,
    config::{Config, HEALTH_PATH},
    driver::Connector,
    filter::TableFilter,
    handlers::{self, AppState},
    live::ChangeSubscriptionManager,
    logging::{redact_url, Redacted},
    metrics,
    pool::{build_pool, SessionPool},
    side_table::SideTableManager,
    signals::setup_signal_handlers,
    surreal::SurrealConnector,
    version::VersionReader,
};

/// Start the exporter
///
/// This function:
/// 1. Initializes metrics
/// 2. Sets up signal handlers for graceful shutdown
/// 3. Builds the session pool and the enabled collectors
/// 4. Serves scrapes until a shutdown signal arrives
/// 5. Stops the live query and side table managers
pub async fn start_server(config: Config) -> Result<()> {
    info!("Initializing Prometheus metrics...");
    let metrics_handle = Arc::new(metrics::init_metrics()?);

    let (shutdown_tx, signal_handle) = setup_signal_handlers();
    let mut shutdown_rx = shutdown_tx.subscribe();

    info!(
        url = %redact_url(&config.surrealdb.url),
        username = %config.surrealdb.username,
        password = %Redacted(&config.surrealdb.password),
        pooling = %config.surrealdb.pooling,
        "Configuring SurrealDB connection"
    );
    let connector: Arc<dyn Connector> =
        Arc::new(SurrealConnector::new(config.surrealdb.connector_config()));
    let pool = build_pool(config.surrealdb.pooling, connector);

    let collectors = Arc::new(build_collectors(&config, pool));
    let state = AppState {
        collectors: collectors.clone(),
        metrics_handle,
    };
    let app = create_router(state, &config.exporter.metrics_path);

    let addr = SocketAddr::from((
        config.exporter.host.parse::<std::net::IpAddr>()?,
        config.exporter.port,
    ));

    info!("Starting SurrealDB exporter on {}", addr);
    info!(
        metrics_path = %config.exporter.metrics_path,
        live_query = config.collectors.live_query.enabled,
        stats_table = config.collectors.stats_table.enabled,
        record_count = config.collectors.record_count.enabled,
        server_info = config.collectors.server_info.enabled,
        "Collectors configured"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            info!("Shutdown signal received, draining connections...");
        })
        .await?;

    collectors.stop().await;

    signal_handle.await?;
    info!("Exporter stopped gracefully");

    Ok(())
}

/// Assemble the collectors enabled in `config` around one session pool.
pub fn build_collectors(config: &Config, pool: Arc<dyn SessionPool>) -> Collectors {
    let stats = &config.collectors.stats_table;
    let cache = Arc::new(TableInfoCache::new());
    let mut collectors = Collectors::new(
        pool.clone(),
        cache,
        config.surrealdb.timeout(),
        stats.side_table_name_prefix.clone(),
    );

    if config.collectors.server_info.enabled {
        collectors = collectors.with_server_info(VersionReader::new(pool.clone(), config.surrealdb.timeout()));
    }

    let record_count = &config.collectors.record_count;
    if record_count.enabled {
        collectors = collectors.with_record_count(TableFilter::new(&record_count.tables));
    }

    let live = &config.collectors.live_query;
    if live.enabled {
        let manager = ChangeSubscriptionManager::new(pool.clone(), live.settings());
        collectors = collectors.with_live_queries(manager, TableFilter::new(&live.tables));
    }

    if stats.enabled {
        let manager = SideTableManager::new(pool, stats.settings());
        collectors = collectors.with_side_tables(manager, TableFilter::new(&stats.tables));
    }

    collectors
}

/// Create the Axum router
pub fn create_router(state: AppState, metrics_path: &str) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(handlers::health::health_check))
        .route(metrics_path, get(handlers::metrics_handler::metrics))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
