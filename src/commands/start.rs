use anyhow::Result;
use std::path::Path;
use surrealdb_exporter::{config, logging, server};
use tracing::info;

/// Execute the start command
///
/// Logging is configured from the file, so it is installed before validation
/// to keep validation warnings.
pub async fn execute(config_path: &Path) -> Result<()> {
    let mut cfg = config::read_config(config_path)?;
    logging::init_logging(&cfg.logging)?;
    cfg.validate()?;

    info!(
        config = %config_path.display(),
        version = env!("CARGO_PKG_VERSION"),
        "Starting SurrealDB exporter"
    );

    // Blocks until shutdown
    server::start_server(cfg).await
}
