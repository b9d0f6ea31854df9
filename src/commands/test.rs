use anyhow::Result;
use colored::Colorize;
use std::path::Path;
use surrealdb_exporter::{
    config::{self, Config},
    driver::{query_one, Connector, Session},
    filter::TableFilterConfig,
    logging::redact_url,
    surreal::SurrealConnector,
};
use tracing::info;

/// Execute the test command
///
/// Validates the configuration file, then signs in to SurrealDB and runs
/// `INFO FOR ROOT` without starting the exporter.
pub async fn execute(config_path: &Path) -> Result<()> {
    println!("{}", "Testing configuration...".yellow());
    info!(config = %config_path.display(), "Loading and validating configuration");

    let cfg = config::load_config(config_path)?;

    println!("{}", "✓ Configuration test successful".green());
    println!();
    print_summary(&cfg);

    println!("{}", "Connecting to SurrealDB...".yellow());
    let connector = SurrealConnector::new(cfg.surrealdb.connector_config());
    let session = match connector.connect().await {
        Ok(session) => session,
        Err(e) => {
            println!("{} {}", "✗ Connection failed:".red(), e);
            return Err(e.into());
        }
    };
    println!("{}", "✓ Connected and authenticated".green());

    let info = match query_one(session.as_ref(), "INFO FOR ROOT").await {
        Ok(info) => info,
        Err(e) => {
            println!("{} {}", "✗ INFO FOR ROOT failed:".red(), e);
            return Err(e.into());
        }
    };
    let namespaces = info
        .get("namespaces")
        .and_then(|n| n.as_object())
        .map(|n| n.len())
        .unwrap_or(0);
    println!("{} ({} namespaces visible)", "✓ INFO FOR ROOT succeeded".green(), namespaces);

    match session.version().await {
        Ok(version) => println!("{} {}", "✓ Server version:".green(), version),
        Err(e) => println!("{} {}", "! Server version unavailable:".yellow(), e),
    }

    info!("Connection test completed successfully");
    Ok(())
}

fn print_summary(cfg: &Config) {
    println!("{}", "Configuration Summary:".bold());
    println!(
        "  {}: {}:{}{}",
        "Exporter".cyan(),
        cfg.exporter.host,
        cfg.exporter.port,
        cfg.exporter.metrics_path
    );
    println!("  {}: {}", "SurrealDB".cyan(), redact_url(&cfg.surrealdb.url));
    println!("    User: {}", cfg.surrealdb.username);
    println!("    Pooling: {}", cfg.surrealdb.pooling);
    println!("    Timeout: {}s", cfg.surrealdb.timeout_seconds);
    println!(
        "  {}: {} ({:?})",
        "Logging".cyan(),
        cfg.logging.level,
        cfg.logging.format
    );
    println!();

    println!("{}", "Collectors:".cyan());
    let collectors = &cfg.collectors;
    print_collector("live_query", collectors.live_query.enabled, &collectors.live_query.tables);
    if collectors.live_query.enabled {
        println!(
            "      reconnect: every {}s, at most {} attempts",
            collectors.live_query.reconnect_delay_seconds,
            collectors.live_query.max_reconnect_attempts
        );
    }
    print_collector("stats_table", collectors.stats_table.enabled, &collectors.stats_table.tables);
    if collectors.stats_table.enabled {
        println!(
            "      prefix: {}, remove orphans: {}",
            collectors.stats_table.side_table_name_prefix,
            collectors.stats_table.remove_orphan_tables
        );
    }
    print_collector("record_count", collectors.record_count.enabled, &collectors.record_count.tables);
    println!("    server_info: {}", enabled_label(collectors.server_info.enabled));
    println!();
}

fn enabled_label(enabled: bool) -> colored::ColoredString {
    if enabled {
        "enabled".green()
    } else {
        "disabled".red()
    }
}

fn print_collector(name: &str, enabled: bool, tables: &TableFilterConfig) {
    println!("    {}: {}", name, enabled_label(enabled));
    if enabled {
        for pattern in &tables.include {
            println!("      + {}", pattern);
        }
        for pattern in &tables.exclude {
            println!("      - {}", pattern);
        }
    }
}
