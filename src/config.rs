use anyhow::Context;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::filter::TableFilterConfig;
use crate::live::LiveQuerySettings;
use crate::pool::PoolingDiscipline;
use crate::side_table::{SideTableSettings, DEFAULT_SIDE_TABLE_PREFIX};
use crate::surreal::SurrealConfig;

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";
pub const ENV_PREFIX: &str = "SURREALDB_EXPORTER";
pub const HEALTH_PATH: &str = "/health";

const MIN_TIMEOUT_SECONDS: u64 = 1;
const MAX_TIMEOUT_SECONDS: u64 = 300;
const TABLE_PATTERN: &str = r"^[a-zA-Z0-9_*?\[\]-]+:[a-zA-Z0-9_*?\[\]-]+:[a-zA-Z0-9_*?\[\]-]+$";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub exporter: ExporterConfig,
    pub surrealdb: SurrealDbConfig,
    pub collectors: CollectorsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExporterConfig {
    pub host: String,
    pub port: u16,
    pub metrics_path: String,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9224,
            metrics_path: "/metrics".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SurrealDbConfig {
    pub url: String,
    pub username: String,
    pub password: String,
    pub timeout_seconds: u64,
    pub pooling: PoolingDiscipline,
}

impl Default for SurrealDbConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8000".to_string(),
            username: "root".to_string(),
            password: "root".to_string(),
            timeout_seconds: 10,
            pooling: PoolingDiscipline::Multi,
        }
    }
}

impl SurrealDbConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn connector_config(&self) -> SurrealConfig {
        SurrealConfig {
            endpoint: self.url.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            timeout: self.timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct CollectorsConfig {
    pub live_query: LiveQueryConfig,
    pub stats_table: StatsTableConfig,
    pub record_count: RecordCountConfig,
    pub server_info: ServerInfoConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerInfoConfig {
    pub enabled: bool,
}

impl Default for ServerInfoConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LiveQueryConfig {
    pub enabled: bool,
    pub tables: TableFilterConfig,
    pub reconnect_delay_seconds: u64,
    pub max_reconnect_attempts: u32,
}

impl Default for LiveQueryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            tables: TableFilterConfig::default(),
            reconnect_delay_seconds: 5,
            max_reconnect_attempts: 10,
        }
    }
}

impl LiveQueryConfig {
    pub fn settings(&self) -> LiveQuerySettings {
        LiveQuerySettings {
            reconnect_delay: Duration::from_secs(self.reconnect_delay_seconds),
            max_reconnect_attempts: self.max_reconnect_attempts,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StatsTableConfig {
    pub enabled: bool,
    pub tables: TableFilterConfig,
    pub remove_orphan_tables: bool,
    pub side_table_name_prefix: String,
}

impl Default for StatsTableConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            tables: TableFilterConfig::default(),
            remove_orphan_tables: false,
            side_table_name_prefix: DEFAULT_SIDE_TABLE_PREFIX.to_string(),
        }
    }
}

impl StatsTableConfig {
    pub fn settings(&self) -> SideTableSettings {
        SideTableSettings {
            prefix: self.side_table_name_prefix.clone(),
            remove_orphans: self.remove_orphan_tables,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RecordCountConfig {
    pub enabled: bool,
    pub tables: TableFilterConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

/// Load configuration from `path` layered with `SURREALDB_EXPORTER__*` environment variables,
/// then validate it.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let mut cfg = read_config(path)?;
    cfg.validate()?;
    Ok(cfg)
}

/// Read configuration without validating it.
///
/// A missing file is only tolerated for the default path, in which case
/// defaults and the environment apply.
pub fn read_config(path: &Path) -> anyhow::Result<Config> {
    if !path.exists() && path != Path::new(DEFAULT_CONFIG_PATH) {
        anyhow::bail!("Config file not found: {}", path.display());
    }

    let config = config::Config::builder()
        .add_source(config::File::from(path).required(false))
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("Failed to read config from {}", path.display()))?;

    Ok(config.try_deserialize()?)
}

impl Config {
    /// Reject invalid settings and repair recoverable ones in place.
    pub fn validate(&mut self) -> anyhow::Result<()> {
        if self.exporter.port == 0 {
            anyhow::bail!("exporter.port must be greater than 0");
        }
        if !self.exporter.metrics_path.starts_with('/') {
            anyhow::bail!(
                "exporter.metrics_path must start with '/': {}",
                self.exporter.metrics_path
            );
        }
        if self.exporter.metrics_path == HEALTH_PATH {
            anyhow::bail!("exporter.metrics_path cannot be {}", HEALTH_PATH);
        }

        self.surrealdb.url = normalize_url(&self.surrealdb.url)?;

        let clamped = self
            .surrealdb
            .timeout_seconds
            .clamp(MIN_TIMEOUT_SECONDS, MAX_TIMEOUT_SECONDS);
        if clamped != self.surrealdb.timeout_seconds {
            warn!(
                configured = self.surrealdb.timeout_seconds,
                using = clamped,
                "surrealdb.timeout_seconds out of range"
            );
            self.surrealdb.timeout_seconds = clamped;
        }

        let live = &mut self.collectors.live_query;
        if live.max_reconnect_attempts == 0 {
            anyhow::bail!("collectors.live_query.max_reconnect_attempts must be greater than 0");
        }
        if live.reconnect_delay_seconds == 0 {
            warn!("collectors.live_query.reconnect_delay_seconds is 0, using 1");
            live.reconnect_delay_seconds = 1;
        }

        if self.collectors.stats_table.side_table_name_prefix.is_empty() {
            anyhow::bail!("collectors.stats_table.side_table_name_prefix cannot be empty");
        }

        let pattern = Regex::new(TABLE_PATTERN).context("Invalid table pattern regex")?;
        for (collector, tables) in [
            ("live_query", &mut self.collectors.live_query.tables),
            ("stats_table", &mut self.collectors.stats_table.tables),
            ("record_count", &mut self.collectors.record_count.tables),
        ] {
            retain_valid_patterns(collector, &mut tables.include, &pattern);
            retain_valid_patterns(collector, &mut tables.exclude, &pattern);
        }

        Ok(())
    }
}

fn retain_valid_patterns(collector: &str, patterns: &mut Vec<String>, pattern: &Regex) {
    patterns.retain(|p| {
        let valid = pattern.is_match(p);
        if !valid {
            warn!(collector, pattern = %p, "Ignoring invalid table pattern, expected namespace:database:table");
        }
        valid
    });
}

/// Map `http(s)` onto `ws(s)` and default the path to `/rpc`.
fn normalize_url(url: &str) -> anyhow::Result<String> {
    let (scheme, rest) = url
        .split_once("://")
        .with_context(|| format!("Invalid surrealdb.url '{}': missing scheme", url))?;

    let scheme = match scheme.to_ascii_lowercase().as_str() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => anyhow::bail!(
            "Invalid surrealdb.url '{}': unsupported scheme '{}' (expected ws, wss, http or https)",
            url,
            other
        ),
    };

    let rest = rest.trim_end_matches('/');
    if rest.is_empty() {
        anyhow::bail!("Invalid surrealdb.url '{}': missing host", url);
    }

    if rest.contains('/') {
        Ok(format!("{}://{}", scheme, rest))
    } else {
        Ok(format!("{}://{}/rpc", scheme, rest))
    }
}
