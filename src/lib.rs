pub mod cache;
pub mod collector;
pub mod config;
pub mod domain;
pub mod driver;
pub mod error;
pub mod filter;
pub mod handlers;
pub mod live;
pub mod logging;
pub mod metrics;
pub mod pool;
pub mod reconcile;
pub mod schema;
pub mod server;
pub mod side_table;
pub mod signals;
pub mod surreal;
pub mod version;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize tracing/logging for commands that do not serve
///
/// Note: This function can only be called once. The `start` command uses
/// [`logging::init_logging`] instead.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();
}
