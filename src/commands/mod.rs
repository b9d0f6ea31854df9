//! Command implementations for the CLI
//!
//! - start: Run the exporter until SIGINT/SIGTERM
//! - test: Validate configuration and check the SurrealDB connection

pub mod start;
pub mod test;
