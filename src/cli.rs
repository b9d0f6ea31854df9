use clap::{Parser, Subcommand};
use std::path::PathBuf;

use surrealdb_exporter::config::DEFAULT_CONFIG_PATH;

#[derive(Parser, Debug)]
#[command(name = "surrealdb-exporter", version, about = "Prometheus exporter for SurrealDB")]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, global = true)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Start the exporter (default)
    Start,

    /// Validate the configuration and check the SurrealDB connection
    Test,

    /// Show version information
    Version,
}

impl Cli {
    /// Get the command to execute, defaulting to Start if none provided
    pub fn get_command(&self) -> Commands {
        self.command.clone().unwrap_or(Commands::Start)
    }
}
