use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;

use surrealdb_exporter::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    let command = args.get_command();

    // `start` configures logging from the config file
    if command != cli::Commands::Start {
        init_tracing();
    }

    match command {
        cli::Commands::Start => {
            commands::start::execute(&args.config).await?;
        }
        cli::Commands::Test => {
            commands::test::execute(&args.config).await?;
        }
        cli::Commands::Version => {
            println!("SurrealDB Exporter v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
