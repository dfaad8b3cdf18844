use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tradestat_core::HarvestRequest;
use tradestat_harvest::{HarvestConfig, HarvestService};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tradestat-cli")]
#[command(about = "Trade statistics harvester")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start the HTTP API.
    Serve,
    /// Run one harvest in the foreground; Ctrl-C cancels it.
    Harvest {
        country: String,
        hs_code: String,
        hs_level: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => tradestat_web::serve_from_env().await?,
        Commands::Harvest {
            country,
            hs_code,
            hs_level,
        } => {
            let service = HarvestService::from_config(HarvestConfig::from_env());
            let running = service.start(HarvestRequest::new(country, hs_code, hs_level))?;

            let registry = Arc::clone(service.registry());
            let operation_id = running.operation_id().to_string();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    registry.cancel(&operation_id);
                }
            });

            let saved = running.finish().await?;
            println!(
                "harvest complete: file={} records={}",
                saved.path.display(),
                saved.records
            );
        }
    }

    Ok(())
}
