use anyhow::Result;
use clap::{Parser, Subcommand};
use skusync_sync::{SweepOutcome, SyncConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "skusync")]
#[command(about = "Keeps Shopify variant SKUs aligned with the Bsale catalog")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP server and the sweep scheduler.
    Serve,
    /// Run a single SKU sweep and print the result.
    Sync,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_json = std::env::var("SKUSYNC_LOG_JSON")
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
        .unwrap_or(false);
    init_tracing(log_json);

    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => skusync_web::serve(config).await?,
        Commands::Sync => match skusync_sync::run_sweep_once(&config).await? {
            SweepOutcome::Completed(result) => {
                println!(
                    "sync complete: processed={} updated={}",
                    result.processed, result.updated
                );
            }
            SweepOutcome::Skipped { reason } => println!("sync skipped: {reason}"),
            SweepOutcome::AlreadyRunning => println!("sync skipped: a sweep is already running"),
        },
    }

    Ok(())
}
