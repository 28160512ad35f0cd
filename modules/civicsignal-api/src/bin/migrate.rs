//! Apply the embedded schema migrations and exit.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use civicsignal_store::PgStore;

#[derive(Parser)]
#[command(name = "civicsignal-migrate", about = "Run CivicSignal database migrations")]
struct Cli {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Seconds to wait for a connection
    #[arg(long, default_value_t = 30)]
    connect_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("civicsignal=info".parse()?))
        .init();

    let cli = Cli::parse();

    let store = PgStore::connect(&cli.database_url, Duration::from_secs(cli.connect_timeout))
        .await
        .context("Failed to connect to Postgres")?;
    store.migrate().await.context("Failed to run migrations")?;

    info!("Migrations complete");
    Ok(())
}
