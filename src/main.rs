use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use chain_crawler::app::App;
use chain_crawler::config::load_config;
use chain_crawler::shutdown::Shutdown;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long, env = "CRAWLER_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, env = "CRAWLER_LOG_JSON", default_value_t = false)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_tracing(args.json_logs);

    let config = load_config(args.config.as_deref())?;
    let shutdown = Shutdown::spawn(config.app.shutdown_timeout, config.app.shutdown_delay);

    let app = App::new(config, shutdown.clone()).await?;
    app.run().await?;

    shutdown.await_shutdown_begin().await;
    info!("Shutting down");

    if tokio::time::timeout(shutdown.timeout(), app.stop())
        .await
        .is_err()
    {
        tracing::warn!("tasks did not stop within the shutdown timeout");
    }
    tokio::time::sleep(shutdown.delay()).await;

    Ok(())
}

fn init_tracing(json_logs: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json_logs {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}
