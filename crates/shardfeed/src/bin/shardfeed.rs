use anyhow::Context;
use clap::Parser;
use shardfeed::source::SourceRegistry;
use shardfeed::store::PgStore;
use shardfeed::{IngestConfig, Pipeline};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Polls a data source and fans every batch out to sharded PostgreSQL tables.
#[derive(Parser, Debug)]
#[command(name = "shardfeed", version, about)]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(long, env = "SHARDFEED_CONFIG", default_value = "config.yaml")]
    config: PathBuf,

    /// Stop after this many seconds instead of waiting for Ctrl-C.
    #[arg(long, value_name = "SECONDS")]
    run_for: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    shardfeed::logging::init_logging();
    let args = Args::parse();

    let config = IngestConfig::from_file(&args.config)
        .with_context(|| format!("failed to load configuration from {}", args.config.display()))?;

    let registry = SourceRegistry::with_builtin();
    let source = registry
        .create(&config.source)
        .with_context(|| format!("failed to create source '{}'", config.source.name))?;
    source
        .validate()
        .await
        .with_context(|| format!("source '{}' failed validation", source.name()))?;

    let store = PgStore::connect(&config.store).await.with_context(|| {
        format!(
            "unable to connect to postgres at {}:{}/{}",
            config.store.host, config.store.port, config.store.dbname
        )
    })?;

    let pipeline = Pipeline::start(&config.shards, &config.pipeline, source, Arc::new(store)).await;

    match args.run_for {
        Some(secs) => {
            info!("running for {secs} seconds");
            tokio::time::sleep(Duration::from_secs(secs)).await;
        }
        None => {
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for Ctrl-C")?;
            info!("received Ctrl-C");
        }
    }

    let report = pipeline.stop().await?;
    info!(
        "{} fetches ({} failed), {} records inserted, {} failed",
        report.poller.ticks,
        report.poller.failures,
        report.inserted(),
        report.failed()
    );
    Ok(())
}
